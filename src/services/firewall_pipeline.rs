//! Firewall pipeline
//! 对最新一条消息并行调用所有已启用防火墙的分类器，一次性记录全部事件后按逻辑或聚合

use crate::{
    classifier::ClassifierError,
    context::CallContext,
    error::{AppError, Result},
    models::{
        audit::NewFirewallEvent,
        firewall::{FirewallAssessment, FirewallDecision, RiskScore},
        payload::Message,
    },
    registry::{FirewallRegistry, RegisteredFirewall},
    repository::AuditStore,
};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// 一次管道评估的结果
#[derive(Debug)]
pub struct PipelineOutcome {
    pub decision: FirewallDecision,
    /// 按配置顺序，每个已启用防火墙一项
    pub assessments: Vec<FirewallAssessment>,
    /// fail-closed 的分类器错误，需上报给调用方
    pub evaluation_errors: Vec<AppError>,
}

impl PipelineOutcome {
    pub fn is_blocked(&self) -> bool {
        self.decision.blocked
    }
}

/// 防火墙管道
#[derive(Clone)]
pub struct FirewallPipeline {
    registry: Arc<FirewallRegistry>,
    store: Arc<dyn AuditStore>,
    classifier_timeout: Duration,
}

impl FirewallPipeline {
    pub fn new(
        registry: Arc<FirewallRegistry>,
        store: Arc<dyn AuditStore>,
        classifier_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            classifier_timeout,
        }
    }

    pub fn registry(&self) -> &FirewallRegistry {
        &self.registry
    }

    /// 评估消息并记录每个防火墙的事件
    ///
    /// 不短路：即使前面的防火墙已拦截，其余防火墙仍会被评估和记录。
    /// 每个防火墙的事件在一次存储调用中整体写入：要么全部落库，要么一条都不写。
    /// 调用方取消或截止时间到达时返回 `Cancelled`，不写入任何事件。
    pub async fn evaluate(
        &self,
        ctx: &CallContext,
        correlation_id: Uuid,
        message: &Message,
    ) -> Result<PipelineOutcome> {
        let firewalls: Vec<&RegisteredFirewall> = self.registry.enabled().collect();
        if firewalls.is_empty() {
            tracing::debug!(correlation_id = %correlation_id, "No enabled firewalls, request allowed");
            return Ok(PipelineOutcome {
                decision: FirewallDecision::allow(),
                assessments: Vec::new(),
                evaluation_errors: Vec::new(),
            });
        }

        let started = Instant::now();
        let results = join_all(
            firewalls
                .iter()
                .map(|firewall| self.assess(ctx, firewall, &message.content)),
        )
        .await;

        let mut assessments = Vec::with_capacity(results.len());
        let mut evaluation_errors = Vec::new();
        for (firewall, (evaluated_at, result)) in firewalls.iter().zip(results) {
            match result {
                Ok(assessment) => assessments.push(assessment),
                Err(err @ AppError::Cancelled(_)) => {
                    tracing::warn!(
                        correlation_id = %correlation_id,
                        firewall_id = %firewall.config.id,
                        error = %err,
                        "Firewall evaluation cancelled"
                    );
                    return Err(err);
                }
                Err(err) => {
                    tracing::error!(
                        correlation_id = %correlation_id,
                        firewall_id = %firewall.config.id,
                        error = %err,
                        "Classifier failed, firewall fails closed"
                    );
                    assessments.push(FirewallAssessment::fail_closed(
                        &firewall.config,
                        err.to_string(),
                        evaluated_at,
                    ));
                    evaluation_errors.push(AppError::FirewallEvaluation {
                        firewall_id: firewall.config.id.clone(),
                        message: err.to_string(),
                    });
                }
            }
        }

        let events: Vec<NewFirewallEvent> = assessments
            .iter()
            .map(|assessment| NewFirewallEvent::from_assessment(correlation_id, assessment))
            .collect();
        self.store.log_firewall_events(ctx, &events).await?;

        for assessment in &assessments {
            let outcome = if assessment.is_fail_closed() {
                "error"
            } else if assessment.blocked {
                "block"
            } else {
                "pass"
            };
            metrics::counter!(
                "firewall_evaluations_total",
                "firewall_type" => assessment.firewall_type.as_str(),
                "outcome" => outcome
            )
            .increment(1);
        }

        let decision = FirewallDecision::aggregate(&assessments);
        if decision.blocked {
            tracing::warn!(
                correlation_id = %correlation_id,
                reason = decision.reason.as_deref().unwrap_or_default(),
                evaluated = assessments.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Request blocked by firewall"
            );
        } else {
            tracing::info!(
                correlation_id = %correlation_id,
                evaluated = assessments.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Firewall evaluation passed"
            );
        }

        Ok(PipelineOutcome {
            decision,
            assessments,
            evaluation_errors,
        })
    }

    /// 评估单个防火墙，返回分类器结束（成功或失败）的时刻
    async fn assess(
        &self,
        ctx: &CallContext,
        firewall: &RegisteredFirewall,
        text: &str,
    ) -> (DateTime<Utc>, Result<FirewallAssessment>) {
        let started = Instant::now();
        let score = ctx
            .run("classifier", Some(self.classifier_timeout), async {
                firewall
                    .classifier
                    .classify(text)
                    .await
                    .map_err(|e| classifier_error(&firewall.config.id, e))
            })
            .await;
        let evaluated_at = Utc::now();

        metrics::histogram!(
            "firewall_evaluation_seconds",
            "firewall_type" => firewall.config.kind.as_str()
        )
        .record(started.elapsed().as_secs_f64());

        let score = match score.and_then(|raw| {
            RiskScore::new(raw).map_err(|e| AppError::FirewallEvaluation {
                firewall_id: firewall.config.id.clone(),
                message: format!("malformed classifier response: {}", e),
            })
        }) {
            Ok(score) => score,
            Err(err) => return (evaluated_at, Err(err)),
        };

        let assessment = FirewallAssessment::from_score(&firewall.config, score, evaluated_at);
        tracing::debug!(
            firewall_id = %firewall.config.id,
            classifier = %firewall.classifier.name(),
            risk_score = score.get(),
            blocked = assessment.blocked,
            "Firewall evaluated"
        );
        (evaluated_at, Ok(assessment))
    }
}

fn classifier_error(firewall_id: &str, err: ClassifierError) -> AppError {
    match err {
        ClassifierError::Unreachable(_) | ClassifierError::Timeout => {
            AppError::Connectivity(format!("firewall {}: {}", firewall_id, err))
        }
        ClassifierError::Malformed(_) => AppError::FirewallEvaluation {
            firewall_id: firewall_id.to_string(),
            message: err.to_string(),
        },
    }
}
