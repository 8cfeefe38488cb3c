//! Gateway service
//! 网关核心钩子：校验 → 记录请求 → 防火墙评估 → 放行/拦截；上游完成后记录响应

use crate::{
    classifier::ClassifierSet,
    config::AppConfig,
    context::CallContext,
    error::{AppError, Result},
    models::{
        audit::{ArchiveRecord, CallerIdentity, NewRequest, NewResponse, Trace},
        firewall::FirewallAssessment,
        payload::{GeneratePayload, GenerateRequest, ModelLookup},
    },
    registry::{FirewallRegistry, StaticModelRegistry},
    repository::AuditStore,
    services::firewall_pipeline::FirewallPipeline,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// 返回给调用层的判定
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Verdict {
    /// 放行，调用层继续转发到上游
    Proceed,
    /// 被防火墙拦截
    Blocked {
        reason: String,
        /// 评估出错而按拦截处理的防火墙 ID
        #[serde(skip_serializing_if = "Vec::is_empty")]
        failed_firewalls: Vec<String>,
    },
}

/// 一次准入的结果
#[derive(Debug, Clone, Serialize)]
pub struct Admission {
    pub correlation_id: Uuid,
    pub model: String,
    pub provider: String,
    pub target_url: String,
    pub verdict: Verdict,
    pub firewalls: Vec<FirewallAssessment>,
    #[serde(skip)]
    pub payload: GeneratePayload,
}

impl Admission {
    pub fn is_blocked(&self) -> bool {
        matches!(self.verdict, Verdict::Blocked { .. })
    }
}

pub struct GatewayService {
    store: Arc<dyn AuditStore>,
    pipeline: FirewallPipeline,
    models: Arc<dyn ModelLookup>,
}

impl GatewayService {
    pub fn new(
        store: Arc<dyn AuditStore>,
        pipeline: FirewallPipeline,
        models: Arc<dyn ModelLookup>,
    ) -> Self {
        Self {
            store,
            pipeline,
            models,
        }
    }

    /// 按配置装配：本地分类器 → 防火墙注册表 → 模型注册表
    pub fn from_config(config: &AppConfig, store: Arc<dyn AuditStore>) -> Result<Self> {
        let classifiers = ClassifierSet::from_settings(&config.classifiers)
            .map_err(|e| AppError::Config(format!("invalid classifier pattern: {}", e)))?;
        let registry = FirewallRegistry::from_settings(&config.firewalls, &classifiers)?;
        let models = StaticModelRegistry::from_settings(&config.models)
            .map_err(|e| AppError::Config(e.to_string()))?;

        tracing::info!(
            classifiers = classifiers.len(),
            firewalls = registry.len(),
            models = models.len(),
            "Gateway configured"
        );

        let pipeline = FirewallPipeline::new(
            Arc::new(registry),
            store.clone(),
            Duration::from_millis(config.gateway.classifier_timeout_ms),
        );
        Ok(Self::new(store, pipeline, Arc::new(models)))
    }

    /// 已启用的防火墙数量
    pub fn firewall_count(&self) -> usize {
        self.pipeline.registry().enabled().count()
    }

    /// 准入一次入站调用
    ///
    /// 校验失败时不写任何审计记录；校验通过后先落请求记录，再评估防火墙。
    pub async fn admit(
        &self,
        ctx: &CallContext,
        caller: &CallerIdentity,
        raw: Value,
    ) -> Result<Admission> {
        let payload = GenerateRequest::from_value(raw)?.into_payload(self.models.as_ref())?;

        let request = NewRequest::from_payload(&payload, caller);
        let correlation_id = self.store.log_request(ctx, &request).await?;

        let outcome = self
            .pipeline
            .evaluate(ctx, correlation_id, payload.latest_message())
            .await?;

        let verdict = if outcome.is_blocked() {
            Verdict::Blocked {
                reason: outcome.decision.reason.clone().unwrap_or_default(),
                failed_firewalls: outcome
                    .assessments
                    .iter()
                    .filter(|a| a.is_fail_closed())
                    .map(|a| a.firewall_id.clone())
                    .collect(),
            }
        } else {
            Verdict::Proceed
        };

        tracing::info!(
            correlation_id = %correlation_id,
            user_id = %caller.user_id,
            model = %payload.model.name,
            blocked = outcome.is_blocked(),
            "Request admitted"
        );

        Ok(Admission {
            correlation_id,
            model: payload.model.name.to_string(),
            provider: payload.model.provider.clone(),
            target_url: payload.model.target_url.clone(),
            verdict,
            firewalls: outcome.assessments,
            payload,
        })
    }

    /// 上游调用完成后记录响应
    pub async fn record_completion(
        &self,
        ctx: &CallContext,
        correlation_id: Uuid,
        response: Value,
        latency_ms: u32,
    ) -> Result<()> {
        let response = NewResponse::new(correlation_id, &response, latency_ms)?;
        self.store.log_response(ctx, &response).await?;

        tracing::info!(
            correlation_id = %correlation_id,
            latency_ms = latency_ms,
            "Completion recorded"
        );
        Ok(())
    }

    pub async fn trace(&self, ctx: &CallContext, correlation_id: Uuid) -> Result<Trace> {
        self.store.get_trace(ctx, correlation_id).await
    }

    /// 登记冷存储归档
    pub async fn archive(
        &self,
        ctx: &CallContext,
        correlation_id: Uuid,
        location: &str,
    ) -> Result<ArchiveRecord> {
        self.store.archive_trace(ctx, correlation_id, location).await
    }
}
