//! 防火墙管道与网关准入集成测试

use async_trait::async_trait;
use covalence::{
    classifier::ClassifierError,
    context::CallContext,
    error::{AppError, Result},
    models::{
        audit::{ArchiveRecord, CallerIdentity, NewFirewallEvent, NewRequest, NewResponse, Trace},
        firewall::{FirewallType, EVALUATION_ERROR_REASON},
        payload::{Message, Role},
    },
    registry::FirewallRegistry,
    repository::{AuditStore, MemoryAuditStore},
    services::{FirewallPipeline, Verdict},
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

mod common;
use common::{firewall, FailingClassifier, FixedClassifier, SlowClassifier};

fn caller() -> CallerIdentity {
    CallerIdentity {
        user_id: "U1".to_string(),
        api_key_id: "K1".to_string(),
        client_ip: Some("198.51.100.4".to_string()),
    }
}

fn pipeline(store: Arc<MemoryAuditStore>, firewalls: Vec<covalence::registry::RegisteredFirewall>, timeout: Duration) -> FirewallPipeline {
    FirewallPipeline::new(Arc::new(FirewallRegistry::new(firewalls)), store, timeout)
}

#[tokio::test]
async fn test_all_firewalls_evaluated_without_short_circuit() {
    let store = Arc::new(MemoryAuditStore::new());
    let first = FixedClassifier::new("violence", 0.99);
    let second = FixedClassifier::new("hate", 0.05);
    let third = FixedClassifier::new("injection", 0.7);
    let pipeline = pipeline(
        store.clone(),
        vec![
            firewall("NO_VIOLENCE", FirewallType::Violence, 0.5, first.clone()),
            firewall("NO_HATE_SPEECH", FirewallType::HateSpeech, 0.5, second.clone()),
            firewall("NO_INJECTION", FirewallType::PromptInjection, 0.5, third.clone()),
        ],
        Duration::from_secs(1),
    );
    let id = common::log_request(store.as_ref(), "U1").await;

    let outcome = pipeline
        .evaluate(&CallContext::new(), id, &Message::new(Role::User, "hi"))
        .await
        .unwrap();

    assert_eq!((first.calls(), second.calls(), third.calls()), (1, 1, 1));
    assert!(outcome.is_blocked());
    assert_eq!(outcome.assessments.len(), 3);
    let reason = outcome.decision.reason.unwrap();
    assert!(reason.starts_with("NO_VIOLENCE: "));
    assert!(reason.contains("; NO_INJECTION: "));
    assert!(!reason.contains("NO_HATE_SPEECH"));
    assert_eq!(store.event_count().await, 3);
}

#[tokio::test]
async fn test_score_equal_to_threshold_blocks() {
    let store = Arc::new(MemoryAuditStore::new());
    let pipeline = pipeline(
        store.clone(),
        vec![firewall("EDGE", FirewallType::SelfHarm, 0.5, FixedClassifier::new("edge", 0.5))],
        Duration::from_secs(1),
    );
    let id = common::log_request(store.as_ref(), "U1").await;

    let outcome = pipeline
        .evaluate(&CallContext::new(), id, &Message::new(Role::User, "hi"))
        .await
        .unwrap();
    assert!(outcome.is_blocked());
}

#[tokio::test]
async fn test_classifier_failures_fail_closed_and_are_logged() {
    for error in [
        ClassifierError::Unreachable("connection refused".to_string()),
        ClassifierError::Timeout,
        ClassifierError::Malformed("missing score".to_string()),
    ] {
        let store = Arc::new(MemoryAuditStore::new());
        let pipeline = pipeline(
            store.clone(),
            vec![
                firewall("NO_HATE_SPEECH", FirewallType::HateSpeech, 0.9, FixedClassifier::new("hate", 0.1)),
                firewall("BROKEN", FirewallType::Violence, 0.9, Arc::new(FailingClassifier(error))),
            ],
            Duration::from_secs(1),
        );
        let id = common::log_request(store.as_ref(), "U1").await;

        let outcome = pipeline
            .evaluate(&CallContext::new(), id, &Message::new(Role::User, "hi"))
            .await
            .unwrap();

        assert!(outcome.is_blocked());
        assert_eq!(outcome.evaluation_errors.len(), 1);
        assert!(matches!(
            &outcome.evaluation_errors[0],
            AppError::FirewallEvaluation { firewall_id, .. } if firewall_id == "BROKEN"
        ));

        let trace = store.get_trace(&CallContext::new(), id).await.unwrap();
        let broken = trace
            .firewall_info
            .iter()
            .find(|e| e.firewall_id == "BROKEN")
            .unwrap();
        assert!(broken.blocked);
        assert_eq!(broken.blocked_reason, EVALUATION_ERROR_REASON);
        assert_eq!(broken.risk_score, 1.0);
    }
}

#[tokio::test]
async fn test_out_of_range_score_fails_closed() {
    let store = Arc::new(MemoryAuditStore::new());
    let pipeline = pipeline(
        store.clone(),
        vec![firewall("WILD", FirewallType::Violence, 0.9, FixedClassifier::new("wild", 7.0))],
        Duration::from_secs(1),
    );
    let id = common::log_request(store.as_ref(), "U1").await;

    let outcome = pipeline
        .evaluate(&CallContext::new(), id, &Message::new(Role::User, "hi"))
        .await
        .unwrap();
    assert!(outcome.is_blocked());
    assert!(outcome.assessments[0].is_fail_closed());
}

#[tokio::test]
async fn test_slow_classifier_times_out_and_fails_closed() {
    let store = Arc::new(MemoryAuditStore::new());
    let pipeline = pipeline(
        store.clone(),
        vec![firewall(
            "SLOW",
            FirewallType::HateSpeech,
            0.9,
            Arc::new(SlowClassifier {
                delay: Duration::from_secs(5),
                score: 0.0,
            }),
        )],
        Duration::from_millis(50),
    );
    let id = common::log_request(store.as_ref(), "U1").await;

    let outcome = pipeline
        .evaluate(&CallContext::new(), id, &Message::new(Role::User, "hi"))
        .await
        .unwrap();
    assert!(outcome.is_blocked());
    assert_eq!(outcome.assessments[0].blocked_reason, EVALUATION_ERROR_REASON);
}

#[tokio::test]
async fn test_classifiers_run_in_parallel() {
    let store = Arc::new(MemoryAuditStore::new());
    let firewalls = (0..4)
        .map(|i| {
            firewall(
                &format!("FW{}", i),
                FirewallType::Violence,
                0.9,
                Arc::new(SlowClassifier {
                    delay: Duration::from_millis(200),
                    score: 0.1,
                }),
            )
        })
        .collect();
    let pipeline = pipeline(store.clone(), firewalls, Duration::from_secs(2));
    let id = common::log_request(store.as_ref(), "U1").await;

    let started = Instant::now();
    let outcome = pipeline
        .evaluate(&CallContext::new(), id, &Message::new(Role::User, "hi"))
        .await
        .unwrap();

    assert!(!outcome.is_blocked());
    assert!(started.elapsed() < Duration::from_millis(700));
    assert_eq!(store.event_count().await, 4);
}

#[tokio::test]
async fn test_caller_deadline_cancels_without_events() {
    let store = Arc::new(MemoryAuditStore::new());
    let pipeline = pipeline(
        store.clone(),
        vec![firewall(
            "SLOW",
            FirewallType::HateSpeech,
            0.9,
            Arc::new(SlowClassifier {
                delay: Duration::from_secs(5),
                score: 0.0,
            }),
        )],
        Duration::from_secs(10),
    );
    let id = common::log_request(store.as_ref(), "U1").await;

    let ctx = CallContext::with_timeout(Duration::from_millis(50));
    let err = pipeline
        .evaluate(&ctx, id, &Message::new(Role::User, "hi"))
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Cancelled(_)));
    assert_eq!(store.event_count().await, 0);
}

#[tokio::test]
async fn test_fail_closed_event_keeps_its_own_evaluation_time() {
    let store = Arc::new(MemoryAuditStore::new());
    let pipeline = pipeline(
        store.clone(),
        vec![
            firewall(
                "SLOW_PASS",
                FirewallType::HateSpeech,
                0.9,
                Arc::new(SlowClassifier {
                    delay: Duration::from_millis(200),
                    score: 0.1,
                }),
            ),
            firewall(
                "FAST_FAIL",
                FirewallType::Violence,
                0.9,
                Arc::new(FailingClassifier(ClassifierError::Unreachable(
                    "connection refused".to_string(),
                ))),
            ),
        ],
        Duration::from_secs(2),
    );
    let id = common::log_request(store.as_ref(), "U1").await;

    pipeline
        .evaluate(&CallContext::new(), id, &Message::new(Role::User, "hi"))
        .await
        .unwrap();

    let trace = store.get_trace(&CallContext::new(), id).await.unwrap();
    let ids: Vec<&str> = trace.firewall_info.iter().map(|e| e.firewall_id.as_str()).collect();
    assert_eq!(ids, vec!["FAST_FAIL", "SLOW_PASS"]);

    let gap = trace.firewall_info[1].evaluated_at - trace.firewall_info[0].evaluated_at;
    assert!(gap >= chrono::Duration::milliseconds(100));
}

/// 每次写入事件前固定延迟的存储
struct SlowEventStore {
    inner: Arc<MemoryAuditStore>,
    per_event: Duration,
}

#[async_trait]
impl AuditStore for SlowEventStore {
    async fn log_request(&self, ctx: &CallContext, request: &NewRequest) -> Result<Uuid> {
        self.inner.log_request(ctx, request).await
    }

    async fn log_response(&self, ctx: &CallContext, response: &NewResponse) -> Result<()> {
        self.inner.log_response(ctx, response).await
    }

    async fn log_firewall_event(&self, ctx: &CallContext, event: &NewFirewallEvent) -> Result<()> {
        self.log_firewall_events(ctx, std::slice::from_ref(event)).await
    }

    async fn log_firewall_events(&self, ctx: &CallContext, events: &[NewFirewallEvent]) -> Result<()> {
        let delay = self.per_event * events.len() as u32;
        ctx.run("slow_write", None, async {
            tokio::time::sleep(delay).await;
            Ok(())
        })
        .await?;
        self.inner.log_firewall_events(ctx, events).await
    }

    async fn get_trace(&self, ctx: &CallContext, correlation_id: Uuid) -> Result<Trace> {
        self.inner.get_trace(ctx, correlation_id).await
    }

    async fn archive_trace(
        &self,
        ctx: &CallContext,
        correlation_id: Uuid,
        location: &str,
    ) -> Result<ArchiveRecord> {
        self.inner.archive_trace(ctx, correlation_id, location).await
    }
}

fn slow_store_pipeline(inner: Arc<MemoryAuditStore>) -> FirewallPipeline {
    let store = Arc::new(SlowEventStore {
        inner,
        per_event: Duration::from_millis(40),
    });
    let firewalls = ["A", "B", "C"]
        .iter()
        .map(|id| firewall(id, FirewallType::Violence, 0.9, FixedClassifier::new(id, 0.1)))
        .collect();
    FirewallPipeline::new(Arc::new(FirewallRegistry::new(firewalls)), store, Duration::from_secs(1))
}

#[tokio::test]
async fn test_deadline_during_event_write_leaves_no_partial_events() {
    let inner = Arc::new(MemoryAuditStore::new());
    let pipeline = slow_store_pipeline(inner.clone());
    let id = common::log_request(inner.as_ref(), "U1").await;

    let ctx = CallContext::with_timeout(Duration::from_millis(60));
    let err = pipeline
        .evaluate(&ctx, id, &Message::new(Role::User, "hi"))
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Cancelled(_)));
    assert_eq!(inner.event_count().await, 0);
}

#[tokio::test]
async fn test_slow_event_write_within_deadline_logs_every_firewall() {
    let inner = Arc::new(MemoryAuditStore::new());
    let pipeline = slow_store_pipeline(inner.clone());
    let id = common::log_request(inner.as_ref(), "U1").await;

    let ctx = CallContext::with_timeout(Duration::from_secs(2));
    let outcome = pipeline
        .evaluate(&ctx, id, &Message::new(Role::User, "hi"))
        .await
        .unwrap();

    assert!(!outcome.is_blocked());
    assert_eq!(inner.event_count().await, 3);
}

#[tokio::test]
async fn test_gateway_admits_clean_request() {
    let store = Arc::new(MemoryAuditStore::new());
    let gateway = common::gateway_with(
        store.clone(),
        vec![firewall("NO_HATE_SPEECH", FirewallType::HateSpeech, 0.8, FixedClassifier::new("hate", 0.12))],
    );
    let ctx = CallContext::new();

    let admission = gateway
        .admit(&ctx, &caller(), common::generate_body("hi"))
        .await
        .unwrap();
    assert_eq!(admission.verdict, Verdict::Proceed);
    assert_eq!(admission.target_url, common::TARGET_URL);

    gateway
        .record_completion(&ctx, admission.correlation_id, serde_json::json!({"content": "hello"}), 80)
        .await
        .unwrap();

    let trace = gateway.trace(&ctx, admission.correlation_id).await.unwrap();
    assert!(!trace.response.is_pending());
    assert_eq!(trace.client_ip.as_deref(), Some("198.51.100.4"));
    assert_eq!(trace.firewall_info.len(), 1);
}

#[tokio::test]
async fn test_gateway_blocks_and_still_audits() {
    let store = Arc::new(MemoryAuditStore::new());
    let gateway = common::gateway_with(
        store.clone(),
        vec![firewall("NO_HATE_SPEECH", FirewallType::HateSpeech, 0.5, FixedClassifier::new("hate", 0.9))],
    );
    let ctx = CallContext::new();

    let admission = gateway
        .admit(&ctx, &caller(), common::generate_body("something hateful"))
        .await
        .unwrap();
    assert!(admission.is_blocked());

    assert!(matches!(
        &admission.verdict,
        Verdict::Blocked { failed_firewalls, .. } if failed_firewalls.is_empty()
    ));

    let trace = gateway.trace(&ctx, admission.correlation_id).await.unwrap();
    assert!(trace.blocked);
    assert!(trace.response.is_pending());
}

#[tokio::test]
async fn test_gateway_rejects_invalid_payload_without_audit() {
    let store = Arc::new(MemoryAuditStore::new());
    let gateway = common::gateway_with(store.clone(), Vec::new());

    let err = gateway
        .admit(
            &CallContext::new(),
            &caller(),
            serde_json::json!({"model": "gpt-4", "messages": []}),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Validation(_)));
    assert_eq!(store.request_count().await, 0);
}
