//! 进程内审计存储
//! 与 PostgreSQL 实现遵守相同的不变量（引用完整性、响应唯一、归档一次），用于测试与本地运行

use super::AuditStore;
use crate::{
    context::CallContext,
    error::{AppError, Result},
    models::audit::*,
    services::trace::assemble_trace,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// 内存审计存储
///
/// 每张表一把独立的读写锁，互不相关的写入不会互相串行。
/// 需要同时持有多把锁时按 requests → responses → events → archives 的顺序获取。
#[derive(Clone, Default)]
pub struct MemoryAuditStore {
    requests: Arc<RwLock<HashMap<Uuid, RequestLog>>>,
    responses: Arc<RwLock<HashMap<Uuid, ResponseLog>>>,
    events: Arc<RwLock<Vec<FirewallEvent>>>,
    archives: Arc<RwLock<Vec<ArchiveRecord>>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前记录的请求数
    pub async fn request_count(&self) -> usize {
        self.requests.read().await.len()
    }

    /// 当前记录的防火墙事件数
    pub async fn event_count(&self) -> usize {
        self.events.read().await.len()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn log_request(&self, ctx: &CallContext, request: &NewRequest) -> Result<Uuid> {
        let row = request.prepare()?;
        let correlation_id = row.correlation_id;

        ctx.run("log_request", None, async {
            let mut requests = self.requests.write().await;
            if requests.contains_key(&correlation_id) {
                return Err(AppError::Conflict(format!("request {} already exists", correlation_id)));
            }
            requests.insert(correlation_id, row);
            Ok(())
        })
        .await?;

        tracing::debug!(correlation_id = %correlation_id, "Request logged in memory");
        Ok(correlation_id)
    }

    async fn log_response(&self, ctx: &CallContext, response: &NewResponse) -> Result<()> {
        let row = response.prepare()?;

        ctx.run("log_response", None, async {
            let requests = self.requests.read().await;
            if !requests.contains_key(&row.correlation_id) {
                return Err(AppError::Referential(row.correlation_id));
            }
            let mut responses = self.responses.write().await;
            if responses.contains_key(&row.correlation_id) {
                return Err(AppError::Conflict(format!(
                    "response for {} already recorded",
                    row.correlation_id
                )));
            }
            responses.insert(row.correlation_id, row);
            Ok(())
        })
        .await
    }

    async fn log_firewall_event(&self, ctx: &CallContext, event: &NewFirewallEvent) -> Result<()> {
        self.log_firewall_events(ctx, std::slice::from_ref(event)).await
    }

    async fn log_firewall_events(&self, ctx: &CallContext, events: &[NewFirewallEvent]) -> Result<()> {
        let rows = events
            .iter()
            .map(NewFirewallEvent::prepare)
            .collect::<Result<Vec<_>>>()?;

        ctx.run("log_firewall_events", None, async {
            let requests = self.requests.read().await;
            if let Some(missing) = rows.iter().find(|r| !requests.contains_key(&r.correlation_id)) {
                return Err(AppError::Referential(missing.correlation_id));
            }
            self.events.write().await.extend(rows);
            Ok(())
        })
        .await
    }

    async fn get_trace(&self, ctx: &CallContext, correlation_id: Uuid) -> Result<Trace> {
        let rows = ctx
            .run("get_trace", None, async {
                let requests = self.requests.read().await;
                let Some(request) = requests.get(&correlation_id) else {
                    return Ok(Vec::new());
                };
                let responses = self.responses.read().await;
                let response = responses.get(&correlation_id);

                let events = self.events.read().await;
                let mut rows: Vec<TraceRow> = events
                    .iter()
                    .filter(|e| e.correlation_id == correlation_id)
                    .map(|e| TraceRow::join(request, response, Some(e)))
                    .collect();
                if rows.is_empty() {
                    rows.push(TraceRow::join(request, response, None));
                }
                Ok(rows)
            })
            .await?;

        assemble_trace(correlation_id, rows)
    }

    async fn archive_trace(
        &self,
        ctx: &CallContext,
        correlation_id: Uuid,
        location: &str,
    ) -> Result<ArchiveRecord> {
        if location.trim().is_empty() {
            return Err(AppError::validation("archive location must not be empty"));
        }

        let trace = self.get_trace(ctx, correlation_id).await?;
        let content_hash = trace.content_hash()?;

        ctx.run("archive_trace", None, async {
            let mut requests = self.requests.write().await;
            let request = requests
                .get_mut(&correlation_id)
                .ok_or_else(|| AppError::NotFound(format!("trace {}", correlation_id)))?;
            if request.archived {
                return Err(AppError::Conflict(format!("trace {} is already archived", correlation_id)));
            }

            let record = ArchiveRecord {
                archive_id: Uuid::new_v4(),
                correlation_id,
                location: location.trim().to_string(),
                archived_at: chrono::Utc::now(),
                content_hash,
            };
            let mut archives = self.archives.write().await;
            request.archived = true;
            archives.push(record.clone());
            Ok(record)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::payload::{Message, Role};
    use serde_json::{json, Map};

    fn new_request() -> NewRequest {
        NewRequest {
            user_id: "U1".to_string(),
            api_key_id: "K1".to_string(),
            model: "gpt-4".to_string(),
            target_url: "https://api.openai.com/v1/chat/completions".to_string(),
            inputs: vec![Message::new(Role::User, "hello")],
            parameters: Map::new(),
            client_ip: Some("10.0.0.1".to_string()),
        }
    }

    #[tokio::test]
    async fn test_cancelled_context_writes_nothing() {
        let store = MemoryAuditStore::new();
        let ctx = CallContext::new();
        ctx.cancel();

        let err = store.log_request(&ctx, &new_request()).await.unwrap_err();
        assert!(matches!(err, AppError::Cancelled(_)));
        assert_eq!(store.request_count().await, 0);
    }

    #[tokio::test]
    async fn test_archive_marks_request() {
        let store = MemoryAuditStore::new();
        let ctx = CallContext::new();
        let id = store.log_request(&ctx, &new_request()).await.unwrap();

        let record = store.archive_trace(&ctx, id, "s3://audit/2026/10").await.unwrap();
        assert_eq!(record.correlation_id, id);
        assert_eq!(record.content_hash.len(), 64);
        assert!(store.get_trace(&ctx, id).await.unwrap().archived);

        let again = store.archive_trace(&ctx, id, "s3://audit/2026/10").await;
        assert!(matches!(again, Err(AppError::Conflict(_))));
    }

    fn event(correlation_id: Uuid, firewall_id: &str, risk_score: f64) -> NewFirewallEvent {
        NewFirewallEvent {
            correlation_id,
            firewall_id: firewall_id.to_string(),
            firewall_type: "hate_speech".to_string(),
            blocked: false,
            blocked_reason: String::new(),
            risk_score,
            evaluated_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_event_batch_is_all_or_nothing() {
        let store = MemoryAuditStore::new();
        let ctx = CallContext::new();
        let id = store.log_request(&ctx, &new_request()).await.unwrap();

        let dangling = [event(id, "A", 0.1), event(Uuid::new_v4(), "B", 0.2)];
        let err = store.log_firewall_events(&ctx, &dangling).await.unwrap_err();
        assert!(matches!(err, AppError::Referential(_)));

        let out_of_range = [event(id, "A", 0.1), event(id, "B", 1.5)];
        let err = store.log_firewall_events(&ctx, &out_of_range).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(store.event_count().await, 0);

        store
            .log_firewall_events(&ctx, &[event(id, "A", 0.1), event(id, "B", 0.2)])
            .await
            .unwrap();
        assert_eq!(store.event_count().await, 2);
    }

    #[tokio::test]
    async fn test_second_response_conflicts() {
        let store = MemoryAuditStore::new();
        let ctx = CallContext::new();
        let id = store.log_request(&ctx, &new_request()).await.unwrap();

        let response = NewResponse::new(id, &json!({"content": "hi"}), 10).unwrap();
        store.log_response(&ctx, &response).await.unwrap();
        let err = store.log_response(&ctx, &response).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }
}
