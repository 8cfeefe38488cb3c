//! Audit repository (审计数据访问)
//! 只追加的请求/响应/防火墙事件写入，以及按关联 ID 的单次关联查询

use crate::{
    context::CallContext,
    error::{AppError, Result},
    models::audit::*,
    services::trace::assemble_trace,
};
use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

/// 审计存储能力
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// 写入请求记录，返回新生成的关联 ID
    async fn log_request(&self, ctx: &CallContext, request: &NewRequest) -> Result<Uuid>;

    /// 写入响应记录；关联 ID 必须已存在
    async fn log_response(&self, ctx: &CallContext, response: &NewResponse) -> Result<()>;

    /// 写入防火墙事件；关联 ID 必须已存在
    async fn log_firewall_event(&self, ctx: &CallContext, event: &NewFirewallEvent) -> Result<()>;

    /// 原子地写入一次评估的全部防火墙事件：任一条失败或被取消则一条都不写
    async fn log_firewall_events(&self, ctx: &CallContext, events: &[NewFirewallEvent]) -> Result<()>;

    /// 重建完整 Trace
    async fn get_trace(&self, ctx: &CallContext, correlation_id: Uuid) -> Result<Trace>;

    /// 登记冷存储归档并标记请求为已归档
    async fn archive_trace(
        &self,
        ctx: &CallContext,
        correlation_id: Uuid,
        location: &str,
    ) -> Result<ArchiveRecord>;
}

const TRACE_QUERY: &str = r#"
    SELECT
        r.correlation_id, r.user_id, r.api_key_id, r.model, r.target_url,
        r.inputs, r.parameters, r.received_at, r.client_ip, r.archived,
        resp.response_id, resp.response, resp.created_at AS response_created_at, resp.latency_ms,
        fe.event_id, fe.firewall_id, fe.firewall_type, fe.blocked, fe.blocked_reason,
        fe.risk_score, fe.evaluated_at
    FROM request_log r
    LEFT JOIN response_log resp ON resp.correlation_id = r.correlation_id
    LEFT JOIN firewall_event fe ON fe.correlation_id = r.correlation_id
    WHERE r.correlation_id = $1
    ORDER BY fe.evaluated_at ASC NULLS LAST, fe.event_id ASC
"#;

/// PostgreSQL 审计存储
///
/// 每个操作从连接池获取自己的连接，返回（成功、失败或被取消）时连接随之归还。
/// 单行写入不开事务；一次评估的多条防火墙事件和归档需要跨行原子性，各自放在一个事务里。
#[derive(Clone)]
pub struct PgAuditStore {
    db: PgPool,
    op_timeout: Option<Duration>,
}

impl PgAuditStore {
    pub fn new(db: PgPool) -> Self {
        Self { db, op_timeout: None }
    }

    /// 单次存储操作的超时
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn log_request(&self, ctx: &CallContext, request: &NewRequest) -> Result<Uuid> {
        let row = request.prepare()?;

        ctx.run("log_request", self.op_timeout, async {
            let mut conn = self.db.acquire().await?;
            sqlx::query(
                r#"
                INSERT INTO request_log (
                    correlation_id, user_id, api_key_id, model, target_url,
                    inputs, parameters, received_at, client_ip, archived
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, FALSE)
                "#,
            )
            .bind(row.correlation_id)
            .bind(&row.user_id)
            .bind(&row.api_key_id)
            .bind(&row.model)
            .bind(&row.target_url)
            .bind(&row.inputs)
            .bind(&row.parameters)
            .bind(row.received_at)
            .bind(&row.client_ip)
            .execute(&mut *conn)
            .await?;
            Ok(())
        })
        .await?;

        metrics::counter!("audit_writes_total", "kind" => "request").increment(1);
        tracing::debug!(
            correlation_id = %row.correlation_id,
            model = %row.model,
            inputs = row.inputs.len(),
            "Request logged"
        );

        Ok(row.correlation_id)
    }

    async fn log_response(&self, ctx: &CallContext, response: &NewResponse) -> Result<()> {
        let row = response.prepare()?;

        ctx.run("log_response", self.op_timeout, async {
            let mut conn = self.db.acquire().await?;
            sqlx::query(
                r#"
                INSERT INTO response_log (response_id, correlation_id, response, created_at, latency_ms)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(row.response_id)
            .bind(row.correlation_id)
            .bind(&row.response)
            .bind(row.created_at)
            .bind(row.latency_ms)
            .execute(&mut *conn)
            .await
            .map_err(|e| AppError::from_write(e, row.correlation_id))?;
            Ok(())
        })
        .await?;

        metrics::counter!("audit_writes_total", "kind" => "response").increment(1);
        tracing::debug!(
            correlation_id = %row.correlation_id,
            latency_ms = row.latency_ms,
            "Response logged"
        );

        Ok(())
    }

    async fn log_firewall_event(&self, ctx: &CallContext, event: &NewFirewallEvent) -> Result<()> {
        self.log_firewall_events(ctx, std::slice::from_ref(event)).await
    }

    async fn log_firewall_events(&self, ctx: &CallContext, events: &[NewFirewallEvent]) -> Result<()> {
        let rows = events
            .iter()
            .map(NewFirewallEvent::prepare)
            .collect::<Result<Vec<_>>>()?;
        if rows.is_empty() {
            return Ok(());
        }

        // 被取消时事务未提交即被丢弃，sqlx 会回滚
        ctx.run("log_firewall_events", self.op_timeout, async {
            let mut tx = self.db.begin().await?;
            for row in &rows {
                sqlx::query(
                    r#"
                    INSERT INTO firewall_event (
                        event_id, correlation_id, firewall_id, firewall_type,
                        blocked, blocked_reason, risk_score, evaluated_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    "#,
                )
                .bind(row.event_id)
                .bind(row.correlation_id)
                .bind(&row.firewall_id)
                .bind(&row.firewall_type)
                .bind(row.blocked)
                .bind(&row.blocked_reason)
                .bind(row.risk_score)
                .bind(row.evaluated_at)
                .execute(&mut *tx)
                .await
                .map_err(|e| AppError::from_write(e, row.correlation_id))?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await?;

        metrics::counter!("audit_writes_total", "kind" => "firewall_event").increment(rows.len() as u64);
        for row in &rows {
            tracing::debug!(
                correlation_id = %row.correlation_id,
                firewall_id = %row.firewall_id,
                blocked = row.blocked,
                risk_score = row.risk_score,
                "Firewall event logged"
            );
        }

        Ok(())
    }

    async fn get_trace(&self, ctx: &CallContext, correlation_id: Uuid) -> Result<Trace> {
        let rows = ctx
            .run("get_trace", self.op_timeout, async {
                let mut conn = self.db.acquire().await?;
                let rows = sqlx::query_as::<_, TraceRow>(TRACE_QUERY)
                    .bind(correlation_id)
                    .fetch_all(&mut *conn)
                    .await?;
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
        if trace.archived {
            return Err(AppError::Conflict(format!("trace {} is already archived", correlation_id)));
        }
        let content_hash = trace.content_hash()?;

        let record = ctx
            .run("archive_trace", self.op_timeout, async {
                let mut tx = self.db.begin().await?;

                let updated = sqlx::query(
                    "UPDATE request_log SET archived = TRUE WHERE correlation_id = $1 AND archived = FALSE",
                )
                .bind(correlation_id)
                .execute(&mut *tx)
                .await?;

                if updated.rows_affected() != 1 {
                    tx.rollback().await?;
                    return Err(AppError::Conflict(format!(
                        "trace {} is already archived",
                        correlation_id
                    )));
                }

                let record = sqlx::query_as::<_, ArchiveRecord>(
                    r#"
                    INSERT INTO audit_archive (archive_id, correlation_id, location, archived_at, content_hash)
                    VALUES ($1, $2, $3, NOW(), $4)
                    RETURNING archive_id, correlation_id, location, archived_at, content_hash
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(correlation_id)
                .bind(location.trim())
                .bind(&content_hash)
                .fetch_one(&mut *tx)
                .await?;

                tx.commit().await?;
                Ok(record)
            })
            .await?;

        tracing::info!(
            correlation_id = %correlation_id,
            location = %record.location,
            content_hash = %record.content_hash,
            "Trace archived"
        );

        Ok(record)
    }
}
