//! 审计库连接池
//! 建池、迁移与就绪探测；错误统一归入 AppError

use crate::{
    config::DatabaseConfig,
    error::{AppError, Result},
};
use secrecy::ExposeSecret;
use serde::Serialize;
use sqlx::{migrate::MigrateError, postgres::PgPoolOptions, PgPool};
use std::time::{Duration, Instant};

/// 创建审计库连接池
///
/// 连不上库记为 `Connectivity`，调用方（启动流程）决定是否重试。
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
        .test_before_acquire(true)
        .connect(config.url.expose_secret())
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to audit database");
            AppError::Connectivity(format!("audit database: {}", e))
        })?;

    tracing::info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Audit database pool created"
    );

    Ok(pool)
}

/// 执行 request_log / response_log / firewall_event / audit_archive 的迁移
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(migration_error)?;

    tracing::info!("Audit schema is up to date");
    Ok(())
}

/// 执行期的 I/O 错误按 sqlx 规则归类，其余（版本缺失、脏迁移等）属于部署配置问题
fn migration_error(err: MigrateError) -> AppError {
    tracing::error!(error = %err, "Audit schema migration failed");
    match err {
        MigrateError::Execute(e) => AppError::from(e),
        other => AppError::Config(format!("audit schema migration: {}", other)),
    }
}

/// 连接池就绪状态
#[derive(Debug, Clone, Serialize)]
pub struct PoolHealth {
    pub reachable: bool,
    pub latency_ms: u64,
    pub size: u32,
    pub idle: usize,
    /// 对外安全的错误描述
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 在给定时限内探测审计库，并上报连接池指标
pub async fn probe(pool: &PgPool, timeout: Duration) -> PoolHealth {
    let started = Instant::now();
    let result = match tokio::time::timeout(timeout, sqlx::query("SELECT 1").execute(pool)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(AppError::from(e)),
        Err(_) => Err(AppError::Connectivity("audit database probe timed out".to_string())),
    };

    metrics::gauge!("db_pool_size").set(pool.size() as f64);
    metrics::gauge!("db_pool_idle").set(pool.num_idle() as f64);

    let error = result.err().map(|e| {
        tracing::warn!(error = %e, "Audit database probe failed");
        e.user_message()
    });

    PoolHealth {
        reachable: error.is_none(),
        latency_ms: started.elapsed().as_millis() as u64,
        size: pool.size(),
        idle: pool.num_idle(),
        error,
    }
}
