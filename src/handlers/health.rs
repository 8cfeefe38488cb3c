//! 健康检查处理器
//! 提供 /health 和 /ready 端点

use axum::{extract::State, Json};
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::{db, middleware::AppState};

/// 存活探针响应
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

/// 就绪探针响应
#[derive(Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub firewalls: usize,
    pub checks: Vec<HealthCheck>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<db::PoolHealth>,
}

/// 健康检查项
#[derive(Serialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

static APP_START_TIME: OnceCell<Instant> = OnceCell::new();

/// 设置应用启动时间（main.rs 中调用）
pub fn set_start_time() {
    let _ = APP_START_TIME.set(Instant::now());
}

/// 获取应用运行时间（秒）
pub fn get_uptime() -> u64 {
    APP_START_TIME.get().map_or(0, |start| start.elapsed().as_secs())
}

/// 存活探针
/// 快速响应，不检查依赖
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: get_uptime(),
    })
}

/// 就绪探针
/// 检查审计存储
pub async fn readiness_check(State(state): State<Arc<AppState>>) -> Json<ReadinessResponse> {
    let mut checks = Vec::new();
    let mut database = None;

    match &state.db {
        Some(pool) => {
            let timeout = Duration::from_millis(state.config.gateway.storage_timeout_ms);
            let health = db::probe(pool, timeout).await;
            checks.push(HealthCheck {
                name: "database".to_string(),
                status: if health.reachable { "healthy" } else { "unhealthy" }.to_string(),
                message: health.error.clone(),
            });
            database = Some(health);
        }
        None => checks.push(HealthCheck {
            name: "audit_store".to_string(),
            status: "healthy".to_string(),
            message: Some("in-memory".to_string()),
        }),
    }

    let all_healthy = checks.iter().all(|c| c.status == "healthy");

    Json(ReadinessResponse {
        ready: all_healthy,
        firewalls: state.gateway.firewall_count(),
        checks,
        database,
    })
}
