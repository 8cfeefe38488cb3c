//! 路由注册
//! 创建所有 API 路由并应用中间件

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer};

use crate::{handlers, middleware::AppState};

/// 创建应用路由
pub fn create_router(state: Arc<AppState>) -> Router {
    // 公开端点（健康检查）
    let public_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check));

    // 准入与审计
    let api_routes = Router::new()
        .route("/api/v1/admissions", post(handlers::admission::admit))
        .route(
            "/api/v1/admissions/{id}/response",
            post(handlers::admission::record_response),
        )
        .route("/api/v1/traces/{id}", get(handlers::trace::get_trace))
        .route(
            "/api/v1/traces/{id}/archive",
            post(handlers::trace::archive_trace),
        )
        .layer(RequestBodyLimitLayer::new(state.config.server.max_body_bytes));

    Router::new()
        .merge(public_routes)
        .merge(api_routes)
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(crate::middleware::request_tracking_middleware))
        .with_state(state)
}
