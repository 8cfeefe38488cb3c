//! HTTP 中间件
//! 请求追踪与调用方身份提取

use axum::{
    extract::Request,
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    config::AppConfig,
    context::CallContext,
    error::{AppError, Result},
    models::audit::CallerIdentity,
    services::GatewayService,
};

/// 调用方用户 ID 请求头（由前置认证层注入）
pub const USER_ID_HEADER: &str = "x-user-id";
/// 调用方 API Key ID 请求头
pub const API_KEY_ID_HEADER: &str = "x-api-key-id";

/// 应用状态
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub gateway: Arc<GatewayService>,
    /// 使用内存存储运行时为空
    pub db: Option<sqlx::PgPool>,
}

impl AppState {
    /// 为一次 HTTP 调用创建带截止时间的上下文
    pub fn call_context(&self) -> CallContext {
        CallContext::with_timeout(Duration::from_millis(self.config.gateway.request_timeout_ms))
    }
}

/// 请求追踪中间件
/// 为每个请求生成 trace_id 和 request_id，并记录指标
pub async fn request_tracking_middleware(req: Request, next: Next) -> Response {
    let trace_id = extract_or_generate_trace_id(req.headers());
    let request_id = Uuid::new_v4().to_string();

    let method = req.method().clone();
    let uri = req.uri().to_string();

    let span = tracing::info_span!(
        "http_request",
        trace_id = %trace_id,
        request_id = %request_id,
        method = %method,
        uri = %uri,
    );

    async move {
        let start = Instant::now();
        let mut response = next.run(req).await;
        let elapsed = start.elapsed();

        let status = response.status().as_u16();
        let method_name = match method.as_str() {
            "GET" => "GET",
            "POST" => "POST",
            _ => "OTHER",
        };
        let status_class = match status {
            200..=299 => "2xx",
            400..=499 => "4xx",
            500..=599 => "5xx",
            _ => "other",
        };

        metrics::counter!("http_requests_total", "method" => method_name, "status" => status_class)
            .increment(1);
        metrics::histogram!("http_request_duration_seconds").record(elapsed.as_secs_f64());

        tracing::info!(
            status = status,
            elapsed_ms = elapsed.as_millis() as u64,
            "Request completed"
        );

        if let Ok(value) = HeaderValue::from_str(&trace_id) {
            response.headers_mut().insert("x-trace-id", value);
        }
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert("x-request-id", value);
        }

        response
    }
    .instrument(span)
    .await
}

/// 从请求头中提取或生成 trace_id
fn extract_or_generate_trace_id(headers: &HeaderMap) -> String {
    headers
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// 从请求头提取调用方身份
///
/// 用户与 API Key 由前置认证层注入；客户端 IP 取 X-Forwarded-For 的第一项，其次 X-Real-IP。
pub fn caller_identity(headers: &HeaderMap) -> Result<CallerIdentity> {
    let user_id = header_str(headers, USER_ID_HEADER)
        .ok_or_else(|| AppError::validation(format!("missing {} header", USER_ID_HEADER)))?;
    let api_key_id = header_str(headers, API_KEY_ID_HEADER)
        .ok_or_else(|| AppError::validation(format!("missing {} header", API_KEY_ID_HEADER)))?;

    let client_ip = header_str(headers, "x-forwarded-for")
        .and_then(|forwarded| forwarded.split(',').next().map(|ip| ip.trim().to_string()))
        .or_else(|| header_str(headers, "x-real-ip"));

    Ok(CallerIdentity {
        user_id,
        api_key_id,
        client_ip,
    })
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
