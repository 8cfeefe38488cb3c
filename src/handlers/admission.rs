//! Admission API handlers

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    error::Result,
    middleware::{caller_identity, AppState},
    services::Admission,
};

/// 准入一次生成请求
///
/// 放行返回 200，被防火墙拦截返回 403；两种情况都带关联 ID 与各防火墙的评估结果。
pub async fn admit(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<(StatusCode, Json<Admission>)> {
    let caller = caller_identity(&headers)?;
    let ctx = state.call_context();

    let admission = state.gateway.admit(&ctx, &caller, payload).await?;
    let status = if admission.is_blocked() {
        StatusCode::FORBIDDEN
    } else {
        StatusCode::OK
    };

    Ok((status, Json(admission)))
}

/// 上游完成回报
#[derive(Debug, Deserialize)]
pub struct CompletionRequest {
    pub response: Value,
    pub latency_ms: u32,
}

#[derive(Debug, Serialize)]
pub struct CompletionResponse {
    pub correlation_id: Uuid,
    pub recorded: bool,
}

/// 记录上游响应
pub async fn record_response(
    State(state): State<Arc<AppState>>,
    Path(correlation_id): Path<Uuid>,
    Json(request): Json<CompletionRequest>,
) -> Result<(StatusCode, Json<CompletionResponse>)> {
    let ctx = state.call_context();
    state
        .gateway
        .record_completion(&ctx, correlation_id, request.response, request.latency_ms)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CompletionResponse {
            correlation_id,
            recorded: true,
        }),
    ))
}
