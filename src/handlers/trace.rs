//! Trace API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    error::Result,
    middleware::AppState,
    models::audit::{ArchiveRecord, Trace},
};

/// 获取完整 Trace
pub async fn get_trace(
    State(state): State<Arc<AppState>>,
    Path(correlation_id): Path<Uuid>,
) -> Result<Json<Trace>> {
    let ctx = state.call_context();
    let trace = state.gateway.trace(&ctx, correlation_id).await?;
    Ok(Json(trace))
}

#[derive(Debug, Deserialize)]
pub struct ArchiveRequest {
    /// 冷存储位置，例如 "s3://audit-archive/2026/10"
    pub location: String,
}

/// 登记归档
pub async fn archive_trace(
    State(state): State<Arc<AppState>>,
    Path(correlation_id): Path<Uuid>,
    Json(request): Json<ArchiveRequest>,
) -> Result<(StatusCode, Json<ArchiveRecord>)> {
    let ctx = state.call_context();
    let record = state
        .gateway
        .archive(&ctx, correlation_id, &request.location)
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}
