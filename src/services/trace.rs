//! Trace 重建
//! 把关联查询返回的多行合并为一个 Trace：请求/响应字段取自任一行，防火墙事件逐行累积

use crate::error::{AppError, Result};
use crate::models::audit::{FirewallEvent, ResponseState, Trace, TraceRow};
use serde_json::{Map, Value};
use uuid::Uuid;

/// 合并关联查询结果
///
/// 没有任何行时返回 `NotFound`；尚未记录响应时 `response` 为 `Pending`。
/// 参数解码失败时退化为空对象并记录告警，这是唯一被吞掉的错误。
pub fn assemble_trace(correlation_id: Uuid, rows: Vec<TraceRow>) -> Result<Trace> {
    let Some(first) = rows.first() else {
        return Err(AppError::NotFound(format!("trace {}", correlation_id)));
    };

    let parameters = decode_parameters(correlation_id, &first.parameters);

    let response = match (first.response_id, &first.response, first.response_created_at, first.latency_ms) {
        (Some(response_id), Some(body), Some(created_at), Some(latency_ms)) => ResponseState::Completed {
            response_id,
            response: body.clone(),
            created_at,
            latency_ms,
        },
        (None, ..) => ResponseState::Pending,
        _ => {
            return Err(AppError::Internal(format!(
                "data integrity violation: incomplete response row for {}",
                correlation_id
            )))
        }
    };

    let mut events = Vec::new();
    for row in &rows {
        if let Some(event) = event_from_row(row)? {
            events.push(event);
        }
    }
    events.sort_by(|a, b| {
        a.evaluated_at
            .cmp(&b.evaluated_at)
            .then_with(|| a.event_id.cmp(&b.event_id))
    });

    let blocked = events.iter().any(|e| e.blocked);
    let blocked_reason = events
        .iter()
        .find(|e| e.blocked && !e.blocked_reason.is_empty())
        .map(|e| e.blocked_reason.clone());
    let risk_score = events.iter().map(|e| e.risk_score).fold(0.0, f64::max);

    Ok(Trace {
        correlation_id: first.correlation_id,
        user_id: first.user_id.clone(),
        api_key_id: first.api_key_id.clone(),
        model: first.model.clone(),
        target_url: first.target_url.clone(),
        inputs: first.inputs.clone(),
        parameters,
        received_at: first.received_at,
        client_ip: first.client_ip.clone(),
        archived: first.archived,
        response,
        firewall_info: events,
        blocked,
        blocked_reason,
        risk_score,
    })
}

fn decode_parameters(correlation_id: Uuid, raw: &Value) -> Map<String, Value> {
    match serde_json::from_value::<Map<String, Value>>(raw.clone()) {
        Ok(params) => params,
        Err(e) => {
            tracing::warn!(
                correlation_id = %correlation_id,
                error = %e,
                "Stored parameters failed to decode, using empty parameters"
            );
            Map::new()
        }
    }
}

fn event_from_row(row: &TraceRow) -> Result<Option<FirewallEvent>> {
    let Some(event_id) = row.event_id else {
        return Ok(None);
    };

    let (Some(firewall_id), Some(firewall_type), Some(blocked), Some(risk_score), Some(evaluated_at)) = (
        row.firewall_id.clone(),
        row.firewall_type.clone(),
        row.blocked,
        row.risk_score,
        row.evaluated_at,
    ) else {
        return Err(AppError::Internal(format!(
            "data integrity violation: incomplete firewall event {}",
            event_id
        )));
    };

    if !risk_score.is_finite() || !(0.0..=1.0).contains(&risk_score) {
        return Err(AppError::Internal(format!(
            "data integrity violation: firewall event {} has risk score {}",
            event_id, risk_score
        )));
    }

    Ok(Some(FirewallEvent {
        event_id,
        correlation_id: row.correlation_id,
        firewall_id,
        firewall_type,
        blocked,
        blocked_reason: row.blocked_reason.clone().unwrap_or_default(),
        risk_score,
        evaluated_at,
    }))
}
