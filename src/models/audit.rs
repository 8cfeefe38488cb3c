//! Audit domain models
//! 请求、响应、防火墙事件三类只追加记录，以及按关联 ID 重建的 Trace 视图

use crate::error::{AppError, Result};
use crate::models::firewall::FirewallAssessment;
use crate::models::payload::{GeneratePayload, Message};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use uuid::Uuid;

/// 调用方身份（由外层 HTTP/认证层提供）
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallerIdentity {
    pub user_id: String,
    pub api_key_id: String,
    pub client_ip: Option<String>,
}

/// 待写入的请求记录
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub user_id: String,
    pub api_key_id: String,
    pub model: String,
    pub target_url: String,
    pub inputs: Vec<Message>,
    pub parameters: Map<String, Value>,
    pub client_ip: Option<String>,
}

impl NewRequest {
    pub fn from_payload(payload: &GeneratePayload, caller: &CallerIdentity) -> Self {
        Self {
            user_id: caller.user_id.clone(),
            api_key_id: caller.api_key_id.clone(),
            model: payload.model.name.to_string(),
            target_url: payload.model.target_url.clone(),
            inputs: payload.messages().to_vec(),
            parameters: payload.parameters(),
            client_ip: caller.client_ip.clone(),
        }
    }

    /// 编码为落库形态：每条消息独立编码，参数整体编码，生成新的关联 ID
    pub fn prepare(&self) -> Result<RequestLog> {
        if self.inputs.is_empty() {
            return Err(AppError::validation("request must carry at least one input message"));
        }

        let inputs = self
            .inputs
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let parameters = serde_json::to_value(&self.parameters)?;

        let client_ip = match self.client_ip.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => {
                let ip: IpAddr = raw
                    .parse()
                    .map_err(|_| AppError::validation(format!("invalid client IP '{}'", raw)))?;
                Some(ip.to_string())
            }
        };

        Ok(RequestLog {
            correlation_id: Uuid::new_v4(),
            user_id: self.user_id.clone(),
            api_key_id: self.api_key_id.clone(),
            model: self.model.clone(),
            target_url: self.target_url.clone(),
            inputs,
            parameters,
            received_at: Utc::now(),
            client_ip,
            archived: false,
        })
    }
}

/// 请求记录
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct RequestLog {
    pub correlation_id: Uuid,
    pub user_id: String,
    pub api_key_id: String,
    pub model: String,
    pub target_url: String,
    pub inputs: Vec<Value>,
    pub parameters: Value,
    pub received_at: DateTime<Utc>,
    pub client_ip: Option<String>,
    pub archived: bool,
}

/// 待写入的响应记录
#[derive(Debug, Clone)]
pub struct NewResponse {
    pub correlation_id: Uuid,
    pub response: Value,
    pub latency_ms: u32,
}

impl NewResponse {
    pub fn new<T: Serialize>(correlation_id: Uuid, body: &T, latency_ms: u32) -> Result<Self> {
        Ok(Self {
            correlation_id,
            response: serde_json::to_value(body)?,
            latency_ms,
        })
    }

    pub fn prepare(&self) -> Result<ResponseLog> {
        let latency_ms = i32::try_from(self.latency_ms)
            .map_err(|_| AppError::validation(format!("latency {} ms is out of range", self.latency_ms)))?;
        Ok(ResponseLog {
            response_id: Uuid::new_v4(),
            correlation_id: self.correlation_id,
            response: self.response.clone(),
            created_at: Utc::now(),
            latency_ms,
        })
    }
}

/// 响应记录
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct ResponseLog {
    pub response_id: Uuid,
    pub correlation_id: Uuid,
    pub response: Value,
    pub created_at: DateTime<Utc>,
    pub latency_ms: i32,
}

/// 待写入的防火墙事件
#[derive(Debug, Clone)]
pub struct NewFirewallEvent {
    pub correlation_id: Uuid,
    pub firewall_id: String,
    pub firewall_type: String,
    pub blocked: bool,
    pub blocked_reason: String,
    pub risk_score: f64,
    pub evaluated_at: DateTime<Utc>,
}

impl NewFirewallEvent {
    pub fn from_assessment(correlation_id: Uuid, assessment: &FirewallAssessment) -> Self {
        Self {
            correlation_id,
            firewall_id: assessment.firewall_id.clone(),
            firewall_type: assessment.firewall_type.as_str().to_string(),
            blocked: assessment.blocked,
            blocked_reason: assessment.blocked_reason.clone(),
            risk_score: assessment.risk_score.get(),
            evaluated_at: assessment.evaluated_at,
        }
    }

    pub fn prepare(&self) -> Result<FirewallEvent> {
        if !self.risk_score.is_finite() || !(0.0..=1.0).contains(&self.risk_score) {
            return Err(AppError::validation(format!(
                "risk score must be within [0, 1], got {}",
                self.risk_score
            )));
        }
        if self.blocked && self.blocked_reason.trim().is_empty() {
            return Err(AppError::validation("blocked firewall event requires a reason"));
        }
        if self.firewall_id.trim().is_empty() {
            return Err(AppError::validation("firewall_id must not be empty"));
        }
        Ok(FirewallEvent {
            event_id: Uuid::new_v4(),
            correlation_id: self.correlation_id,
            firewall_id: self.firewall_id.clone(),
            firewall_type: self.firewall_type.clone(),
            blocked: self.blocked,
            blocked_reason: self.blocked_reason.clone(),
            risk_score: self.risk_score,
            evaluated_at: self.evaluated_at,
        })
    }
}

/// 防火墙事件记录
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct FirewallEvent {
    pub event_id: Uuid,
    pub correlation_id: Uuid,
    pub firewall_id: String,
    pub firewall_type: String,
    pub blocked: bool,
    pub blocked_reason: String,
    pub risk_score: f64,
    pub evaluated_at: DateTime<Utc>,
}

/// 冷存储归档记录
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct ArchiveRecord {
    pub archive_id: Uuid,
    pub correlation_id: Uuid,
    pub location: String,
    pub archived_at: DateTime<Utc>,
    pub content_hash: String,
}

/// 关联查询的一行：请求字段恒定，响应字段可空，防火墙事件字段逐行变化
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TraceRow {
    pub correlation_id: Uuid,
    pub user_id: String,
    pub api_key_id: String,
    pub model: String,
    pub target_url: String,
    pub inputs: Vec<Value>,
    pub parameters: Value,
    pub received_at: DateTime<Utc>,
    pub client_ip: Option<String>,
    pub archived: bool,
    pub response_id: Option<Uuid>,
    pub response: Option<Value>,
    pub response_created_at: Option<DateTime<Utc>>,
    pub latency_ms: Option<i32>,
    pub event_id: Option<Uuid>,
    pub firewall_id: Option<String>,
    pub firewall_type: Option<String>,
    pub blocked: Option<bool>,
    pub blocked_reason: Option<String>,
    pub risk_score: Option<f64>,
    pub evaluated_at: Option<DateTime<Utc>>,
}

impl TraceRow {
    /// 由各表记录拼出一行（内存存储使用）
    pub fn join(
        request: &RequestLog,
        response: Option<&ResponseLog>,
        event: Option<&FirewallEvent>,
    ) -> Self {
        Self {
            correlation_id: request.correlation_id,
            user_id: request.user_id.clone(),
            api_key_id: request.api_key_id.clone(),
            model: request.model.clone(),
            target_url: request.target_url.clone(),
            inputs: request.inputs.clone(),
            parameters: request.parameters.clone(),
            received_at: request.received_at,
            client_ip: request.client_ip.clone(),
            archived: request.archived,
            response_id: response.map(|r| r.response_id),
            response: response.map(|r| r.response.clone()),
            response_created_at: response.map(|r| r.created_at),
            latency_ms: response.map(|r| r.latency_ms),
            event_id: event.map(|e| e.event_id),
            firewall_id: event.map(|e| e.firewall_id.clone()),
            firewall_type: event.map(|e| e.firewall_type.clone()),
            blocked: event.map(|e| e.blocked),
            blocked_reason: event.map(|e| e.blocked_reason.clone()),
            risk_score: event.map(|e| e.risk_score),
            evaluated_at: event.map(|e| e.evaluated_at),
        }
    }
}

/// 响应状态：尚未记录响应时为 Pending
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResponseState {
    Pending,
    Completed {
        response_id: Uuid,
        response: Value,
        created_at: DateTime<Utc>,
        latency_ms: i32,
    },
}

impl ResponseState {
    pub fn is_pending(&self) -> bool {
        matches!(self, ResponseState::Pending)
    }
}

/// 一次调用的完整审计视图（只读，按需计算）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trace {
    pub correlation_id: Uuid,
    pub user_id: String,
    pub api_key_id: String,
    pub model: String,
    pub target_url: String,
    pub inputs: Vec<Value>,
    pub parameters: Map<String, Value>,
    pub received_at: DateTime<Utc>,
    pub client_ip: Option<String>,
    pub archived: bool,
    pub response: ResponseState,
    pub firewall_info: Vec<FirewallEvent>,
    /// 任一防火墙拦截即为 true
    pub blocked: bool,
    /// 按评估顺序第一个非空的拦截原因
    pub blocked_reason: Option<String>,
    /// 所有事件中的最大风险分值
    pub risk_score: f64,
}

impl Trace {
    /// 归档摘要：规范 JSON 的 SHA-256（十六进制）
    pub fn content_hash(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::payload::Role;
    use serde_json::json;

    fn new_request() -> NewRequest {
        NewRequest {
            user_id: "U1".to_string(),
            api_key_id: "K1".to_string(),
            model: "gpt-4".to_string(),
            target_url: "https://api.openai.com/v1/chat/completions".to_string(),
            inputs: vec![Message::new(Role::User, "hi")],
            parameters: json!({"temperature": 0.7}).as_object().cloned().unwrap(),
            client_ip: None,
        }
    }

    #[test]
    fn test_prepare_encodes_each_message_separately() {
        let mut request = new_request();
        request.inputs.push(Message::new(Role::Assistant, "hello"));
        let row = request.prepare().unwrap();
        assert_eq!(row.inputs.len(), 2);
        assert_eq!(row.inputs[1], json!({"role": "assistant", "content": "hello"}));
        assert_eq!(row.parameters, json!({"temperature": 0.7}));
    }

    #[test]
    fn test_prepare_generates_distinct_ids() {
        let request = new_request();
        assert_ne!(
            request.prepare().unwrap().correlation_id,
            request.prepare().unwrap().correlation_id
        );
    }

    #[test]
    fn test_prepare_validates_client_ip() {
        let mut request = new_request();
        request.client_ip = Some("not-an-ip".to_string());
        assert!(matches!(request.prepare(), Err(AppError::Validation(_))));

        request.client_ip = Some("::1".to_string());
        assert_eq!(request.prepare().unwrap().client_ip.as_deref(), Some("::1"));

        request.client_ip = Some(String::new());
        assert!(request.prepare().unwrap().client_ip.is_none());
    }

    #[test]
    fn test_prepare_rejects_empty_inputs() {
        let mut request = new_request();
        request.inputs.clear();
        assert!(matches!(request.prepare(), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_firewall_event_invariants() {
        let mut event = NewFirewallEvent {
            correlation_id: Uuid::new_v4(),
            firewall_id: "NO_HATE_SPEECH".to_string(),
            firewall_type: "hate_speech".to_string(),
            blocked: false,
            blocked_reason: String::new(),
            risk_score: 0.12,
            evaluated_at: Utc::now(),
        };
        assert!(event.prepare().is_ok());

        event.risk_score = 1.2;
        assert!(matches!(event.prepare(), Err(AppError::Validation(_))));

        event.risk_score = 0.9;
        event.blocked = true;
        assert!(matches!(event.prepare(), Err(AppError::Validation(_))));

        event.blocked_reason = "hate speech detected".to_string();
        assert!(event.prepare().is_ok());
    }
}
