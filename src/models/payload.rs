//! 入站生成请求的校验模型
//! 把未定型的 JSON 解析为带边界检查的值：模型名、消息列表、采样参数

use crate::error::{AppError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use validator::Validate;

/// 温度取值下限
pub const TEMPERATURE_MIN: f64 = 0.0;
/// 温度取值上限
pub const TEMPERATURE_MAX: f64 = 2.0;

static MODEL_NAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:/@\-]{0,127}$").expect("model name pattern is valid")
});

/// 模型名
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModelName(String);

impl ModelName {
    pub fn parse(raw: &str) -> Result<Self> {
        let name = raw.trim();
        if name.is_empty() {
            return Err(AppError::validation("model must not be empty"));
        }
        if !MODEL_NAME_PATTERN.is_match(name) {
            return Err(AppError::validation(format!("model '{}' has an invalid format", name)));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ModelName {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ModelName> for String {
    fn from(name: ModelName) -> Self {
        name.0
    }
}

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 最大生成 token 数（> 0）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxTokens(u32);

impl MaxTokens {
    pub fn new(value: i64) -> Result<Self> {
        if value <= 0 {
            return Err(AppError::validation("max_tokens must be greater than 0"));
        }
        u32::try_from(value)
            .map(Self)
            .map_err(|_| AppError::validation(format!("max_tokens {} is too large", value)))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

/// 采样温度，取值 [TEMPERATURE_MIN, TEMPERATURE_MAX]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Temperature(f64);

impl Temperature {
    pub fn new(value: f64) -> Result<Self> {
        if !value.is_finite() || !(TEMPERATURE_MIN..=TEMPERATURE_MAX).contains(&value) {
            return Err(AppError::validation(format!(
                "temperature must be within [{}, {}], got {}",
                TEMPERATURE_MIN, TEMPERATURE_MAX, value
            )));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> f64 {
        self.0
    }
}

/// 消息角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// 单条消息解析失败的具体字段
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MessageFieldError {
    #[error("message must be a JSON object")]
    NotAnObject,
    #[error("message.role is required")]
    MissingRole,
    #[error("message.role must be a string")]
    RoleNotString,
    #[error("message.role '{0}' is not one of system, user, assistant, tool")]
    UnknownRole(String),
    #[error("message.content is required")]
    MissingContent,
    #[error("message.content must be a string")]
    ContentNotString,
}

/// 一轮对话消息，未识别字段原样保留
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            extra: Map::new(),
        }
    }

    /// 从任意 JSON 值构造消息，每个违规字段对应一个明确的错误
    pub fn from_value(value: &Value) -> std::result::Result<Self, MessageFieldError> {
        let object = value.as_object().ok_or(MessageFieldError::NotAnObject)?;

        let role = match object.get("role") {
            None | Some(Value::Null) => return Err(MessageFieldError::MissingRole),
            Some(Value::String(raw)) => {
                Role::parse(raw).ok_or_else(|| MessageFieldError::UnknownRole(raw.clone()))?
            }
            Some(_) => return Err(MessageFieldError::RoleNotString),
        };

        let content = match object.get("content") {
            None | Some(Value::Null) => return Err(MessageFieldError::MissingContent),
            Some(Value::String(text)) => text.clone(),
            Some(_) => return Err(MessageFieldError::ContentNotString),
        };

        let extra = object
            .iter()
            .filter(|(key, _)| key.as_str() != "role" && key.as_str() != "content")
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(Self { role, content, extra })
    }
}

/// 模型描述：由模型注册表解析得到
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelDescriptor {
    pub name: ModelName,
    pub provider: String,
    pub target_url: String,
}

/// 入站生成请求（原始形态）
#[derive(Debug, Deserialize, Validate)]
pub struct GenerateRequest {
    #[validate(length(min = 1, message = "model is required"))]
    pub model: String,
    #[serde(default)]
    pub stream: bool,
    #[validate(range(min = 1, message = "max_tokens must be greater than 0"))]
    pub max_tokens: Option<i64>,
    #[validate(range(min = 0.0, max = 2.0, message = "temperature must be within [0, 2]"))]
    pub temperature: Option<f64>,
    #[validate(length(min = 1, message = "messages must be a non-empty array"))]
    pub messages: Vec<Value>,
}

/// 模型查找能力
pub trait ModelLookup: Send + Sync {
    fn lookup(&self, name: &ModelName) -> Option<ModelDescriptor>;
}

impl GenerateRequest {
    /// 从任意 JSON 值解析
    pub fn from_value(raw: Value) -> Result<Self> {
        serde_json::from_value(raw)
            .map_err(|e| AppError::validation(format!("malformed generate request: {}", e)))
    }

    /// 校验并转换为定型的负载
    pub fn into_payload(self, models: &dyn ModelLookup) -> Result<GeneratePayload> {
        self.validate()
            .map_err(|e| AppError::validation(first_validation_message(&e)))?;

        let name = ModelName::parse(&self.model)?;
        let model = models
            .lookup(&name)
            .ok_or_else(|| AppError::validation(format!("model '{}' not found", name)))?;

        let max_tokens = self.max_tokens.map(MaxTokens::new).transpose()?;
        let temperature = self.temperature.map(Temperature::new).transpose()?;

        let messages = self
            .messages
            .iter()
            .enumerate()
            .map(|(index, value)| {
                Message::from_value(value)
                    .map_err(|e| AppError::validation(format!("messages[{}]: {}", index, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        GeneratePayload::new(model, messages, max_tokens, temperature, self.stream)
    }
}

fn first_validation_message(errors: &validator::ValidationErrors) -> String {
    errors
        .field_errors()
        .values()
        .flat_map(|list| list.iter())
        .find_map(|error| error.message.as_ref().map(|m| m.to_string()))
        .unwrap_or_else(|| errors.to_string())
}

/// 校验通过的生成请求，只存在于内存
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratePayload {
    pub model: ModelDescriptor,
    messages: Vec<Message>,
    pub max_tokens: Option<MaxTokens>,
    pub temperature: Option<Temperature>,
    pub stream: bool,
}

impl GeneratePayload {
    pub fn new(
        model: ModelDescriptor,
        messages: Vec<Message>,
        max_tokens: Option<MaxTokens>,
        temperature: Option<Temperature>,
        stream: bool,
    ) -> Result<Self> {
        if messages.is_empty() {
            return Err(AppError::validation("messages must be a non-empty array"));
        }
        Ok(Self {
            model,
            messages,
            max_tokens,
            temperature,
            stream,
        })
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// 最近一条消息（消息列表保证非空）
    pub fn latest_message(&self) -> &Message {
        &self.messages[self.messages.len() - 1]
    }

    /// 采样参数，作为一个 JSON 对象落库
    pub fn parameters(&self) -> Map<String, Value> {
        let mut params = Map::new();
        params.insert("stream".to_string(), Value::Bool(self.stream));
        if let Some(max_tokens) = self.max_tokens {
            params.insert("max_tokens".to_string(), Value::from(max_tokens.get()));
        }
        if let Some(temperature) = self.temperature {
            params.insert("temperature".to_string(), Value::from(temperature.get()));
        }
        params
    }
}
