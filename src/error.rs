//! 统一错误模型
//! 审计链路与防火墙管道的错误分类，以及到 HTTP 边界的映射

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// 结果类型别名
pub type Result<T> = std::result::Result<T, AppError>;

/// PostgreSQL SQLSTATE: foreign_key_violation
const PG_FOREIGN_KEY_VIOLATION: &str = "23503";
/// PostgreSQL SQLSTATE: unique_violation
const PG_UNIQUE_VIOLATION: &str = "23505";
/// PostgreSQL SQLSTATE: check_violation
const PG_CHECK_VIOLATION: &str = "23514";

/// 应用错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 输入格式错误或越界，不重试
    #[error("Validation error: {0}")]
    Validation(String),

    /// 存储 JSON 的编解码失败
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 写入引用了不存在的关联 ID
    #[error("Referential error: no request logged for correlation id {0}")]
    Referential(Uuid),

    #[error("Resource not found: {0}")]
    NotFound(String),

    /// 存储或分类器不可达，由调用方负责退避重试
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// 分类器调用失败（已按 fail-closed 处理并上报）
    #[error("Firewall evaluation error ({firewall_id}): {message}")]
    FirewallEvaluation { firewall_id: String, message: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    /// 调用方截止时间到达或主动取消
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// 获取 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Referential(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::FirewallEvaluation { .. } => StatusCode::FORBIDDEN,
            AppError::Connectivity(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Cancelled(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Serialization(_)
            | AppError::Database(_)
            | AppError::Config(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 获取用户友好的错误消息（不包含敏感信息）
    pub fn user_message(&self) -> String {
        match self {
            AppError::Validation(msg) => msg.clone(),
            AppError::Serialization(_) => "Payload encoding error".to_string(),
            AppError::Referential(id) => format!("Unknown correlation id: {}", id),
            AppError::NotFound(msg) => format!("Resource not found: {}", msg),
            AppError::Connectivity(_) => "Upstream dependency unavailable".to_string(),
            AppError::FirewallEvaluation { .. } => {
                "Request rejected: firewall evaluation error".to_string()
            }
            AppError::Conflict(msg) => msg.clone(),
            AppError::Cancelled(_) => "Request deadline exceeded".to_string(),
            AppError::Database(_) => "Database error occurred".to_string(),
            AppError::Config(_) => "Configuration error".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
        }
    }

    /// 获取错误码
    pub fn code(&self) -> u16 {
        self.status_code().as_u16()
    }

    /// 调用方是否可以退避重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Connectivity(_) | AppError::Cancelled(_))
    }

    // 便捷方法
    pub fn validation(msg: impl Into<String>) -> Self {
        AppError::Validation(msg.into())
    }

    pub fn not_found(msg: &str) -> Self {
        AppError::NotFound(msg.to_string())
    }

    pub fn internal_error(msg: &str) -> Self {
        AppError::Internal(msg.to_string())
    }

    /// 按写入语境归类 sqlx 错误：外键冲突意味着关联 ID 不存在
    pub fn from_write(err: sqlx::Error, correlation_id: Uuid) -> Self {
        match sqlstate(&err).as_deref() {
            Some(PG_FOREIGN_KEY_VIOLATION) => AppError::Referential(correlation_id),
            _ => AppError::from(err),
        }
    }
}

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map(|c| c.into_owned()),
        _ => None,
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                AppError::Connectivity(err.to_string())
            }
            sqlx::Error::Tls(_) | sqlx::Error::WorkerCrashed => {
                AppError::Connectivity(err.to_string())
            }
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                Some(PG_UNIQUE_VIOLATION) => AppError::Conflict(db_err.message().to_string()),
                Some(PG_CHECK_VIOLATION) => AppError::Validation(db_err.message().to_string()),
                _ => AppError::Database(err),
            },
            _ => AppError::Database(err),
        }
    }
}

/// 从 config::ConfigError 转换
impl From<config::ConfigError> for AppError {
    fn from(e: config::ConfigError) -> Self {
        AppError::Config(e.to_string())
    }
}

/// 错误响应 DTO
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: u16,
    pub message: String,
    pub retryable: bool,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let error_response = ErrorResponse {
            error: ErrorDetail {
                code: self.code(),
                message: self.user_message(),
                retryable: self.is_retryable(),
            },
        };

        if status.is_server_error() {
            tracing::error!(code = self.code(), message = %self, "Application error");
        } else {
            tracing::warn!(code = self.code(), message = %self, "Request rejected");
        }

        (status, Json(error_response)).into_response()
    }
}
