use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Business error codes surfaced to tenants inside a successful response
/// envelope. System errors never map to one of these; they surface as a
/// transport-level status instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidParameter,
    TemplateNotFound,
    ChannelDisabled,
    RateLimited,
    NoAvailableProvider,
    NoQuota,
    DuplicateKey,
    SendInProgress,
    ConfigNotFound,
    NotificationNotFound,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidParameter => "INVALID_PARAMETER",
            ErrorCode::TemplateNotFound => "TEMPLATE_NOT_FOUND",
            ErrorCode::ChannelDisabled => "CHANNEL_DISABLED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::NoAvailableProvider => "NO_AVAILABLE_PROVIDER",
            ErrorCode::NoQuota => "NO_QUOTA",
            ErrorCode::DuplicateKey => "DUPLICATE_KEY",
            ErrorCode::SendInProgress => "SEND_IN_PROGRESS",
            ErrorCode::ConfigNotFound => "CONFIG_NOT_FOUND",
            ErrorCode::NotificationNotFound => "NOTIFICATION_NOT_FOUND",
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Rate limit exceeded for biz {0}")]
    RateLimited(i64),

    #[error("Quota exhausted for biz {biz_id} channel {channel}")]
    NoQuota { biz_id: i64, channel: String },

    #[error("Duplicate notification for (biz_id, key)")]
    DuplicateNotification,

    #[error("Version mismatch updating notification {0}")]
    VersionMismatch(i64),

    #[error("Notification not found: {0}")]
    NotificationNotFound(String),

    #[error("Business config not found for biz {0}")]
    ConfigNotFound(i64),

    #[error("Send already in progress for this key")]
    SendInProgress,

    #[error("No available provider")]
    NoAvailableProvider,

    #[error("No channel configured: {0}")]
    NoAvailableChannel(String),

    #[error("Provider rejected send: {code}: {message}")]
    ProviderRejected { code: String, message: String },

    #[error("Lock unavailable: {0}")]
    LockUnavailable(String),

    #[error("Shard limit reached")]
    ShardLimitReached,

    #[error("Error condition met")]
    ErrorConditionMet,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Tenant call failed: {0}")]
    TenantCall(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Business errors are the caller's to handle; they ride back inside the
    /// response envelope. Everything else is a system error.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            AppError::InvalidParameter(_) => Some(ErrorCode::InvalidParameter),
            AppError::RateLimited(_) => Some(ErrorCode::RateLimited),
            AppError::NoQuota { .. } => Some(ErrorCode::NoQuota),
            AppError::DuplicateNotification => Some(ErrorCode::DuplicateKey),
            AppError::SendInProgress => Some(ErrorCode::SendInProgress),
            AppError::NoAvailableProvider => Some(ErrorCode::NoAvailableProvider),
            AppError::NoAvailableChannel(_) => Some(ErrorCode::ChannelDisabled),
            AppError::ConfigNotFound(_) => Some(ErrorCode::ConfigNotFound),
            AppError::NotificationNotFound(_) => Some(ErrorCode::NotificationNotFound),
            _ => None,
        }
    }

    pub fn is_business(&self) -> bool {
        self.error_code().is_some()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// Check if running in production mode (based on RUN_MODE env var)
fn is_production() -> bool {
    std::env::var("RUN_MODE")
        .map(|m| m == "production" || m == "prod")
        .unwrap_or(false)
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            AppError::Auth(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            AppError::InvalidParameter(_) => (StatusCode::BAD_REQUEST, "INVALID_PARAMETER"),
            AppError::RateLimited(_) => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED"),
            AppError::NotificationNotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            AppError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR"),
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR"),
            AppError::Redis(_) => (StatusCode::INTERNAL_SERVER_ERROR, "REDIS_ERROR"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        let log_message = self.to_string();
        let client_message = if status == StatusCode::INTERNAL_SERVER_ERROR && is_production() {
            "Internal server error".to_string()
        } else {
            log_message.clone()
        };

        // Always log the detailed error server-side
        tracing::error!(
            code = %code,
            status = %status.as_u16(),
            message = %log_message,
            "API error"
        );

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: client_message,
            },
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
