use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::redis::current_time_ms;

use super::strategy::SendStrategyConfig;

/// Delivery channel for a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    Sms,
    Email,
    InApp,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Sms => "SMS",
            Channel::Email => "EMAIL",
            Channel::InApp => "IN_APP",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s {
            "SMS" => Ok(Channel::Sms),
            "EMAIL" => Ok(Channel::Email),
            "IN_APP" => Ok(Channel::InApp),
            other => Err(AppError::InvalidParameter(format!(
                "unknown channel: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Send lifecycle. `Prepare` is used only by the transactional flow;
/// non-transactional acceptance starts at `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SendStatus {
    Prepare,
    Canceled,
    Pending,
    Sending,
    Succeeded,
    Failed,
}

impl SendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendStatus::Prepare => "PREPARE",
            SendStatus::Canceled => "CANCELED",
            SendStatus::Pending => "PENDING",
            SendStatus::Sending => "SENDING",
            SendStatus::Succeeded => "SUCCEEDED",
            SendStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s {
            "PREPARE" => Ok(SendStatus::Prepare),
            "CANCELED" => Ok(SendStatus::Canceled),
            "PENDING" => Ok(SendStatus::Pending),
            "SENDING" => Ok(SendStatus::Sending),
            "SUCCEEDED" => Ok(SendStatus::Succeeded),
            "FAILED" => Ok(SendStatus::Failed),
            other => Err(AppError::Internal(format!("unknown send status: {other}"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SendStatus::Succeeded | SendStatus::Failed | SendStatus::Canceled
        )
    }

    /// The state machine only ever moves forward:
    /// `PREPARE -> {CANCELED, PENDING}`, `PENDING -> SENDING`,
    /// `SENDING -> {SUCCEEDED, FAILED}`.
    pub fn can_transition_to(&self, next: SendStatus) -> bool {
        match (self, next) {
            (SendStatus::Prepare, SendStatus::Canceled)
            | (SendStatus::Prepare, SendStatus::Pending)
            | (SendStatus::Pending, SendStatus::Sending)
            | (SendStatus::Pending, SendStatus::Succeeded)
            | (SendStatus::Pending, SendStatus::Failed)
            | (SendStatus::Sending, SendStatus::Succeeded)
            | (SendStatus::Sending, SendStatus::Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a published channel template plus its parameter bindings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateRef {
    pub id: i64,
    pub version_id: i64,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

/// The primary entity: one accepted delivery request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// Globally unique id; carries the shard placement segment.
    pub id: i64,
    pub biz_id: i64,
    /// Tenant-scoped idempotency key; `(biz_id, key)` is unique.
    pub key: String,
    pub receivers: Vec<String>,
    pub channel: Channel,
    pub template: TemplateRef,
    pub status: SendStatus,
    /// Send window, epoch milliseconds.
    pub scheduled_start: i64,
    pub scheduled_end: i64,
    /// Optimistic concurrency version; every state change increments it.
    pub version: i32,
    pub strategy: SendStrategyConfig,
}

impl Notification {
    /// Fill `[scheduled_start, scheduled_end]` from the strategy config.
    pub fn fill_send_window(&mut self) {
        let (start, end) = self.strategy.send_window(current_time_ms());
        self.scheduled_start = start;
        self.scheduled_end = end;
    }

    pub fn is_immediate(&self) -> bool {
        matches!(self.strategy, SendStrategyConfig::Immediate)
    }

    /// Asynchronous APIs cannot honor IMMEDIATE synchronously; rewrite it so
    /// the scheduler picks the notification up within a minute.
    pub fn replace_async_immediate(&mut self) {
        if self.is_immediate() {
            const ONE_MINUTE_MS: i64 = 60_000;
            self.strategy = SendStrategyConfig::Deadline {
                deadline_ms: current_time_ms() + ONE_MINUTE_MS,
            };
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.biz_id <= 0 {
            return Err(AppError::InvalidParameter("biz_id must be positive".into()));
        }
        if self.key.is_empty() {
            return Err(AppError::InvalidParameter("key must not be empty".into()));
        }
        if self.receivers.is_empty() {
            return Err(AppError::InvalidParameter(
                "at least one receiver is required".into(),
            ));
        }
        if self.template.id <= 0 {
            return Err(AppError::InvalidParameter(
                "template id must be positive".into(),
            ));
        }
        if self.template.params.is_empty() {
            return Err(AppError::InvalidParameter(
                "template params must not be empty".into(),
            ));
        }
        self.strategy.validate(current_time_ms())
    }
}

/// Result of a send operation as surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendReceipt {
    pub notification_id: i64,
    pub status: SendStatus,
}
