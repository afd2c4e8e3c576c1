use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Lifecycle of a result callback to the tenant.
///
/// Created `Init` together with its notification, flipped to `Pending` once
/// the notification reaches a terminal send state, and finished by the
/// callback loop as `Succeeded` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallbackLogStatus {
    Init,
    Pending,
    Succeeded,
    Failed,
}

impl CallbackLogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackLogStatus::Init => "INIT",
            CallbackLogStatus::Pending => "PENDING",
            CallbackLogStatus::Succeeded => "SUCCEEDED",
            CallbackLogStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s {
            "INIT" => Ok(CallbackLogStatus::Init),
            "PENDING" => Ok(CallbackLogStatus::Pending),
            "SUCCEEDED" => Ok(CallbackLogStatus::Succeeded),
            "FAILED" => Ok(CallbackLogStatus::Failed),
            other => Err(AppError::Internal(format!(
                "unknown callback log status: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for CallbackLogStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row per notification whose tenant has callbacks configured. The log
/// holds only the notification id; the notification knows nothing about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackLog {
    /// Identity of the log and of its owning notification.
    pub notification_id: i64,
    pub retry_count: u32,
    /// Epoch ms after which the next delivery attempt may run.
    pub next_retry_time: i64,
    pub status: CallbackLogStatus,
}
