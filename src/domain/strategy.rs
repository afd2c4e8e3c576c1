use serde::{Deserialize, Serialize};

use crate::error::AppError;

const IMMEDIATE_WINDOW_MS: i64 = 30 * 60 * 1_000;
const SCHEDULED_TOLERANCE_MS: i64 = 3_000;
const MAX_DELAY_SECONDS: i64 = 24 * 60 * 60;

/// When a notification may be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SendStrategyConfig {
    /// Send at acceptance; window = [now, now + 30 min].
    Immediate,
    /// Window = [now, now + delay]; delay capped at 24 h.
    Delayed { delay_seconds: i64 },
    /// Window = [t - 3 s, t]; t must be in the future.
    Scheduled { send_time_ms: i64 },
    /// Explicit [start, end] window.
    Window { start_ms: i64, end_ms: i64 },
    /// Window = [now, deadline]; deadline must be in the future.
    Deadline { deadline_ms: i64 },
}

impl SendStrategyConfig {
    /// Earliest and latest send time, epoch milliseconds.
    pub fn send_window(&self, now_ms: i64) -> (i64, i64) {
        match *self {
            SendStrategyConfig::Immediate => (now_ms, now_ms + IMMEDIATE_WINDOW_MS),
            SendStrategyConfig::Delayed { delay_seconds } => {
                (now_ms, now_ms + delay_seconds * 1_000)
            }
            SendStrategyConfig::Scheduled { send_time_ms } => {
                (send_time_ms - SCHEDULED_TOLERANCE_MS, send_time_ms)
            }
            SendStrategyConfig::Window { start_ms, end_ms } => (start_ms, end_ms),
            SendStrategyConfig::Deadline { deadline_ms } => (now_ms, deadline_ms),
        }
    }

    pub fn validate(&self, now_ms: i64) -> Result<(), AppError> {
        match *self {
            SendStrategyConfig::Immediate => Ok(()),
            SendStrategyConfig::Delayed { delay_seconds } => {
                if delay_seconds <= 0 {
                    return Err(AppError::InvalidParameter(
                        "delayed strategy requires a positive delay".into(),
                    ));
                }
                if delay_seconds > MAX_DELAY_SECONDS {
                    return Err(AppError::InvalidParameter(
                        "delayed strategy cannot exceed 24 hours".into(),
                    ));
                }
                Ok(())
            }
            SendStrategyConfig::Scheduled { send_time_ms } => {
                if send_time_ms <= now_ms {
                    return Err(AppError::InvalidParameter(
                        "scheduled strategy requires a future send time".into(),
                    ));
                }
                Ok(())
            }
            SendStrategyConfig::Window { start_ms, end_ms } => {
                if start_ms <= 0 || start_ms > end_ms {
                    return Err(AppError::InvalidParameter(
                        "window strategy requires start <= end".into(),
                    ));
                }
                Ok(())
            }
            SendStrategyConfig::Deadline { deadline_ms } => {
                if deadline_ms <= now_ms {
                    return Err(AppError::InvalidParameter(
                        "deadline strategy requires a future deadline".into(),
                    ));
                }
                Ok(())
            }
        }
    }
}

impl Default for SendStrategyConfig {
    fn default() -> Self {
        SendStrategyConfig::Immediate
    }
}
