use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::redis::current_time_ms;

use super::config::TxConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxNotificationStatus {
    /// Prepared, awaiting commit/cancel or check-back resolution.
    Prepare,
    Commit,
    /// Cancelled by the tenant.
    Cancel,
    /// Check-back retries exhausted or unresolvable.
    Fail,
}

impl TxNotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxNotificationStatus::Prepare => "PREPARE",
            TxNotificationStatus::Commit => "COMMIT",
            TxNotificationStatus::Cancel => "CANCEL",
            TxNotificationStatus::Fail => "FAIL",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s {
            "PREPARE" => Ok(TxNotificationStatus::Prepare),
            "COMMIT" => Ok(TxNotificationStatus::Commit),
            "CANCEL" => Ok(TxNotificationStatus::Cancel),
            "FAIL" => Ok(TxNotificationStatus::Fail),
            other => Err(AppError::Internal(format!("unknown tx status: {other}"))),
        }
    }
}

impl std::fmt::Display for TxNotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one transactional (two-phase) notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxNotification {
    pub tx_id: i64,
    pub biz_id: i64,
    pub key: String,
    pub notification_id: i64,
    pub status: TxNotificationStatus,
    /// Check-backs performed so far.
    pub check_count: u32,
    /// Epoch ms of the next check-back; 0 means never check.
    pub next_check_time: i64,
    pub ctime: i64,
    pub utime: i64,
}

impl TxNotification {
    /// Advance to the next check-back time per the tenant's retry policy, or
    /// fail terminally when retries are exhausted.
    pub fn schedule_next_check(&mut self, config: &TxConfig) {
        let interval = config
            .retry_policy
            .and_then(|policy| policy.interval_for(self.check_count));
        match interval {
            Some(interval) => {
                self.next_check_time = current_time_ms() + interval.as_millis() as i64;
            }
            None => {
                self.next_check_time = 0;
                self.status = TxNotificationStatus::Fail;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::retry::RetryPolicy;

    fn tx(check_count: u32) -> TxNotification {
        TxNotification {
            tx_id: 1,
            biz_id: 7,
            key: "k1".to_string(),
            notification_id: 100,
            status: TxNotificationStatus::Prepare,
            check_count,
            next_check_time: 0,
            ctime: 0,
            utime: 0,
        }
    }

    fn config(max_retries: u32) -> TxConfig {
        TxConfig {
            service_name: "order-service".to_string(),
            initial_delay_seconds: 5,
            retry_policy: Some(RetryPolicy::FixedInterval {
                interval_ms: 1_000,
                max_retries,
            }),
        }
    }

    #[test]
    fn schedules_next_check_within_policy() {
        let mut txn = tx(1);
        txn.schedule_next_check(&config(3));
        assert_eq!(txn.status, TxNotificationStatus::Prepare);
        assert!(txn.next_check_time > current_time_ms() - 100);
    }

    #[test]
    fn fails_when_retries_exhausted() {
        let mut txn = tx(4);
        txn.schedule_next_check(&config(3));
        assert_eq!(txn.status, TxNotificationStatus::Fail);
        assert_eq!(txn.next_check_time, 0);
    }

    #[test]
    fn fails_without_retry_policy() {
        let mut txn = tx(1);
        let config = TxConfig {
            service_name: "order-service".to_string(),
            initial_delay_seconds: 5,
            retry_policy: None,
        };
        txn.schedule_next_check(&config);
        assert_eq!(txn.status, TxNotificationStatus::Fail);
    }
}
