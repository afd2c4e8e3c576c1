use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tenant-configured retry policy, stored as part of the business config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryPolicy {
    FixedInterval {
        interval_ms: u64,
        max_retries: u32,
    },
    ExponentialBackoff {
        initial_interval_ms: u64,
        max_interval_ms: u64,
        max_retries: u32,
    },
}

impl RetryPolicy {
    /// Interval to wait before retry number `retries` (1-based count of
    /// attempts already made). `None` means the policy is exhausted.
    pub fn interval_for(&self, retries: u32) -> Option<Duration> {
        match *self {
            RetryPolicy::FixedInterval {
                interval_ms,
                max_retries,
            } => {
                if retries > max_retries {
                    return None;
                }
                Some(Duration::from_millis(interval_ms))
            }
            RetryPolicy::ExponentialBackoff {
                initial_interval_ms,
                max_interval_ms,
                max_retries,
            } => {
                if retries > max_retries {
                    return None;
                }
                let exponent = retries.saturating_sub(1).min(63);
                let interval = initial_interval_ms
                    .checked_shl(exponent)
                    .unwrap_or(max_interval_ms)
                    .min(max_interval_ms);
                Some(Duration::from_millis(interval))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_interval_is_constant_until_exhausted() {
        let policy = RetryPolicy::FixedInterval {
            interval_ms: 500,
            max_retries: 3,
        };
        assert_eq!(policy.interval_for(1), Some(Duration::from_millis(500)));
        assert_eq!(policy.interval_for(3), Some(Duration::from_millis(500)));
        assert_eq!(policy.interval_for(4), None);
    }

    #[test]
    fn exponential_doubles_and_caps() {
        let policy = RetryPolicy::ExponentialBackoff {
            initial_interval_ms: 100,
            max_interval_ms: 1_000,
            max_retries: 10,
        };
        assert_eq!(policy.interval_for(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.interval_for(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.interval_for(3), Some(Duration::from_millis(400)));
        assert_eq!(policy.interval_for(4), Some(Duration::from_millis(800)));
        assert_eq!(policy.interval_for(5), Some(Duration::from_millis(1_000)));
        assert_eq!(policy.interval_for(9), Some(Duration::from_millis(1_000)));
        assert_eq!(policy.interval_for(11), None);
    }

    #[test]
    fn shift_overflow_saturates_to_max() {
        let policy = RetryPolicy::ExponentialBackoff {
            initial_interval_ms: u64::MAX / 2,
            max_interval_ms: 60_000,
            max_retries: 100,
        };
        assert_eq!(policy.interval_for(80), Some(Duration::from_millis(60_000)));
    }

    #[test]
    fn serde_round_trip() {
        let policy = RetryPolicy::ExponentialBackoff {
            initial_interval_ms: 100,
            max_interval_ms: 5_000,
            max_retries: 5,
        };
        let json = serde_json::to_string(&policy).unwrap();
        let back: RetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, policy);
    }
}
