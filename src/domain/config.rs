use serde::{Deserialize, Serialize};

use super::notification::Channel;
use super::retry::RetryPolicy;

/// Per-tenant configuration. The JSON-typed sections live in JSONB columns
/// and are cached in the two-tier config cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessConfig {
    pub id: i64,
    pub owner_id: i64,
    /// "person" or "organization".
    pub owner_type: String,
    pub channel_config: Option<ChannelConfig>,
    pub tx_config: Option<TxConfig>,
    pub callback_config: Option<CallbackConfig>,
    pub quota_config: Option<QuotaConfig>,
    /// Requests per second admitted for this tenant; 0 disables the limit.
    pub rate_limit: u32,
    pub ctime: i64,
    pub utime: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub channels: Vec<ChannelItem>,
    pub retry_policy: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelItem {
    pub channel: Channel,
    pub priority: u32,
    pub enabled: bool,
}

/// Transactional check-back configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxConfig {
    /// Tenant's transaction-check service, resolved via the endpoint registry.
    pub service_name: String,
    /// The tenant expects to resolve the transaction within this many seconds.
    pub initial_delay_seconds: i64,
    pub retry_policy: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackConfig {
    pub service_name: String,
    pub retry_policy: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub monthly: MonthlyQuota,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MonthlyQuota {
    pub sms: i32,
    pub email: i32,
}
