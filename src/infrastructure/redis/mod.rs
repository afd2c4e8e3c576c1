//! Redis bootstrap shared by the quota cache, the distributed lock client,
//! and the config invalidation subscriber.

use redis::aio::ConnectionManager;
use redis::Client;

use crate::config::RedisConfig;
use crate::error::AppError;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn current_time_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Open a Redis client and a multiplexed connection manager.
///
/// The connection manager transparently reconnects, so long-lived loops can
/// hold a clone without their own retry plumbing.
pub async fn connect(config: &RedisConfig) -> Result<(Client, ConnectionManager), AppError> {
    let client = Client::open(config.url.as_str())?;
    let manager = ConnectionManager::new(client.clone()).await?;
    tracing::info!(url = %config.url, "Redis connection manager created");
    Ok((client, manager))
}
