//! Tenant configuration store with a two-tier cache.
//!
//! Reads go process-local map -> Redis -> durable store; writes invalidate
//! through a Redis pub/sub channel that every process subscribes to.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use sqlx::FromRow;
use tokio_util::sync::CancellationToken;

use crate::domain::BusinessConfig;
use crate::error::{AppError, Result};
use crate::postgres::ShardedPools;
use crate::redis::current_time_ms;

use super::BusinessConfigService;

const REDIS_TTL_SECONDS: u64 = 600;
const LOCAL_TTL: Duration = Duration::from_secs(60);

/// Durable tenant configuration rows.
#[async_trait]
pub trait BusinessConfigStore: Send + Sync {
    async fn get(&self, biz_id: i64) -> Result<Option<BusinessConfig>>;
    async fn get_many(&self, biz_ids: &[i64]) -> Result<HashMap<i64, BusinessConfig>>;
    async fn save(&self, config: &BusinessConfig) -> Result<()>;
}

#[derive(FromRow)]
struct BusinessConfigRow {
    id: i64,
    owner_id: i64,
    owner_type: String,
    channel_config: Option<serde_json::Value>,
    tx_config: Option<serde_json::Value>,
    callback_config: Option<serde_json::Value>,
    quota_config: Option<serde_json::Value>,
    rate_limit: i32,
    ctime: i64,
    utime: i64,
}

impl BusinessConfigRow {
    fn into_domain(self) -> Result<BusinessConfig> {
        fn section<T: serde::de::DeserializeOwned>(
            value: Option<serde_json::Value>,
            name: &str,
        ) -> Result<Option<T>> {
            value
                .filter(|v| !v.is_null())
                .map(|v| {
                    serde_json::from_value(v).map_err(|e| {
                        AppError::Internal(format!("corrupt {name} config column: {e}"))
                    })
                })
                .transpose()
        }

        Ok(BusinessConfig {
            id: self.id,
            owner_id: self.owner_id,
            owner_type: self.owner_type,
            channel_config: section(self.channel_config, "channel")?,
            tx_config: section(self.tx_config, "tx")?,
            callback_config: section(self.callback_config, "callback")?,
            quota_config: section(self.quota_config, "quota")?,
            rate_limit: self.rate_limit.max(0) as u32,
            ctime: self.ctime,
            utime: self.utime,
        })
    }
}

/// Business configs are tenant metadata, not sharded data; they live on
/// database shard 0.
pub struct PgBusinessConfigStore {
    pools: ShardedPools,
}

impl PgBusinessConfigStore {
    pub fn new(pools: ShardedPools) -> Self {
        Self { pools }
    }

    const COLUMNS: &'static str = "id, owner_id, owner_type, channel_config, tx_config, \
         callback_config, quota_config, rate_limit, ctime, utime";
}

#[async_trait]
impl BusinessConfigStore for PgBusinessConfigStore {
    async fn get(&self, biz_id: i64) -> Result<Option<BusinessConfig>> {
        let pool = self.pools.pool(0)?;
        let sql = format!(
            "SELECT {} FROM business_configs WHERE id = $1",
            Self::COLUMNS
        );
        let row: Option<BusinessConfigRow> = sqlx::query_as(&sql)
            .bind(biz_id)
            .fetch_optional(pool)
            .await?;
        row.map(BusinessConfigRow::into_domain).transpose()
    }

    async fn get_many(&self, biz_ids: &[i64]) -> Result<HashMap<i64, BusinessConfig>> {
        let pool = self.pools.pool(0)?;
        let sql = format!(
            "SELECT {} FROM business_configs WHERE id = ANY($1)",
            Self::COLUMNS
        );
        let rows: Vec<BusinessConfigRow> = sqlx::query_as(&sql)
            .bind(biz_ids)
            .fetch_all(pool)
            .await?;
        let mut result = HashMap::with_capacity(rows.len());
        for row in rows {
            let config = row.into_domain()?;
            result.insert(config.id, config);
        }
        Ok(result)
    }

    async fn save(&self, config: &BusinessConfig) -> Result<()> {
        let pool = self.pools.pool(0)?;
        let now = current_time_ms();
        let sql = r#"
            INSERT INTO business_configs
                (id, owner_id, owner_type, channel_config, tx_config, callback_config,
                 quota_config, rate_limit, ctime, utime)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
            ON CONFLICT (id) DO UPDATE SET
                owner_id = EXCLUDED.owner_id,
                owner_type = EXCLUDED.owner_type,
                channel_config = EXCLUDED.channel_config,
                tx_config = EXCLUDED.tx_config,
                callback_config = EXCLUDED.callback_config,
                quota_config = EXCLUDED.quota_config,
                rate_limit = EXCLUDED.rate_limit,
                utime = EXCLUDED.utime
        "#;
        fn json_column<T: serde::Serialize>(value: &Option<T>) -> Option<serde_json::Value> {
            value.as_ref().and_then(|v| serde_json::to_value(v).ok())
        }
        sqlx::query(sql)
            .bind(config.id)
            .bind(config.owner_id)
            .bind(&config.owner_type)
            .bind(json_column(&config.channel_config))
            .bind(json_column(&config.tx_config))
            .bind(json_column(&config.callback_config))
            .bind(json_column(&config.quota_config))
            .bind(config.rate_limit as i32)
            .bind(now)
            .execute(pool)
            .await?;
        Ok(())
    }
}

struct CachedEntry {
    config: BusinessConfig,
    cached_at: Instant,
}

/// Two-tier cached view over a [`BusinessConfigStore`].
pub struct CachedBusinessConfigService {
    store: Arc<dyn BusinessConfigStore>,
    local: DashMap<i64, CachedEntry>,
    local_ttl: Duration,
    redis: Option<ConnectionManager>,
}

impl CachedBusinessConfigService {
    pub fn new(store: Arc<dyn BusinessConfigStore>, redis: Option<ConnectionManager>) -> Self {
        Self {
            store,
            local: DashMap::new(),
            local_ttl: LOCAL_TTL,
            redis,
        }
    }

    fn redis_key(biz_id: i64) -> String {
        format!("bizconfig:{biz_id}")
    }

    fn local_get(&self, biz_id: i64) -> Option<BusinessConfig> {
        let entry = self.local.get(&biz_id)?;
        if entry.cached_at.elapsed() > self.local_ttl {
            drop(entry);
            self.local.remove(&biz_id);
            return None;
        }
        Some(entry.config.clone())
    }

    fn local_put(&self, config: &BusinessConfig) {
        self.local.insert(
            config.id,
            CachedEntry {
                config: config.clone(),
                cached_at: Instant::now(),
            },
        );
    }

    async fn redis_get(&self, biz_id: i64) -> Option<BusinessConfig> {
        let mut conn = self.redis.clone()?;
        let raw: Option<String> = conn.get(Self::redis_key(biz_id)).await.ok()?;
        serde_json::from_str(&raw?).ok()
    }

    async fn redis_put(&self, config: &BusinessConfig) {
        let Some(mut conn) = self.redis.clone() else {
            return;
        };
        let Ok(raw) = serde_json::to_string(config) else {
            return;
        };
        let result: std::result::Result<(), redis::RedisError> = conn
            .set_ex(Self::redis_key(config.id), raw, REDIS_TTL_SECONDS)
            .await;
        if let Err(e) = result {
            tracing::warn!(biz_id = config.id, error = %e, "failed to cache config in redis");
        }
    }

    /// Drop both cache tiers for one tenant. Invoked locally by the
    /// invalidation subscriber and directly after a config save.
    pub async fn invalidate(&self, biz_id: i64) {
        self.local.remove(&biz_id);
        if let Some(mut conn) = self.redis.clone() {
            let result: std::result::Result<(), redis::RedisError> =
                conn.del(Self::redis_key(biz_id)).await;
            if let Err(e) = result {
                tracing::warn!(biz_id, error = %e, "failed to evict config from redis");
            }
        }
    }
}

#[async_trait]
impl BusinessConfigService for CachedBusinessConfigService {
    async fn get_by_id(&self, biz_id: i64) -> Result<BusinessConfig> {
        if let Some(config) = self.local_get(biz_id) {
            return Ok(config);
        }
        if let Some(config) = self.redis_get(biz_id).await {
            self.local_put(&config);
            return Ok(config);
        }
        let config = self
            .store
            .get(biz_id)
            .await?
            .ok_or(AppError::ConfigNotFound(biz_id))?;
        self.local_put(&config);
        self.redis_put(&config).await;
        Ok(config)
    }

    async fn get_by_ids(&self, biz_ids: &[i64]) -> Result<HashMap<i64, BusinessConfig>> {
        let mut result = HashMap::with_capacity(biz_ids.len());
        let mut missing = Vec::new();
        for &biz_id in biz_ids {
            match self.local_get(biz_id) {
                Some(config) => {
                    result.insert(biz_id, config);
                }
                None => missing.push(biz_id),
            }
        }
        if !missing.is_empty() {
            let fetched = self.store.get_many(&missing).await?;
            for config in fetched.values() {
                self.local_put(config);
            }
            result.extend(fetched);
        }
        Ok(result)
    }
}

/// Subscribe to the invalidation channel and evict on every message. Runs
/// until cancellation; payloads are decimal biz ids.
pub async fn run_invalidation_listener(
    client: redis::Client,
    channel: String,
    service: Arc<CachedBusinessConfigService>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let pubsub = match client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                tracing::warn!(error = %e, "config invalidation subscribe failed, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
                }
            }
        };
        let mut pubsub = pubsub;
        if let Err(e) = pubsub.subscribe(&channel).await {
            tracing::warn!(error = %e, "config invalidation subscribe failed, retrying");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
            }
        }
        tracing::info!(channel = %channel, "config invalidation listener subscribed");

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                message = stream.next() => {
                    let Some(message) = message else {
                        tracing::warn!("config invalidation stream closed, resubscribing");
                        break;
                    };
                    let payload: String = message.get_payload().unwrap_or_default();
                    match payload.parse::<i64>() {
                        Ok(biz_id) => {
                            tracing::debug!(biz_id, "evicting cached business config");
                            service.invalidate(biz_id).await;
                        }
                        Err(_) => {
                            tracing::warn!(payload = %payload, "ignoring malformed invalidation message");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::MemoryBusinessConfigStore;

    fn config(biz_id: i64) -> BusinessConfig {
        BusinessConfig {
            id: biz_id,
            owner_id: 1,
            owner_type: "organization".into(),
            channel_config: None,
            tx_config: None,
            callback_config: None,
            quota_config: None,
            rate_limit: 10,
            ctime: 0,
            utime: 0,
        }
    }

    #[tokio::test]
    async fn falls_through_to_store_and_caches_locally() {
        let store = Arc::new(MemoryBusinessConfigStore::new());
        store.save(&config(7)).await.unwrap();
        let service = CachedBusinessConfigService::new(store.clone(), None);

        let fetched = service.get_by_id(7).await.unwrap();
        assert_eq!(fetched.id, 7);

        // A second read is served from the local tier even if the store
        // changes underneath.
        let mut changed = config(7);
        changed.rate_limit = 99;
        store.save(&changed).await.unwrap();
        let cached = service.get_by_id(7).await.unwrap();
        assert_eq!(cached.rate_limit, 10);

        service.invalidate(7).await;
        let fresh = service.get_by_id(7).await.unwrap();
        assert_eq!(fresh.rate_limit, 99);
    }

    #[tokio::test]
    async fn missing_config_is_a_business_error() {
        let store = Arc::new(MemoryBusinessConfigStore::new());
        let service = CachedBusinessConfigService::new(store, None);
        assert!(matches!(
            service.get_by_id(404).await,
            Err(AppError::ConfigNotFound(404))
        ));
    }

    #[tokio::test]
    async fn get_by_ids_merges_cache_and_store() {
        let store = Arc::new(MemoryBusinessConfigStore::new());
        store.save(&config(1)).await.unwrap();
        store.save(&config(2)).await.unwrap();
        let service = CachedBusinessConfigService::new(store, None);

        let _ = service.get_by_id(1).await.unwrap();
        let configs = service.get_by_ids(&[1, 2, 3]).await.unwrap();
        assert_eq!(configs.len(), 2);
        assert!(configs.contains_key(&1));
        assert!(configs.contains_key(&2));
        assert!(!configs.contains_key(&3));
    }
}
