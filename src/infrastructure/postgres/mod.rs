//! PostgreSQL connection pools, one per database shard.

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::config::DatabaseConfig;
use crate::error::AppError;

/// Connection pools indexed by database shard suffix.
///
/// The sharding strategy decides which pool a row lives in; everything else
/// treats this as an opaque collection.
#[derive(Clone)]
pub struct ShardedPools {
    pools: Vec<PgPool>,
}

impl ShardedPools {
    /// Open one pool per configured DSN. The DSN at index `i` backs database
    /// shard `i`.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        if config.urls.is_empty() {
            return Err(AppError::Internal(
                "no database shard DSNs configured".to_string(),
            ));
        }

        let mut pools = Vec::with_capacity(config.urls.len());
        for (idx, url) in config.urls.iter().enumerate() {
            let pool = PgPoolOptions::new()
                .max_connections(config.pool_size)
                .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds as u64))
                .idle_timeout(Duration::from_secs(config.idle_timeout_seconds as u64))
                .connect(url)
                .await?;
            tracing::info!(
                db_shard = idx,
                pool_size = config.pool_size,
                "PostgreSQL connection pool created"
            );
            pools.push(pool);
        }
        Ok(Self { pools })
    }

    pub fn shard_count(&self) -> usize {
        self.pools.len()
    }

    /// Pool for the given database shard suffix.
    pub fn pool(&self, db_suffix: u32) -> Result<&PgPool, AppError> {
        self.pools.get(db_suffix as usize).ok_or_else(|| {
            AppError::Internal(format!("no pool for database shard {db_suffix}"))
        })
    }

    pub async fn close(&self) {
        for pool in &self.pools {
            pool.close().await;
        }
        tracing::info!("PostgreSQL connection pools closed");
    }
}

/// True when the error is a unique-constraint violation; used to map
/// duplicate `(biz_id, key)` inserts onto the duplicate business error.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    const UNIQUE_VIOLATION: &str = "23505";
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(UNIQUE_VIOLATION),
        _ => false,
    }
}
