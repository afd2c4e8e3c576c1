//! Durable quota rows. The hot counters live in the quota cache; these
//! rows are the authoritative monthly allowances, keyed by
//! `(biz_id, channel)` like tenant metadata on database shard 0.

use async_trait::async_trait;

use crate::domain::{Channel, Quota};
use crate::error::{AppError, Result};
use crate::postgres::ShardedPools;
use crate::redis::current_time_ms;

use super::QuotaStore;

pub struct PgQuotaStore {
    pools: ShardedPools,
}

impl PgQuotaStore {
    pub fn new(pools: ShardedPools) -> Self {
        Self { pools }
    }
}

#[async_trait]
impl QuotaStore for PgQuotaStore {
    async fn create_or_update(&self, quotas: &[Quota]) -> Result<()> {
        if quotas.is_empty() {
            return Ok(());
        }
        let pool = self.pools.pool(0)?;
        let now = current_time_ms();
        let mut tx = pool.begin().await?;
        for quota in quotas {
            sqlx::query(
                r#"
                INSERT INTO quotas (biz_id, channel, quota, ctime, utime)
                VALUES ($1, $2, $3, $4, $4)
                ON CONFLICT (biz_id, channel) DO UPDATE SET
                    quota = EXCLUDED.quota,
                    utime = EXCLUDED.utime
                "#,
            )
            .bind(quota.biz_id)
            .bind(quota.channel.as_str())
            .bind(quota.quota)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn find(&self, biz_id: i64, channel: Channel) -> Result<Quota> {
        let pool = self.pools.pool(0)?;
        let row: Option<(i32,)> = sqlx::query_as(
            "SELECT quota FROM quotas WHERE biz_id = $1 AND channel = $2",
        )
        .bind(biz_id)
        .bind(channel.as_str())
        .fetch_optional(pool)
        .await?;
        match row {
            Some((quota,)) => Ok(Quota {
                biz_id,
                channel,
                quota,
            }),
            None => Err(AppError::NoQuota {
                biz_id,
                channel: channel.as_str().to_string(),
            }),
        }
    }
}
