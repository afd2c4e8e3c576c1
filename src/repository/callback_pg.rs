//! PostgreSQL callback-log repository.
//!
//! One `callback_logs` table per database shard, rows keyed by notification
//! id. Notification ids are globally unique, so pages merged across
//! databases still order and resume correctly.

use async_trait::async_trait;
use sqlx::FromRow;

use crate::domain::{CallbackLog, CallbackLogStatus};
use crate::error::Result;
use crate::postgres::ShardedPools;
use crate::redis::current_time_ms;
use crate::sharding::ShardingStrategy;

use super::CallbackLogRepository;

#[derive(FromRow)]
struct CallbackLogRow {
    notification_id: i64,
    retry_count: i32,
    next_retry_time: i64,
    status: String,
}

impl CallbackLogRow {
    fn into_domain(self) -> Result<CallbackLog> {
        Ok(CallbackLog {
            notification_id: self.notification_id,
            retry_count: self.retry_count as u32,
            next_retry_time: self.next_retry_time,
            status: CallbackLogStatus::parse(&self.status)?,
        })
    }
}

pub struct PgCallbackLogRepository {
    pools: ShardedPools,
    strategy: ShardingStrategy,
}

impl PgCallbackLogRepository {
    pub fn new(pools: ShardedPools, strategy: ShardingStrategy) -> Self {
        Self { pools, strategy }
    }
}

#[async_trait]
impl CallbackLogRepository for PgCallbackLogRepository {
    async fn find_pending(
        &self,
        start_time: i64,
        batch_size: usize,
        start_id: i64,
    ) -> Result<(Vec<CallbackLog>, i64)> {
        let mut merged: Vec<CallbackLog> = Vec::new();
        for db_suffix in 0..self.pools.shard_count() as u32 {
            let pool = self.pools.pool(db_suffix)?;
            let rows: Vec<CallbackLogRow> = sqlx::query_as(
                r#"
                SELECT notification_id, retry_count, next_retry_time, status
                FROM callback_logs
                WHERE next_retry_time <= $1 AND status = $2 AND notification_id > $3
                ORDER BY notification_id ASC
                LIMIT $4
                "#,
            )
            .bind(start_time)
            .bind(CallbackLogStatus::Pending.as_str())
            .bind(start_id)
            .bind(batch_size as i64)
            .fetch_all(pool)
            .await?;
            for row in rows {
                merged.push(row.into_domain()?);
            }
        }

        merged.sort_by_key(|log| log.notification_id);
        merged.truncate(batch_size);
        let next_start_id = merged
            .last()
            .map(|log| log.notification_id)
            .unwrap_or(0);
        Ok((merged, next_start_id))
    }

    async fn find_by_notification_ids(&self, notification_ids: &[i64]) -> Result<Vec<CallbackLog>> {
        let mut grouped: std::collections::HashMap<u32, Vec<i64>> = std::collections::HashMap::new();
        for &id in notification_ids {
            let dst = self.strategy.shard_with_id(id);
            grouped.entry(dst.db_suffix).or_default().push(id);
        }

        let mut result = Vec::with_capacity(notification_ids.len());
        for (db_suffix, ids) in grouped {
            let pool = self.pools.pool(db_suffix)?;
            let rows: Vec<CallbackLogRow> = sqlx::query_as(
                r#"
                SELECT notification_id, retry_count, next_retry_time, status
                FROM callback_logs
                WHERE notification_id = ANY($1)
                "#,
            )
            .bind(&ids)
            .fetch_all(pool)
            .await?;
            for row in rows {
                result.push(row.into_domain()?);
            }
        }
        Ok(result)
    }

    async fn update(&self, logs: &[CallbackLog]) -> Result<()> {
        if logs.is_empty() {
            return Ok(());
        }
        let now = current_time_ms();
        let mut grouped: std::collections::HashMap<u32, Vec<&CallbackLog>> =
            std::collections::HashMap::new();
        for log in logs {
            let dst = self.strategy.shard_with_id(log.notification_id);
            grouped.entry(dst.db_suffix).or_default().push(log);
        }

        for (db_suffix, shard_logs) in grouped {
            let pool = self.pools.pool(db_suffix)?;
            let mut tx = pool.begin().await?;
            for log in shard_logs {
                sqlx::query(
                    r#"
                    UPDATE callback_logs
                    SET retry_count = $1, next_retry_time = $2, status = $3, utime = $4
                    WHERE notification_id = $5
                    "#,
                )
                .bind(log.retry_count as i32)
                .bind(log.next_retry_time)
                .bind(log.status.as_str())
                .bind(now)
                .bind(log.notification_id)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
        }
        Ok(())
    }
}
