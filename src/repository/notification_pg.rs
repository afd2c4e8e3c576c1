//! PostgreSQL notification repository over sharded tables.
//!
//! Row placement is derived from the id's hash segment, so every operation
//! keyed by id or `(biz_id, key)` resolves its `(database, table)` pair
//! locally. Callback logs live next to their notification in the same
//! database shard, in one `callback_logs` table per database.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::domain::{
    CallbackLogStatus, Channel, Notification, SendStatus, SendStrategyConfig, TemplateRef,
};
use crate::error::{AppError, Result};
use crate::postgres::{is_unique_violation, ShardedPools};
use crate::redis::current_time_ms;
use crate::sharding::{ShardDst, ShardingStrategy};

use super::{quota_deltas, NotificationRepository, QuotaCache, QuotaDelta};

const SENDING_TIMEOUT_MS: i64 = 60_000;

#[derive(sqlx::FromRow)]
struct NotificationRow {
    id: i64,
    biz_id: i64,
    key: String,
    receivers: String,
    channel: String,
    template_id: i64,
    template_version_id: i64,
    template_params: String,
    status: String,
    scheduled_stime: i64,
    scheduled_etime: i64,
    strategy: serde_json::Value,
    version: i32,
}

impl NotificationRow {
    fn into_domain(self) -> Result<Notification> {
        let receivers: Vec<String> = serde_json::from_str(&self.receivers)
            .map_err(|e| AppError::Internal(format!("corrupt receivers column: {e}")))?;
        let params: HashMap<String, String> = serde_json::from_str(&self.template_params)
            .map_err(|e| AppError::Internal(format!("corrupt template params column: {e}")))?;
        let strategy: SendStrategyConfig = serde_json::from_value(self.strategy)
            .map_err(|e| AppError::Internal(format!("corrupt strategy column: {e}")))?;
        Ok(Notification {
            id: self.id,
            biz_id: self.biz_id,
            key: self.key,
            receivers,
            channel: Channel::parse(&self.channel)?,
            template: TemplateRef {
                id: self.template_id,
                version_id: self.template_version_id,
                params,
            },
            status: SendStatus::parse(&self.status)?,
            scheduled_start: self.scheduled_stime,
            scheduled_end: self.scheduled_etime,
            version: self.version,
            strategy,
        })
    }
}

pub struct PgNotificationRepository {
    pools: ShardedPools,
    strategy: ShardingStrategy,
    quota: Arc<dyn QuotaCache>,
}

impl PgNotificationRepository {
    pub fn new(pools: ShardedPools, strategy: ShardingStrategy, quota: Arc<dyn QuotaCache>) -> Self {
        Self {
            pools,
            strategy,
            quota,
        }
    }

    fn select_columns() -> &'static str {
        "id, biz_id, key, receivers, channel, template_id, template_version_id, \
         template_params, status, scheduled_stime, scheduled_etime, strategy, version"
    }

    fn pool_for(&self, dst: &ShardDst) -> Result<&PgPool> {
        self.pools.pool(dst.db_suffix)
    }

    async fn insert_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
        n: &Notification,
        now: i64,
    ) -> std::result::Result<(), sqlx::Error> {
        let receivers = serde_json::to_string(&n.receivers).unwrap_or_default();
        let params = serde_json::to_string(&n.template.params).unwrap_or_default();
        let strategy = serde_json::to_value(&n.strategy).unwrap_or(serde_json::Value::Null);
        let sql = format!(
            r#"
            INSERT INTO {table}
                (id, biz_id, key, receivers, channel, template_id, template_version_id,
                 template_params, status, scheduled_stime, scheduled_etime, strategy,
                 version, ctime, utime)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 1, $13, $13)
            "#
        );
        sqlx::query(&sql)
            .bind(n.id)
            .bind(n.biz_id)
            .bind(&n.key)
            .bind(receivers)
            .bind(n.channel.as_str())
            .bind(n.template.id)
            .bind(n.template.version_id)
            .bind(params)
            .bind(n.status.as_str())
            .bind(n.scheduled_start)
            .bind(n.scheduled_end)
            .bind(strategy)
            .bind(now)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn insert_callback_log_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        notification_id: i64,
        now: i64,
    ) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO callback_logs (notification_id, retry_count, next_retry_time, status, ctime, utime)
            VALUES ($1, 0, $2, $3, $2, $2)
            "#,
        )
        .bind(notification_id)
        .bind(now)
        .bind(CallbackLogStatus::Init.as_str())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Group notifications first by database shard, then by table within it.
    fn group_by_shard<'a>(
        &self,
        notifications: &'a [Notification],
    ) -> HashMap<u32, HashMap<String, Vec<&'a Notification>>> {
        let mut grouped: HashMap<u32, HashMap<String, Vec<&'a Notification>>> = HashMap::new();
        for n in notifications {
            let dst = self.strategy.shard_with_id(n.id);
            grouped
                .entry(dst.db_suffix)
                .or_default()
                .entry(dst.table)
                .or_default()
                .push(n);
        }
        grouped
    }

    async fn update_status_by_ids(
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
        ids: &[i64],
        status: SendStatus,
        now: i64,
    ) -> std::result::Result<(), sqlx::Error> {
        let sql = format!(
            "UPDATE {table} SET status = $1, version = version + 1, utime = $2 WHERE id = ANY($3)"
        );
        sqlx::query(&sql)
            .bind(status.as_str())
            .bind(now)
            .bind(ids)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn flip_callback_logs_pending(
        tx: &mut Transaction<'_, Postgres>,
        notification_ids: &[i64],
        now: i64,
    ) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE callback_logs SET status = $1, utime = $2 \
             WHERE notification_id = ANY($3) AND status = $4",
        )
        .bind(CallbackLogStatus::Pending.as_str())
        .bind(now)
        .bind(notification_ids)
        .bind(CallbackLogStatus::Init.as_str())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl NotificationRepository for PgNotificationRepository {
    async fn create(
        &self,
        notification: Notification,
        with_callback_log: bool,
    ) -> Result<Notification> {
        // Reserve quota before touching the database.
        self.quota
            .decr(notification.biz_id, notification.channel, 1)
            .await?;

        let result = async {
            let dst = self.strategy.shard_with_id(notification.id);
            let pool = self.pool_for(&dst)?;
            let now = current_time_ms();
            let mut tx = pool.begin().await?;
            if let Err(e) = Self::insert_in_tx(&mut tx, &dst.table, &notification, now).await {
                if is_unique_violation(&e) {
                    return Err(AppError::DuplicateNotification);
                }
                return Err(e.into());
            }
            if with_callback_log {
                Self::insert_callback_log_in_tx(&mut tx, notification.id, now).await?;
            }
            tx.commit().await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => Ok(notification),
            Err(e) => {
                // The row never landed; give the reservation back.
                if let Err(refund_err) = self
                    .quota
                    .incr(notification.biz_id, notification.channel, 1)
                    .await
                {
                    tracing::error!(
                        biz_id = notification.biz_id,
                        channel = %notification.channel,
                        error = %refund_err,
                        "quota refund failed after insert failure"
                    );
                }
                Err(e)
            }
        }
    }

    async fn batch_create(
        &self,
        notifications: Vec<Notification>,
        with_callback_log: bool,
    ) -> Result<Vec<Notification>> {
        if notifications.is_empty() {
            return Ok(notifications);
        }

        let deltas = quota_deltas(&notifications);
        self.quota.multi_decr(&deltas).await?;

        let result = async {
            let now = current_time_ms();
            for (db_suffix, tables) in self.group_by_shard(&notifications) {
                let pool = self.pools.pool(db_suffix)?;
                let mut tx = pool.begin().await?;
                for (table, rows) in tables {
                    for n in rows {
                        if let Err(e) = Self::insert_in_tx(&mut tx, &table, n, now).await {
                            if is_unique_violation(&e) {
                                return Err(AppError::DuplicateNotification);
                            }
                            return Err(e.into());
                        }
                        if with_callback_log {
                            Self::insert_callback_log_in_tx(&mut tx, n.id, now).await?;
                        }
                    }
                }
                tx.commit().await?;
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => Ok(notifications),
            Err(e) => {
                if let Err(refund_err) = self.quota.multi_incr(&deltas).await {
                    tracing::error!(
                        error = %refund_err,
                        "batched quota refund failed after insert failure"
                    );
                }
                Err(e)
            }
        }
    }

    async fn get_by_id(&self, id: i64) -> Result<Notification> {
        let dst = self.strategy.shard_with_id(id);
        let pool = self.pool_for(&dst)?;
        let sql = format!(
            "SELECT {} FROM {} WHERE id = $1",
            Self::select_columns(),
            dst.table
        );
        let row: Option<NotificationRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(pool)
            .await?;
        row.ok_or_else(|| AppError::NotificationNotFound(format!("id={id}")))?
            .into_domain()
    }

    async fn batch_get_by_ids(&self, ids: &[i64]) -> Result<HashMap<i64, Notification>> {
        let mut grouped: HashMap<(u32, String), Vec<i64>> = HashMap::new();
        for &id in ids {
            let dst = self.strategy.shard_with_id(id);
            grouped
                .entry((dst.db_suffix, dst.table))
                .or_default()
                .push(id);
        }

        let mut result = HashMap::with_capacity(ids.len());
        for ((db_suffix, table), shard_ids) in grouped {
            let pool = self.pools.pool(db_suffix)?;
            let sql = format!(
                "SELECT {} FROM {} WHERE id = ANY($1)",
                Self::select_columns(),
                table
            );
            let rows: Vec<NotificationRow> =
                sqlx::query_as(&sql).bind(&shard_ids).fetch_all(pool).await?;
            for row in rows {
                let n = row.into_domain()?;
                result.insert(n.id, n);
            }
        }
        Ok(result)
    }

    async fn get_by_key(&self, biz_id: i64, key: &str) -> Result<Notification> {
        let dst = self.strategy.shard(biz_id, key);
        let pool = self.pool_for(&dst)?;
        let sql = format!(
            "SELECT {} FROM {} WHERE biz_id = $1 AND key = $2",
            Self::select_columns(),
            dst.table
        );
        let row: Option<NotificationRow> = sqlx::query_as(&sql)
            .bind(biz_id)
            .bind(key)
            .fetch_optional(pool)
            .await?;
        row.ok_or_else(|| AppError::NotificationNotFound(format!("biz_id={biz_id} key={key}")))?
            .into_domain()
    }

    async fn get_by_keys(&self, biz_id: i64, keys: &[String]) -> Result<Vec<Notification>> {
        let mut result = Vec::with_capacity(keys.len());
        // Keys scatter across shards; group them to one query per table.
        let mut grouped: HashMap<(u32, String), Vec<&String>> = HashMap::new();
        for key in keys {
            let dst = self.strategy.shard(biz_id, key);
            grouped
                .entry((dst.db_suffix, dst.table))
                .or_default()
                .push(key);
        }
        for ((db_suffix, table), shard_keys) in grouped {
            let pool = self.pools.pool(db_suffix)?;
            let keys_owned: Vec<String> = shard_keys.into_iter().cloned().collect();
            let sql = format!(
                "SELECT {} FROM {} WHERE biz_id = $1 AND key = ANY($2)",
                Self::select_columns(),
                table
            );
            let rows: Vec<NotificationRow> = sqlx::query_as(&sql)
                .bind(biz_id)
                .bind(&keys_owned)
                .fetch_all(pool)
                .await?;
            for row in rows {
                result.push(row.into_domain()?);
            }
        }
        result.sort_by_key(|n| n.id);
        Ok(result)
    }

    async fn cas_status(&self, id: i64, expected_version: i32, status: SendStatus) -> Result<()> {
        let dst = self.strategy.shard_with_id(id);
        let pool = self.pool_for(&dst)?;
        let sql = format!(
            "UPDATE {} SET status = $1, version = version + 1, utime = $2 \
             WHERE id = $3 AND version = $4",
            dst.table
        );
        let result = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(current_time_ms())
            .bind(id)
            .bind(expected_version)
            .execute(pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::VersionMismatch(id));
        }
        Ok(())
    }

    async fn mark_success(&self, notification: &Notification) -> Result<()> {
        let dst = self.strategy.shard_with_id(notification.id);
        let pool = self.pool_for(&dst)?;
        let now = current_time_ms();
        let mut tx = pool.begin().await?;
        Self::update_status_by_ids(
            &mut tx,
            &dst.table,
            &[notification.id],
            SendStatus::Succeeded,
            now,
        )
        .await?;
        Self::flip_callback_logs_pending(&mut tx, &[notification.id], now).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn mark_failed(&self, notification: &Notification) -> Result<()> {
        let dst = self.strategy.shard_with_id(notification.id);
        let pool = self.pool_for(&dst)?;
        let now = current_time_ms();
        let mut tx = pool.begin().await?;
        Self::update_status_by_ids(
            &mut tx,
            &dst.table,
            &[notification.id],
            SendStatus::Failed,
            now,
        )
        .await?;
        Self::flip_callback_logs_pending(&mut tx, &[notification.id], now).await?;
        tx.commit().await?;

        self.quota
            .incr(notification.biz_id, notification.channel, 1)
            .await
    }

    async fn batch_mark_succeeded_or_failed(
        &self,
        succeeded: &[Notification],
        failed: &[Notification],
    ) -> Result<()> {
        if succeeded.is_empty() && failed.is_empty() {
            return Ok(());
        }
        let now = current_time_ms();

        // One transaction per database shard covering both outcome sets.
        let mut dbs: HashMap<u32, (HashMap<String, Vec<i64>>, HashMap<String, Vec<i64>>)> =
            HashMap::new();
        for n in succeeded {
            let dst = self.strategy.shard_with_id(n.id);
            dbs.entry(dst.db_suffix)
                .or_default()
                .0
                .entry(dst.table)
                .or_default()
                .push(n.id);
        }
        for n in failed {
            let dst = self.strategy.shard_with_id(n.id);
            dbs.entry(dst.db_suffix)
                .or_default()
                .1
                .entry(dst.table)
                .or_default()
                .push(n.id);
        }

        for (db_suffix, (success_tables, failed_tables)) in dbs {
            let pool = self.pools.pool(db_suffix)?;
            let mut tx = pool.begin().await?;
            let mut terminal_ids: Vec<i64> = Vec::new();
            for (table, ids) in success_tables {
                Self::update_status_by_ids(&mut tx, &table, &ids, SendStatus::Succeeded, now)
                    .await?;
                terminal_ids.extend(ids);
            }
            for (table, ids) in failed_tables {
                Self::update_status_by_ids(&mut tx, &table, &ids, SendStatus::Failed, now).await?;
                terminal_ids.extend(ids);
            }
            Self::flip_callback_logs_pending(&mut tx, &terminal_ids, now).await?;
            tx.commit().await?;
        }

        // Refund in bulk for the failed set.
        let deltas = quota_deltas(failed);
        if let Err(e) = self.quota.multi_incr(&deltas).await {
            tracing::error!(error = %e, "bulk quota refund failed for failed batch");
        }
        Ok(())
    }

    async fn find_ready(
        &self,
        shard: &ShardDst,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Notification>> {
        let pool = self.pool_for(shard)?;
        let now = current_time_ms();
        let sql = format!(
            "SELECT {} FROM {} \
             WHERE scheduled_stime <= $1 AND scheduled_etime >= $1 AND status = $2 \
             ORDER BY id LIMIT $3 OFFSET $4",
            Self::select_columns(),
            shard.table
        );
        let rows: Vec<NotificationRow> = sqlx::query_as(&sql)
            .bind(now)
            .bind(SendStatus::Pending.as_str())
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(pool)
            .await?;
        rows.into_iter().map(NotificationRow::into_domain).collect()
    }

    async fn mark_timeout_sending_as_failed(&self, batch_size: usize) -> Result<u64> {
        let deadline = current_time_ms() - SENDING_TIMEOUT_MS;
        let now = current_time_ms();
        let mut swept = 0u64;
        let mut refunds: Vec<QuotaDelta> = Vec::new();

        for dst in self.strategy.broadcast() {
            let pool = self.pool_for(&dst)?;
            let sql = format!(
                "UPDATE {table} SET status = $1, version = version + 1, utime = $2 \
                 WHERE id IN (
                     SELECT id FROM {table} WHERE status = $3 AND utime <= $4 \
                     ORDER BY id LIMIT $5 FOR UPDATE SKIP LOCKED
                 ) RETURNING biz_id, channel",
                table = dst.table
            );
            let rows = sqlx::query(&sql)
                .bind(SendStatus::Failed.as_str())
                .bind(now)
                .bind(SendStatus::Sending.as_str())
                .bind(deadline)
                .bind(batch_size as i64)
                .fetch_all(pool)
                .await?;
            for row in &rows {
                let biz_id: i64 = row.try_get("biz_id")?;
                let channel: String = row.try_get("channel")?;
                refunds.push(QuotaDelta {
                    biz_id,
                    channel: Channel::parse(&channel)?,
                    amount: 1,
                });
            }
            swept += rows.len() as u64;
        }

        if !refunds.is_empty() {
            // Merge per (biz, channel) before the batched refund.
            let mut merged: HashMap<(i64, Channel), i32> = HashMap::new();
            for delta in refunds {
                *merged.entry((delta.biz_id, delta.channel)).or_insert(0) += delta.amount;
            }
            let deltas: Vec<QuotaDelta> = merged
                .into_iter()
                .map(|((biz_id, channel), amount)| QuotaDelta {
                    biz_id,
                    channel,
                    amount,
                })
                .collect();
            if let Err(e) = self.quota.multi_incr(&deltas).await {
                tracing::error!(error = %e, "quota refund failed for timed-out rows");
            }
        }
        Ok(swept)
    }
}
