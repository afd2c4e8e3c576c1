//! PostgreSQL transactional-notification repository.
//!
//! The tx row and its PREPARE notification land in the same database shard
//! (placement is derived from the notification id), so the two-phase insert
//! and the status transitions are single-database transactions.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{FromRow, Row};

use crate::domain::{
    Channel, Notification, SendStatus, TxNotification, TxNotificationStatus,
};
use crate::error::{AppError, Result};
use crate::postgres::{is_unique_violation, ShardedPools};
use crate::redis::current_time_ms;
use crate::sharding::ShardingStrategy;

use super::{NotificationRepository, QuotaCache, QuotaDelta, TxNotificationRepository};

#[derive(FromRow)]
struct TxNotificationRow {
    tx_id: i64,
    biz_id: i64,
    key: String,
    notification_id: i64,
    status: String,
    check_count: i32,
    next_check_time: i64,
    ctime: i64,
    utime: i64,
}

impl TxNotificationRow {
    fn into_domain(self) -> Result<TxNotification> {
        Ok(TxNotification {
            tx_id: self.tx_id,
            biz_id: self.biz_id,
            key: self.key,
            notification_id: self.notification_id,
            status: TxNotificationStatus::parse(&self.status)?,
            check_count: self.check_count as u32,
            next_check_time: self.next_check_time,
            ctime: self.ctime,
            utime: self.utime,
        })
    }
}

pub struct PgTxNotificationRepository {
    pools: ShardedPools,
    strategy: ShardingStrategy,
    quota: Arc<dyn QuotaCache>,
    // Notification-side transitions reuse the notification repository so
    // version bumps and callback flips stay in one place.
    notifications: Arc<dyn NotificationRepository>,
}

impl PgTxNotificationRepository {
    pub fn new(
        pools: ShardedPools,
        strategy: ShardingStrategy,
        quota: Arc<dyn QuotaCache>,
        notifications: Arc<dyn NotificationRepository>,
    ) -> Self {
        Self {
            pools,
            strategy,
            quota,
            notifications,
        }
    }

    fn notification_table(&self, notification_id: i64) -> (u32, String) {
        let dst = self.strategy.shard_with_id(notification_id);
        (dst.db_suffix, dst.table)
    }
}

#[async_trait]
impl TxNotificationRepository for PgTxNotificationRepository {
    async fn prepare(&self, txn: TxNotification, notification: Notification) -> Result<i64> {
        // Prepared notifications count against quota like any other insert.
        self.quota
            .decr(notification.biz_id, notification.channel, 1)
            .await?;

        let dst = self.strategy.shard_with_id(notification.id);
        let pool = self.pools.pool(dst.db_suffix)?;
        let now = current_time_ms();

        let result: Result<bool> = async {
            let mut tx = pool.begin().await?;

            let inserted = sqlx::query(
                r#"
                INSERT INTO tx_notifications
                    (biz_id, key, notification_id, status, check_count, next_check_time, ctime, utime)
                VALUES ($1, $2, $3, $4, 0, $5, $6, $6)
                ON CONFLICT (biz_id, key) DO NOTHING
                "#,
            )
            .bind(txn.biz_id)
            .bind(&txn.key)
            .bind(notification.id)
            .bind(TxNotificationStatus::Prepare.as_str())
            .bind(txn.next_check_time)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            // Duplicate (biz_id, key): prepare is idempotent, do nothing.
            if inserted == 0 {
                tx.rollback().await?;
                return Ok(false);
            }

            let receivers = serde_json::to_string(&notification.receivers).unwrap_or_default();
            let params =
                serde_json::to_string(&notification.template.params).unwrap_or_default();
            let strategy =
                serde_json::to_value(&notification.strategy).unwrap_or(serde_json::Value::Null);
            let sql = format!(
                r#"
                INSERT INTO {}
                    (id, biz_id, key, receivers, channel, template_id, template_version_id,
                     template_params, status, scheduled_stime, scheduled_etime, strategy,
                     version, ctime, utime)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 1, $13, $13)
                "#,
                dst.table
            );
            if let Err(e) = sqlx::query(&sql)
                .bind(notification.id)
                .bind(notification.biz_id)
                .bind(&notification.key)
                .bind(receivers)
                .bind(notification.channel.as_str())
                .bind(notification.template.id)
                .bind(notification.template.version_id)
                .bind(params)
                .bind(SendStatus::Prepare.as_str())
                .bind(notification.scheduled_start)
                .bind(notification.scheduled_end)
                .bind(strategy)
                .bind(now)
                .execute(&mut *tx)
                .await
            {
                if is_unique_violation(&e) {
                    tx.rollback().await?;
                    return Ok(false);
                }
                return Err(e.into());
            }

            tx.commit().await?;
            Ok(true)
        }
        .await;

        match result {
            Ok(true) => Ok(notification.id),
            Ok(false) => {
                // Nothing persisted; the reservation goes back and the
                // existing row's id is the authoritative answer.
                let _ = self
                    .quota
                    .incr(notification.biz_id, notification.channel, 1)
                    .await;
                let existing = self
                    .notifications
                    .get_by_key(txn.biz_id, &txn.key)
                    .await?;
                Ok(existing.id)
            }
            Err(e) => {
                if let Err(refund_err) = self
                    .quota
                    .incr(notification.biz_id, notification.channel, 1)
                    .await
                {
                    tracing::error!(
                        biz_id = notification.biz_id,
                        error = %refund_err,
                        "quota refund failed after tx prepare failure"
                    );
                }
                Err(e)
            }
        }
    }

    async fn find_check_back(&self, offset: usize, limit: usize) -> Result<Vec<TxNotification>> {
        let now = current_time_ms();
        let mut merged = Vec::new();
        for db_suffix in 0..self.pools.shard_count() as u32 {
            let pool = self.pools.pool(db_suffix)?;
            let rows: Vec<TxNotificationRow> = sqlx::query_as(
                r#"
                SELECT tx_id, biz_id, key, notification_id, status, check_count,
                       next_check_time, ctime, utime
                FROM tx_notifications
                WHERE status = $1 AND next_check_time <= $2 AND next_check_time > 0
                ORDER BY next_check_time ASC
                LIMIT $3 OFFSET $4
                "#,
            )
            .bind(TxNotificationStatus::Prepare.as_str())
            .bind(now)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(pool)
            .await?;
            for row in rows {
                merged.push(row.into_domain()?);
            }
        }
        merged.sort_by_key(|t| t.next_check_time);
        merged.truncate(limit);
        Ok(merged)
    }

    async fn update_check_status(
        &self,
        txns: &[TxNotification],
        notification_status: Option<SendStatus>,
    ) -> Result<()> {
        if txns.is_empty() {
            return Ok(());
        }
        let now = current_time_ms();

        let mut grouped: HashMap<u32, Vec<&TxNotification>> = HashMap::new();
        for txn in txns {
            let (db_suffix, _) = self.notification_table(txn.notification_id);
            grouped.entry(db_suffix).or_default().push(txn);
        }

        for (db_suffix, shard_txns) in grouped {
            let pool = self.pools.pool(db_suffix)?;
            let mut tx = pool.begin().await?;
            for txn in &shard_txns {
                sqlx::query(
                    r#"
                    UPDATE tx_notifications
                    SET status = $1, check_count = $2, next_check_time = $3, utime = $4
                    WHERE biz_id = $5 AND key = $6 AND status = $7
                    "#,
                )
                .bind(txn.status.as_str())
                .bind(txn.check_count as i32)
                .bind(txn.next_check_time)
                .bind(now)
                .bind(txn.biz_id)
                .bind(&txn.key)
                .bind(TxNotificationStatus::Prepare.as_str())
                .execute(&mut *tx)
                .await?;
            }

            let mut refunds: Vec<QuotaDelta> = Vec::new();
            if let Some(status) = notification_status {
                // Notification rows may scatter over tables within the db.
                let mut by_table: HashMap<String, Vec<i64>> = HashMap::new();
                for txn in &shard_txns {
                    let (_, table) = self.notification_table(txn.notification_id);
                    by_table.entry(table).or_default().push(txn.notification_id);
                }
                for (table, ids) in by_table {
                    let sql = format!(
                        "UPDATE {table} SET status = $1, version = version + 1, utime = $2 \
                         WHERE id = ANY($3) RETURNING biz_id, channel"
                    );
                    let rows = sqlx::query(&sql)
                        .bind(status.as_str())
                        .bind(now)
                        .bind(&ids)
                        .fetch_all(&mut *tx)
                        .await?;
                    // Failed transactions refund quota like any other
                    // FAILED terminal state.
                    if status == SendStatus::Failed {
                        for row in &rows {
                            let biz_id: i64 = row.try_get("biz_id")?;
                            let channel: String = row.try_get("channel")?;
                            refunds.push(QuotaDelta {
                                biz_id,
                                channel: Channel::parse(&channel)?,
                                amount: 1,
                            });
                        }
                    }
                }
            }
            tx.commit().await?;

            if !refunds.is_empty() {
                if let Err(e) = self.quota.multi_incr(&refunds).await {
                    tracing::error!(error = %e, "quota refund failed for failed transactions");
                }
            }
        }
        Ok(())
    }

    async fn update_status(
        &self,
        biz_id: i64,
        key: &str,
        tx_status: TxNotificationStatus,
        notification_status: SendStatus,
    ) -> Result<()> {
        let dst = self.strategy.shard(biz_id, key);
        let pool = self.pools.pool(dst.db_suffix)?;
        let now = current_time_ms();

        let mut tx = pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE tx_notifications
            SET status = $1, utime = $2
            WHERE biz_id = $3 AND key = $4 AND status = $5
            "#,
        )
        .bind(tx_status.as_str())
        .bind(now)
        .bind(biz_id)
        .bind(key)
        .bind(TxNotificationStatus::Prepare.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Err(AppError::NotificationNotFound(format!(
                "no PREPARE transaction for biz_id={biz_id} key={key}"
            )));
        }

        let sql = format!(
            "UPDATE {} SET status = $1, version = version + 1, utime = $2 \
             WHERE biz_id = $3 AND key = $4",
            dst.table
        );
        sqlx::query(&sql)
            .bind(notification_status.as_str())
            .bind(now)
            .bind(biz_id)
            .bind(key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_by_key(&self, biz_id: i64, key: &str) -> Result<TxNotification> {
        let dst = self.strategy.shard(biz_id, key);
        let pool = self.pools.pool(dst.db_suffix)?;
        let row: Option<TxNotificationRow> = sqlx::query_as(
            r#"
            SELECT tx_id, biz_id, key, notification_id, status, check_count,
                   next_check_time, ctime, utime
            FROM tx_notifications
            WHERE biz_id = $1 AND key = $2
            "#,
        )
        .bind(biz_id)
        .bind(key)
        .fetch_optional(pool)
        .await?;
        row.ok_or_else(|| {
            AppError::NotificationNotFound(format!("tx biz_id={biz_id} key={key}"))
        })?
        .into_domain()
    }
}
