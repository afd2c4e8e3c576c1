//! Repositories own all durable entity rows; caches hold shared,
//! non-authoritative copies. Every implementation comes in two flavors, a
//! PostgreSQL/Redis one and an in-memory one, behind the same traits.

pub mod callback_pg;
pub mod config_store;
pub mod memory;
pub mod notification_pg;
pub mod quota_pg;
pub mod quota_redis;
pub mod tx_pg;

pub use config_store::{
    run_invalidation_listener, BusinessConfigStore, CachedBusinessConfigService,
    PgBusinessConfigStore,
};

use std::collections::HashMap;

use async_trait::async_trait;

use crate::domain::{
    BusinessConfig, CallbackLog, Channel, Notification, Quota, SendStatus, TxNotification,
    TxNotificationStatus,
};
use crate::error::Result;
use crate::sharding::ShardDst;

/// One quota movement for a `(biz_id, channel)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaDelta {
    pub biz_id: i64,
    pub channel: Channel,
    pub amount: i32,
}

/// Collapse per-notification movements into one delta per `(biz, channel)`.
pub fn quota_deltas(notifications: &[Notification]) -> Vec<QuotaDelta> {
    let mut merged: HashMap<(i64, Channel), i32> = HashMap::new();
    for n in notifications {
        *merged.entry((n.biz_id, n.channel)).or_insert(0) += 1;
    }
    merged
        .into_iter()
        .map(|((biz_id, channel), amount)| QuotaDelta {
            biz_id,
            channel,
            amount,
        })
        .collect()
}

/// Authoritative durable quota rows, written when allowances are
/// provisioned. The cache holds the hot counters.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn create_or_update(&self, quotas: &[Quota]) -> Result<()>;
    async fn find(&self, biz_id: i64, channel: Channel) -> Result<Quota>;
}

/// Hot quota counters. Decrements are atomic and reject on insufficient
/// balance without partially applying.
#[async_trait]
pub trait QuotaCache: Send + Sync {
    async fn decr(&self, biz_id: i64, channel: Channel, amount: i32) -> Result<()>;
    async fn incr(&self, biz_id: i64, channel: Channel, amount: i32) -> Result<()>;
    /// All-or-nothing batched decrement.
    async fn multi_decr(&self, items: &[QuotaDelta]) -> Result<()>;
    async fn multi_incr(&self, items: &[QuotaDelta]) -> Result<()>;
    /// Seed or overwrite a counter (quota provisioning).
    async fn set(&self, quota: Quota) -> Result<()>;
    async fn get(&self, biz_id: i64, channel: Channel) -> Result<Quota>;
}

/// Durable notification rows plus the quota movements coupled to them:
/// an insert decrements quota, a failed insert or FAILED terminal state
/// refunds it.
#[async_trait]
pub trait NotificationRepository: Send + Sync {
    /// Insert one notification (optionally with its callback log) after
    /// reserving quota. Duplicate `(biz_id, key)` maps to the duplicate
    /// business error and refunds the reservation.
    async fn create(&self, notification: Notification, with_callback_log: bool)
        -> Result<Notification>;

    /// Batched insert with batched quota reservation. A failure refunds the
    /// whole batch; duplicates bubble up as a batch error.
    async fn batch_create(
        &self,
        notifications: Vec<Notification>,
        with_callback_log: bool,
    ) -> Result<Vec<Notification>>;

    async fn get_by_id(&self, id: i64) -> Result<Notification>;
    async fn batch_get_by_ids(&self, ids: &[i64]) -> Result<HashMap<i64, Notification>>;
    async fn get_by_key(&self, biz_id: i64, key: &str) -> Result<Notification>;
    async fn get_by_keys(&self, biz_id: i64, keys: &[String]) -> Result<Vec<Notification>>;

    /// Compare-and-swap on the row version; bumps the version on success.
    async fn cas_status(&self, id: i64, expected_version: i32, status: SendStatus) -> Result<()>;

    /// Terminal success: status update plus flipping the callback log (if
    /// any) to PENDING, atomically.
    async fn mark_success(&self, notification: &Notification) -> Result<()>;

    /// Terminal failure: status update plus quota refund.
    async fn mark_failed(&self, notification: &Notification) -> Result<()>;

    /// One transaction marking the batch's successes SUCCEEDED and failures
    /// FAILED, flipping callback logs, then refunding quota for failures.
    async fn batch_mark_succeeded_or_failed(
        &self,
        succeeded: &[Notification],
        failed: &[Notification],
    ) -> Result<()>;

    /// Rows within the shard whose window contains now and whose status is
    /// PENDING, in primary-key order.
    async fn find_ready(
        &self,
        shard: &ShardDst,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Notification>>;

    /// Fail rows stuck in SENDING for over a minute; refunds their quota.
    /// Returns the number of rows swept.
    async fn mark_timeout_sending_as_failed(&self, batch_size: usize) -> Result<u64>;
}

/// Callback delivery log rows.
#[async_trait]
pub trait CallbackLogRepository: Send + Sync {
    /// Page of PENDING logs with `next_retry_time <= start_time` and
    /// `id > start_id`, ordered by id. Returns the page and the id to resume
    /// from.
    async fn find_pending(
        &self,
        start_time: i64,
        batch_size: usize,
        start_id: i64,
    ) -> Result<(Vec<CallbackLog>, i64)>;

    async fn find_by_notification_ids(&self, notification_ids: &[i64]) -> Result<Vec<CallbackLog>>;

    async fn update(&self, logs: &[CallbackLog]) -> Result<()>;
}

/// Transactional notification rows.
#[async_trait]
pub trait TxNotificationRepository: Send + Sync {
    /// Insert the tx row and its PREPARE notification in one transaction.
    /// A duplicate `(biz_id, key)` is a no-op returning the existing
    /// notification id.
    async fn prepare(&self, txn: TxNotification, notification: Notification) -> Result<i64>;

    /// PREPARE rows due for a check-back (`next_check_time` in (0, now]),
    /// ordered by `next_check_time`.
    async fn find_check_back(&self, offset: usize, limit: usize) -> Result<Vec<TxNotification>>;

    /// Batch-apply check results. When `notification_status` is set, the
    /// owning notifications transition too (COMMIT -> SENDING etc.).
    async fn update_check_status(
        &self,
        txns: &[TxNotification],
        notification_status: Option<SendStatus>,
    ) -> Result<()>;

    /// Tenant-driven PREPARE -> COMMIT/CANCEL transition for one key,
    /// moving the notification in the same transaction.
    async fn update_status(
        &self,
        biz_id: i64,
        key: &str,
        tx_status: TxNotificationStatus,
        notification_status: SendStatus,
    ) -> Result<()>;

    async fn get_by_key(&self, biz_id: i64, key: &str) -> Result<TxNotification>;
}

/// Read access to tenant configuration. Implementations layer caches over
/// the durable store.
#[async_trait]
pub trait BusinessConfigService: Send + Sync {
    async fn get_by_id(&self, biz_id: i64) -> Result<BusinessConfig>;
    async fn get_by_ids(&self, biz_ids: &[i64]) -> Result<HashMap<i64, BusinessConfig>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SendStrategyConfig;
    use crate::domain::TemplateRef;

    fn notification(biz_id: i64, channel: Channel, key: &str) -> Notification {
        Notification {
            id: 0,
            biz_id,
            key: key.to_string(),
            receivers: vec!["r".into()],
            channel,
            template: TemplateRef::default(),
            status: SendStatus::Pending,
            scheduled_start: 0,
            scheduled_end: 0,
            version: 1,
            strategy: SendStrategyConfig::Immediate,
        }
    }

    #[test]
    fn quota_deltas_merge_by_biz_and_channel() {
        let ns = vec![
            notification(7, Channel::Sms, "a"),
            notification(7, Channel::Sms, "b"),
            notification(7, Channel::Email, "c"),
            notification(8, Channel::Sms, "d"),
        ];
        let mut deltas = quota_deltas(&ns);
        deltas.sort_by_key(|d| (d.biz_id, d.channel.as_str()));
        assert_eq!(deltas.len(), 3);
        assert!(deltas.contains(&QuotaDelta {
            biz_id: 7,
            channel: Channel::Sms,
            amount: 2
        }));
        assert!(deltas.contains(&QuotaDelta {
            biz_id: 7,
            channel: Channel::Email,
            amount: 1
        }));
    }
}
