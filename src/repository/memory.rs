//! In-memory repository implementations.
//!
//! Single-process counterparts of the PostgreSQL/Redis backends, sharing the
//! same traits and quota coupling. They back the `memory` storage mode and
//! the integration tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::domain::{
    BusinessConfig, CallbackLog, CallbackLogStatus, Channel, Notification, Quota, SendStatus,
    TxNotification, TxNotificationStatus,
};
use crate::error::{AppError, Result};
use crate::redis::current_time_ms;
use crate::sharding::{ShardDst, ShardingStrategy};

use super::{
    quota_deltas, BusinessConfigStore, CallbackLogRepository, NotificationRepository, QuotaCache,
    QuotaDelta, QuotaStore, TxNotificationRepository,
};

const SENDING_TIMEOUT_MS: i64 = 60_000;

/// Shared backing state for all in-memory repositories, standing in for the
/// sharded databases.
pub struct MemoryStore {
    strategy: ShardingStrategy,
    notifications: DashMap<i64, Notification>,
    key_index: DashMap<(i64, String), i64>,
    /// Row update times, keyed by notification id (the timeout sweep needs
    /// them and the domain struct does not carry one).
    utimes: DashMap<i64, i64>,
    callback_logs: DashMap<i64, CallbackLog>,
    tx_notifications: DashMap<(i64, String), TxNotification>,
    tx_seq: AtomicI64,
}

impl MemoryStore {
    pub fn new(strategy: ShardingStrategy) -> Self {
        Self {
            strategy,
            notifications: DashMap::new(),
            key_index: DashMap::new(),
            utimes: DashMap::new(),
            callback_logs: DashMap::new(),
            tx_notifications: DashMap::new(),
            tx_seq: AtomicI64::new(1),
        }
    }

    pub fn strategy(&self) -> &ShardingStrategy {
        &self.strategy
    }

    fn touch(&self, notification_id: i64) {
        self.utimes.insert(notification_id, current_time_ms());
    }

    fn flip_callback_pending(&self, notification_id: i64) {
        if let Some(mut log) = self.callback_logs.get_mut(&notification_id) {
            if log.status == CallbackLogStatus::Init {
                log.status = CallbackLogStatus::Pending;
            }
        }
    }

    /// Test/introspection hook: current status of a notification.
    pub fn status_of(&self, notification_id: i64) -> Option<SendStatus> {
        self.notifications.get(&notification_id).map(|n| n.status)
    }

    /// Test/introspection hook: callback log for a notification.
    pub fn callback_log_of(&self, notification_id: i64) -> Option<CallbackLog> {
        self.callback_logs
            .get(&notification_id)
            .map(|log| log.clone())
    }

    /// Test hook: overwrite a row's update time (the timeout sweep keys on
    /// it).
    pub fn set_utime(&self, notification_id: i64, utime: i64) {
        self.utimes.insert(notification_id, utime);
    }
}

pub struct MemoryNotificationRepository {
    store: Arc<MemoryStore>,
    quota: Arc<dyn QuotaCache>,
}

impl MemoryNotificationRepository {
    pub fn new(store: Arc<MemoryStore>, quota: Arc<dyn QuotaCache>) -> Self {
        Self { store, quota }
    }

    fn insert_row(&self, notification: &Notification, with_callback_log: bool) -> Result<()> {
        let key = (notification.biz_id, notification.key.clone());
        if self.store.key_index.contains_key(&key) {
            return Err(AppError::DuplicateNotification);
        }
        self.store.key_index.insert(key, notification.id);
        self.store
            .notifications
            .insert(notification.id, notification.clone());
        self.store.touch(notification.id);
        if with_callback_log {
            self.store.callback_logs.insert(
                notification.id,
                CallbackLog {
                    notification_id: notification.id,
                    retry_count: 0,
                    next_retry_time: current_time_ms(),
                    status: CallbackLogStatus::Init,
                },
            );
        }
        Ok(())
    }

    fn remove_row(&self, notification: &Notification) {
        self.store
            .key_index
            .remove(&(notification.biz_id, notification.key.clone()));
        self.store.notifications.remove(&notification.id);
        self.store.callback_logs.remove(&notification.id);
        self.store.utimes.remove(&notification.id);
    }

    fn set_status(&self, id: i64, status: SendStatus) {
        if let Some(mut n) = self.store.notifications.get_mut(&id) {
            n.status = status;
            n.version += 1;
        }
        self.store.touch(id);
    }
}

#[async_trait]
impl NotificationRepository for MemoryNotificationRepository {
    async fn create(
        &self,
        notification: Notification,
        with_callback_log: bool,
    ) -> Result<Notification> {
        self.quota
            .decr(notification.biz_id, notification.channel, 1)
            .await?;
        if let Err(e) = self.insert_row(&notification, with_callback_log) {
            let _ = self
                .quota
                .incr(notification.biz_id, notification.channel, 1)
                .await;
            return Err(e);
        }
        Ok(notification)
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

        let mut inserted: Vec<&Notification> = Vec::with_capacity(notifications.len());
        for n in &notifications {
            if let Err(e) = self.insert_row(n, with_callback_log) {
                // Roll the partial batch back and refund everything.
                for done in inserted {
                    self.remove_row(done);
                }
                let _ = self.quota.multi_incr(&deltas).await;
                return Err(e);
            }
            inserted.push(n);
        }
        Ok(notifications)
    }

    async fn get_by_id(&self, id: i64) -> Result<Notification> {
        self.store
            .notifications
            .get(&id)
            .map(|n| n.clone())
            .ok_or_else(|| AppError::NotificationNotFound(format!("id={id}")))
    }

    async fn batch_get_by_ids(&self, ids: &[i64]) -> Result<HashMap<i64, Notification>> {
        let mut result = HashMap::with_capacity(ids.len());
        for id in ids {
            if let Some(n) = self.store.notifications.get(id) {
                result.insert(*id, n.clone());
            }
        }
        Ok(result)
    }

    async fn get_by_key(&self, biz_id: i64, key: &str) -> Result<Notification> {
        let id = self
            .store
            .key_index
            .get(&(biz_id, key.to_string()))
            .map(|id| *id)
            .ok_or_else(|| {
                AppError::NotificationNotFound(format!("biz_id={biz_id} key={key}"))
            })?;
        self.get_by_id(id).await
    }

    async fn get_by_keys(&self, biz_id: i64, keys: &[String]) -> Result<Vec<Notification>> {
        let mut result = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(id) = self.store.key_index.get(&(biz_id, key.clone())) {
                if let Some(n) = self.store.notifications.get(&id) {
                    result.push(n.clone());
                }
            }
        }
        result.sort_by_key(|n| n.id);
        Ok(result)
    }

    async fn cas_status(&self, id: i64, expected_version: i32, status: SendStatus) -> Result<()> {
        let mut n = self
            .store
            .notifications
            .get_mut(&id)
            .ok_or_else(|| AppError::NotificationNotFound(format!("id={id}")))?;
        if n.version != expected_version {
            return Err(AppError::VersionMismatch(id));
        }
        n.status = status;
        n.version += 1;
        drop(n);
        self.store.touch(id);
        Ok(())
    }

    async fn mark_success(&self, notification: &Notification) -> Result<()> {
        self.set_status(notification.id, SendStatus::Succeeded);
        self.store.flip_callback_pending(notification.id);
        Ok(())
    }

    async fn mark_failed(&self, notification: &Notification) -> Result<()> {
        self.set_status(notification.id, SendStatus::Failed);
        self.store.flip_callback_pending(notification.id);
        self.quota
            .incr(notification.biz_id, notification.channel, 1)
            .await
    }

    async fn batch_mark_succeeded_or_failed(
        &self,
        succeeded: &[Notification],
        failed: &[Notification],
    ) -> Result<()> {
        for n in succeeded {
            self.set_status(n.id, SendStatus::Succeeded);
            self.store.flip_callback_pending(n.id);
        }
        for n in failed {
            self.set_status(n.id, SendStatus::Failed);
            self.store.flip_callback_pending(n.id);
        }
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
        let now = current_time_ms();
        let mut ready: Vec<Notification> = self
            .store
            .notifications
            .iter()
            .filter(|entry| {
                let n = entry.value();
                let dst = self.store.strategy.shard_with_id(n.id);
                dst.db_suffix == shard.db_suffix
                    && dst.table_suffix == shard.table_suffix
                    && n.status == SendStatus::Pending
                    && n.scheduled_start <= now
                    && n.scheduled_end >= now
            })
            .map(|entry| entry.value().clone())
            .collect();
        ready.sort_by_key(|n| n.id);
        Ok(ready.into_iter().skip(offset).take(limit).collect())
    }

    async fn mark_timeout_sending_as_failed(&self, batch_size: usize) -> Result<u64> {
        let deadline = current_time_ms() - SENDING_TIMEOUT_MS;
        let mut stuck: Vec<(i64, i64, Channel)> = self
            .store
            .notifications
            .iter()
            .filter(|entry| {
                let n = entry.value();
                let utime = self
                    .store
                    .utimes
                    .get(&n.id)
                    .map(|t| *t)
                    .unwrap_or(i64::MAX);
                n.status == SendStatus::Sending && utime <= deadline
            })
            .map(|entry| (entry.value().id, entry.value().biz_id, entry.value().channel))
            .collect();
        stuck.sort_by_key(|(id, _, _)| *id);
        stuck.truncate(batch_size);

        for (id, biz_id, channel) in &stuck {
            self.set_status(*id, SendStatus::Failed);
            self.store.flip_callback_pending(*id);
            if let Err(e) = self.quota.incr(*biz_id, *channel, 1).await {
                tracing::error!(biz_id, error = %e, "quota refund failed for timed-out row");
            }
        }
        Ok(stuck.len() as u64)
    }
}

pub struct MemoryCallbackLogRepository {
    store: Arc<MemoryStore>,
}

impl MemoryCallbackLogRepository {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CallbackLogRepository for MemoryCallbackLogRepository {
    async fn find_pending(
        &self,
        start_time: i64,
        batch_size: usize,
        start_id: i64,
    ) -> Result<(Vec<CallbackLog>, i64)> {
        let mut pending: Vec<CallbackLog> = self
            .store
            .callback_logs
            .iter()
            .filter(|entry| {
                let log = entry.value();
                log.status == CallbackLogStatus::Pending
                    && log.next_retry_time <= start_time
                    && log.notification_id > start_id
            })
            .map(|entry| entry.value().clone())
            .collect();
        pending.sort_by_key(|log| log.notification_id);
        pending.truncate(batch_size);
        let next_start_id = pending
            .last()
            .map(|log| log.notification_id)
            .unwrap_or(0);
        Ok((pending, next_start_id))
    }

    async fn find_by_notification_ids(&self, notification_ids: &[i64]) -> Result<Vec<CallbackLog>> {
        let mut result = Vec::new();
        for id in notification_ids {
            if let Some(log) = self.store.callback_logs.get(id) {
                result.push(log.clone());
            }
        }
        Ok(result)
    }

    async fn update(&self, logs: &[CallbackLog]) -> Result<()> {
        for log in logs {
            self.store
                .callback_logs
                .insert(log.notification_id, log.clone());
        }
        Ok(())
    }
}

pub struct MemoryTxNotificationRepository {
    store: Arc<MemoryStore>,
    quota: Arc<dyn QuotaCache>,
    notifications: Arc<MemoryNotificationRepository>,
}

impl MemoryTxNotificationRepository {
    pub fn new(
        store: Arc<MemoryStore>,
        quota: Arc<dyn QuotaCache>,
        notifications: Arc<MemoryNotificationRepository>,
    ) -> Self {
        Self {
            store,
            quota,
            notifications,
        }
    }
}

#[async_trait]
impl TxNotificationRepository for MemoryTxNotificationRepository {
    async fn prepare(&self, mut txn: TxNotification, notification: Notification) -> Result<i64> {
        let tx_key = (txn.biz_id, txn.key.clone());
        if let Some(existing) = self.store.tx_notifications.get(&tx_key) {
            // Idempotent prepare: the first insert wins.
            return Ok(existing.notification_id);
        }

        self.quota
            .decr(notification.biz_id, notification.channel, 1)
            .await?;
        if let Err(e) = self.notifications.insert_row(&notification, false) {
            let _ = self
                .quota
                .incr(notification.biz_id, notification.channel, 1)
                .await;
            if matches!(e, AppError::DuplicateNotification) {
                let existing = self
                    .notifications
                    .get_by_key(txn.biz_id, &txn.key)
                    .await?;
                return Ok(existing.id);
            }
            return Err(e);
        }

        let now = current_time_ms();
        txn.tx_id = self.store.tx_seq.fetch_add(1, Ordering::Relaxed);
        txn.notification_id = notification.id;
        txn.status = TxNotificationStatus::Prepare;
        txn.ctime = now;
        txn.utime = now;
        self.store.tx_notifications.insert(tx_key, txn);
        Ok(notification.id)
    }

    async fn find_check_back(&self, offset: usize, limit: usize) -> Result<Vec<TxNotification>> {
        let now = current_time_ms();
        let mut due: Vec<TxNotification> = self
            .store
            .tx_notifications
            .iter()
            .filter(|entry| {
                let txn = entry.value();
                txn.status == TxNotificationStatus::Prepare
                    && txn.next_check_time > 0
                    && txn.next_check_time <= now
            })
            .map(|entry| entry.value().clone())
            .collect();
        due.sort_by_key(|t| t.next_check_time);
        Ok(due.into_iter().skip(offset).take(limit).collect())
    }

    async fn update_check_status(
        &self,
        txns: &[TxNotification],
        notification_status: Option<SendStatus>,
    ) -> Result<()> {
        let now = current_time_ms();
        for txn in txns {
            let tx_key = (txn.biz_id, txn.key.clone());
            if let Some(mut existing) = self.store.tx_notifications.get_mut(&tx_key) {
                if existing.status != TxNotificationStatus::Prepare {
                    continue;
                }
                existing.status = txn.status;
                existing.check_count = txn.check_count;
                existing.next_check_time = txn.next_check_time;
                existing.utime = now;
            }
            if let Some(status) = notification_status {
                let channel = self
                    .store
                    .notifications
                    .get_mut(&txn.notification_id)
                    .map(|mut n| {
                        n.status = status;
                        n.version += 1;
                        n.channel
                    });
                self.store.touch(txn.notification_id);
                // A failed transaction ends the notification FAILED, which
                // refunds its quota like any other failure.
                if status == SendStatus::Failed {
                    if let Some(channel) = channel {
                        if let Err(e) = self.quota.incr(txn.biz_id, channel, 1).await {
                            tracing::error!(
                                biz_id = txn.biz_id,
                                error = %e,
                                "quota refund failed for failed transaction"
                            );
                        }
                    }
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
        let tx_key = (biz_id, key.to_string());
        let notification_id = {
            let mut txn = self.store.tx_notifications.get_mut(&tx_key).ok_or_else(|| {
                AppError::NotificationNotFound(format!("tx biz_id={biz_id} key={key}"))
            })?;
            if txn.status != TxNotificationStatus::Prepare {
                return Err(AppError::NotificationNotFound(format!(
                    "no PREPARE transaction for biz_id={biz_id} key={key}"
                )));
            }
            txn.status = tx_status;
            txn.utime = current_time_ms();
            txn.notification_id
        };

        if let Some(mut n) = self.store.notifications.get_mut(&notification_id) {
            n.status = notification_status;
            n.version += 1;
        }
        self.store.touch(notification_id);
        Ok(())
    }

    async fn get_by_key(&self, biz_id: i64, key: &str) -> Result<TxNotification> {
        self.store
            .tx_notifications
            .get(&(biz_id, key.to_string()))
            .map(|t| t.clone())
            .ok_or_else(|| {
                AppError::NotificationNotFound(format!("tx biz_id={biz_id} key={key}"))
            })
    }
}

/// Quota counters behind one mutex so batched movements stay all-or-nothing.
#[derive(Default)]
pub struct MemoryQuotaCache {
    counters: Mutex<HashMap<(i64, Channel), i64>>,
}

impl MemoryQuotaCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QuotaCache for MemoryQuotaCache {
    async fn decr(&self, biz_id: i64, channel: Channel, amount: i32) -> Result<()> {
        let mut counters = self.counters.lock().expect("quota mutex poisoned");
        let balance = counters.entry((biz_id, channel)).or_insert(0);
        if *balance < amount as i64 {
            crate::metrics::QUOTA_REJECTED_TOTAL.inc();
            return Err(AppError::NoQuota {
                biz_id,
                channel: channel.as_str().to_string(),
            });
        }
        *balance -= amount as i64;
        Ok(())
    }

    async fn incr(&self, biz_id: i64, channel: Channel, amount: i32) -> Result<()> {
        let mut counters = self.counters.lock().expect("quota mutex poisoned");
        *counters.entry((biz_id, channel)).or_insert(0) += amount as i64;
        Ok(())
    }

    async fn multi_decr(&self, items: &[QuotaDelta]) -> Result<()> {
        let mut counters = self.counters.lock().expect("quota mutex poisoned");
        for item in items {
            let balance = counters.get(&(item.biz_id, item.channel)).copied().unwrap_or(0);
            if balance < item.amount as i64 {
                crate::metrics::QUOTA_REJECTED_TOTAL.inc();
                return Err(AppError::NoQuota {
                    biz_id: item.biz_id,
                    channel: item.channel.as_str().to_string(),
                });
            }
        }
        for item in items {
            *counters.entry((item.biz_id, item.channel)).or_insert(0) -= item.amount as i64;
        }
        Ok(())
    }

    async fn multi_incr(&self, items: &[QuotaDelta]) -> Result<()> {
        let mut counters = self.counters.lock().expect("quota mutex poisoned");
        for item in items {
            *counters.entry((item.biz_id, item.channel)).or_insert(0) += item.amount as i64;
        }
        Ok(())
    }

    async fn set(&self, quota: Quota) -> Result<()> {
        let mut counters = self.counters.lock().expect("quota mutex poisoned");
        counters.insert((quota.biz_id, quota.channel), quota.quota as i64);
        Ok(())
    }

    async fn get(&self, biz_id: i64, channel: Channel) -> Result<Quota> {
        let counters = self.counters.lock().expect("quota mutex poisoned");
        Ok(Quota {
            biz_id,
            channel,
            quota: counters.get(&(biz_id, channel)).copied().unwrap_or(0) as i32,
        })
    }
}

#[derive(Default)]
pub struct MemoryQuotaStore {
    rows: Mutex<HashMap<(i64, Channel), i32>>,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn create_or_update(&self, quotas: &[Quota]) -> Result<()> {
        let mut rows = self.rows.lock().expect("quota store mutex poisoned");
        for quota in quotas {
            rows.insert((quota.biz_id, quota.channel), quota.quota);
        }
        Ok(())
    }

    async fn find(&self, biz_id: i64, channel: Channel) -> Result<Quota> {
        let rows = self.rows.lock().expect("quota store mutex poisoned");
        match rows.get(&(biz_id, channel)) {
            Some(&quota) => Ok(Quota {
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

#[derive(Default)]
pub struct MemoryBusinessConfigStore {
    configs: Mutex<HashMap<i64, BusinessConfig>>,
}

impl MemoryBusinessConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BusinessConfigStore for MemoryBusinessConfigStore {
    async fn get(&self, biz_id: i64) -> Result<Option<BusinessConfig>> {
        Ok(self
            .configs
            .lock()
            .expect("config mutex poisoned")
            .get(&biz_id)
            .cloned())
    }

    async fn get_many(&self, biz_ids: &[i64]) -> Result<HashMap<i64, BusinessConfig>> {
        let configs = self.configs.lock().expect("config mutex poisoned");
        Ok(biz_ids
            .iter()
            .filter_map(|id| configs.get(id).map(|c| (*id, c.clone())))
            .collect())
    }

    async fn save(&self, config: &BusinessConfig) -> Result<()> {
        self.configs
            .lock()
            .expect("config mutex poisoned")
            .insert(config.id, config.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{SendStrategyConfig, TemplateRef};

    fn setup() -> (
        Arc<MemoryStore>,
        Arc<MemoryQuotaCache>,
        MemoryNotificationRepository,
    ) {
        let strategy = ShardingStrategy::new("db", "notifications", 2, 4);
        let store = Arc::new(MemoryStore::new(strategy));
        let quota = Arc::new(MemoryQuotaCache::new());
        let repo = MemoryNotificationRepository::new(store.clone(), quota.clone());
        (store, quota, repo)
    }

    fn notification(id: i64, biz_id: i64, key: &str) -> Notification {
        let mut params = HashMap::new();
        params.insert("code".into(), "1".into());
        Notification {
            id,
            biz_id,
            key: key.to_string(),
            receivers: vec!["r".into()],
            channel: Channel::Sms,
            template: TemplateRef {
                id: 1,
                version_id: 1,
                params,
            },
            status: SendStatus::Pending,
            scheduled_start: current_time_ms() - 1_000,
            scheduled_end: current_time_ms() + 60_000,
            version: 1,
            strategy: SendStrategyConfig::Immediate,
        }
    }

    #[tokio::test]
    async fn create_decrements_quota_and_duplicate_refunds() {
        let (_, quota, repo) = setup();
        quota
            .set(Quota {
                biz_id: 7,
                channel: Channel::Sms,
                quota: 2,
            })
            .await
            .unwrap();

        repo.create(notification(1, 7, "k1"), false).await.unwrap();
        assert_eq!(quota.get(7, Channel::Sms).await.unwrap().quota, 1);

        let err = repo
            .create(notification(2, 7, "k1"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::DuplicateNotification));
        // Duplicate insert refunded its reservation.
        assert_eq!(quota.get(7, Channel::Sms).await.unwrap().quota, 1);
    }

    #[tokio::test]
    async fn quota_exhaustion_rejects_create() {
        let (_, quota, repo) = setup();
        quota
            .set(Quota {
                biz_id: 7,
                channel: Channel::Sms,
                quota: 0,
            })
            .await
            .unwrap();
        let err = repo
            .create(notification(1, 7, "k1"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NoQuota { .. }));
    }

    #[tokio::test]
    async fn mark_failed_refunds_quota() {
        let (_, quota, repo) = setup();
        quota
            .set(Quota {
                biz_id: 7,
                channel: Channel::Sms,
                quota: 5,
            })
            .await
            .unwrap();
        let n = repo.create(notification(1, 7, "k1"), false).await.unwrap();
        assert_eq!(quota.get(7, Channel::Sms).await.unwrap().quota, 4);

        repo.mark_failed(&n).await.unwrap();
        // Net quota effect for a FAILED notification is zero.
        assert_eq!(quota.get(7, Channel::Sms).await.unwrap().quota, 5);
    }

    #[tokio::test]
    async fn cas_status_enforces_version() {
        let (_, quota, repo) = setup();
        quota
            .set(Quota {
                biz_id: 7,
                channel: Channel::Sms,
                quota: 5,
            })
            .await
            .unwrap();
        let n = repo.create(notification(1, 7, "k1"), false).await.unwrap();

        repo.cas_status(n.id, 1, SendStatus::Sending).await.unwrap();
        let err = repo
            .cas_status(n.id, 1, SendStatus::Succeeded)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::VersionMismatch(_)));
        let stored = repo.get_by_id(n.id).await.unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.status, SendStatus::Sending);
    }

    #[tokio::test]
    async fn find_ready_respects_shard_and_window() {
        let (store, quota, repo) = setup();
        quota
            .set(Quota {
                biz_id: 7,
                channel: Channel::Sms,
                quota: 100,
            })
            .await
            .unwrap();

        let idgen = crate::sharding::IdGenerator::new();
        let mut ids = Vec::new();
        for i in 0..20 {
            let key = format!("k-{i}");
            let id = idgen.generate(7, &key);
            repo.create(notification(id, 7, &key), false).await.unwrap();
            ids.push(id);
        }

        let mut seen = 0;
        for shard in store.strategy().broadcast() {
            let ready = repo.find_ready(&shard, 0, 100).await.unwrap();
            // Every returned row actually lives in the scanned shard.
            for n in &ready {
                let dst = store.strategy().shard_with_id(n.id);
                assert_eq!(dst.db_suffix, shard.db_suffix);
                assert_eq!(dst.table_suffix, shard.table_suffix);
            }
            seen += ready.len();
        }
        assert_eq!(seen, 20);
    }

    #[tokio::test]
    async fn timeout_sweep_fails_stuck_sending_rows() {
        let (store, quota, repo) = setup();
        quota
            .set(Quota {
                biz_id: 7,
                channel: Channel::Sms,
                quota: 10,
            })
            .await
            .unwrap();
        let n = repo.create(notification(1, 7, "k1"), false).await.unwrap();
        repo.cas_status(n.id, 1, SendStatus::Sending).await.unwrap();
        // Backdate the row past the sweep deadline.
        store.set_utime(n.id, current_time_ms() - 120_000);

        let swept = repo.mark_timeout_sending_as_failed(10).await.unwrap();
        assert_eq!(swept, 1);
        assert_eq!(store.status_of(n.id), Some(SendStatus::Failed));
        // Refund restored the balance.
        assert_eq!(quota.get(7, Channel::Sms).await.unwrap().quota, 10);
    }

    #[tokio::test]
    async fn multi_decr_is_all_or_nothing() {
        let quota = MemoryQuotaCache::new();
        quota
            .set(Quota {
                biz_id: 7,
                channel: Channel::Sms,
                quota: 5,
            })
            .await
            .unwrap();
        quota
            .set(Quota {
                biz_id: 7,
                channel: Channel::Email,
                quota: 0,
            })
            .await
            .unwrap();

        let err = quota
            .multi_decr(&[
                QuotaDelta {
                    biz_id: 7,
                    channel: Channel::Sms,
                    amount: 2,
                },
                QuotaDelta {
                    biz_id: 7,
                    channel: Channel::Email,
                    amount: 1,
                },
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NoQuota { .. }));
        // The SMS counter was left untouched.
        assert_eq!(quota.get(7, Channel::Sms).await.unwrap().quota, 5);
    }
}
