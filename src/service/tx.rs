//! Transactional (two-phase) notifications: prepare/commit/cancel plus the
//! check-back loop that resolves transactions the tenant never finished.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};

use crate::domain::{
    Notification, SendStatus, TxConfig, TxNotification, TxNotificationStatus,
};
use crate::error::{AppError, Result};
use crate::loopjob::{LoopBiz, LoopContext};
use crate::metrics::TX_CHECK_TOTAL;
use crate::redis::current_time_ms;
use crate::repository::{
    BusinessConfigService, NotificationRepository, TxNotificationRepository,
};

use super::client::{TenantGateway, TxCheckStatus};
use super::sender::NotificationSender;

#[async_trait]
pub trait TxNotificationService: Send + Sync {
    /// Persist the notification at PREPARE together with its transaction
    /// record. Idempotent on `(biz_id, key)`. Returns the notification id.
    async fn prepare(&self, notification: Notification) -> Result<i64>;

    /// PREPARE -> COMMIT; the notification becomes PENDING for the
    /// scheduler, or is sent inline for IMMEDIATE strategies.
    async fn commit(&self, biz_id: i64, key: &str) -> Result<()>;

    /// PREPARE -> CANCEL; the notification is CANCELED.
    async fn cancel(&self, biz_id: i64, key: &str) -> Result<()>;
}

pub struct TxService {
    repo: Arc<dyn TxNotificationRepository>,
    notifications: Arc<dyn NotificationRepository>,
    config: Arc<dyn BusinessConfigService>,
    sender: Arc<dyn NotificationSender>,
}

impl TxService {
    pub fn new(
        repo: Arc<dyn TxNotificationRepository>,
        notifications: Arc<dyn NotificationRepository>,
        config: Arc<dyn BusinessConfigService>,
        sender: Arc<dyn NotificationSender>,
    ) -> Self {
        Self {
            repo,
            notifications,
            config,
            sender,
        }
    }
}

#[async_trait]
impl TxNotificationService for TxService {
    async fn prepare(&self, mut notification: Notification) -> Result<i64> {
        notification.status = SendStatus::Prepare;
        notification.fill_send_window();

        // A tenant with a tx config gets a first check-back after its
        // configured delay; without one the transaction is never checked.
        let next_check_time = match self.config.get_by_id(notification.biz_id).await {
            Ok(config) => config
                .tx_config
                .map(|tx| current_time_ms() + tx.initial_delay_seconds * 1_000)
                .unwrap_or(0),
            Err(e) => {
                tracing::warn!(
                    biz_id = notification.biz_id,
                    error = %e,
                    "business config lookup failed during prepare"
                );
                0
            }
        };

        let txn = TxNotification {
            tx_id: 0,
            biz_id: notification.biz_id,
            key: notification.key.clone(),
            notification_id: notification.id,
            status: TxNotificationStatus::Prepare,
            check_count: 0,
            next_check_time,
            ctime: 0,
            utime: 0,
        };
        self.repo.prepare(txn, notification).await
    }

    async fn commit(&self, biz_id: i64, key: &str) -> Result<()> {
        self.repo
            .update_status(
                biz_id,
                key,
                TxNotificationStatus::Commit,
                SendStatus::Pending,
            )
            .await?;

        let notification = self.notifications.get_by_key(biz_id, key).await?;
        if notification.is_immediate() {
            self.sender.send(notification).await?;
        }
        Ok(())
    }

    async fn cancel(&self, biz_id: i64, key: &str) -> Result<()> {
        self.repo
            .update_status(
                biz_id,
                key,
                TxNotificationStatus::Cancel,
                SendStatus::Canceled,
            )
            .await
    }
}

/// Loop-job business resolving overdue PREPARE transactions by asking the
/// owning tenant service.
pub struct TxCheckTask {
    repo: Arc<dyn TxNotificationRepository>,
    config: Arc<dyn BusinessConfigService>,
    gateway: Arc<dyn TenantGateway>,
    batch_size: usize,
}

impl TxCheckTask {
    pub const LOCK_KEY: &'static str = "notifyd:job:tx_check_back";
    const EMPTY_PAUSE: Duration = Duration::from_secs(1);

    pub fn new(
        repo: Arc<dyn TxNotificationRepository>,
        config: Arc<dyn BusinessConfigService>,
        gateway: Arc<dyn TenantGateway>,
        batch_size: usize,
    ) -> Self {
        Self {
            repo,
            config,
            gateway,
            batch_size,
        }
    }

    /// One check-back. Classifies the transaction into its next state; a
    /// missing tx config fails it terminally, an UNKNOWN verdict or a call
    /// failure schedules a retry per the tenant's policy.
    async fn check_one(
        &self,
        config: Option<&TxConfig>,
        mut txn: TxNotification,
    ) -> TxNotification {
        let Some(config) = config else {
            txn.next_check_time = 0;
            txn.status = TxNotificationStatus::Fail;
            return txn;
        };

        txn.check_count += 1;
        let verdict = self.guarded_check(&config.service_name, &txn.key).await;
        match verdict {
            Ok(TxCheckStatus::Commit) => {
                TX_CHECK_TOTAL.with_label_values(&["commit"]).inc();
                txn.next_check_time = 0;
                txn.status = TxNotificationStatus::Commit;
            }
            Ok(TxCheckStatus::Cancel) => {
                TX_CHECK_TOTAL.with_label_values(&["cancel"]).inc();
                txn.next_check_time = 0;
                txn.status = TxNotificationStatus::Cancel;
            }
            Ok(TxCheckStatus::Unknown) => {
                TX_CHECK_TOTAL.with_label_values(&["unknown"]).inc();
                txn.schedule_next_check(config);
            }
            Err(e) => {
                TX_CHECK_TOTAL.with_label_values(&["error"]).inc();
                tracing::warn!(
                    biz_id = txn.biz_id,
                    key = %txn.key,
                    error = %e,
                    "transaction check-back failed"
                );
                txn.schedule_next_check(config);
            }
        }
        txn
    }

    /// Run the tenant call on its own task so a panicking tenant stub
    /// surfaces as an error instead of tearing the loop down.
    async fn guarded_check(&self, service_name: &str, key: &str) -> Result<TxCheckStatus> {
        let gateway = self.gateway.clone();
        let service_name = service_name.to_string();
        let key = key.to_string();
        match tokio::spawn(async move { gateway.transaction_check(&service_name, &key).await })
            .await
        {
            Ok(result) => result,
            Err(e) => Err(AppError::TenantCall(format!("check-back panicked: {e}"))),
        }
    }
}

#[async_trait]
impl LoopBiz for TxCheckTask {
    async fn run_once(&self, ctx: &LoopContext) -> Result<()> {
        while !ctx.expired() {
            let txns = self.repo.find_check_back(0, self.batch_size).await?;
            if txns.is_empty() {
                ctx.sleep(Self::EMPTY_PAUSE).await;
                continue;
            }

            let biz_ids: Vec<i64> = txns.iter().map(|t| t.biz_id).collect();
            let configs = self.config.get_by_ids(&biz_ids).await?;

            // Check-backs run concurrently; classification happens as they
            // complete.
            let mut checks = FuturesUnordered::new();
            for txn in txns {
                let tx_config = configs.get(&txn.biz_id).and_then(|c| c.tx_config.as_ref());
                checks.push(self.check_one(tx_config, txn));
            }

            let mut retry = Vec::new();
            let mut commit = Vec::new();
            let mut cancel = Vec::new();
            let mut fail = Vec::new();
            while let Some(txn) = checks.next().await {
                match txn.status {
                    TxNotificationStatus::Prepare => retry.push(txn),
                    TxNotificationStatus::Commit => commit.push(txn),
                    TxNotificationStatus::Cancel => cancel.push(txn),
                    TxNotificationStatus::Fail => fail.push(txn),
                }
            }

            // Batched database writes, one per outcome class.
            self.repo.update_check_status(&retry, None).await?;
            self.repo
                .update_check_status(&commit, Some(SendStatus::Pending))
                .await?;
            self.repo
                .update_check_status(&cancel, Some(SendStatus::Canceled))
                .await?;
            self.repo
                .update_check_status(&fail, Some(SendStatus::Failed))
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use crate::domain::{
        BusinessConfig, Channel, Quota, RetryPolicy, SendReceipt, SendStrategyConfig, TemplateRef,
    };
    use crate::repository::memory::{
        MemoryBusinessConfigStore, MemoryNotificationRepository, MemoryQuotaCache, MemoryStore,
        MemoryTxNotificationRepository,
    };
    use crate::repository::{BusinessConfigStore, CachedBusinessConfigService, QuotaCache};
    use crate::service::client::NotificationResultRequest;
    use crate::sharding::{IdGenerator, ShardingStrategy};

    struct ScriptedGateway {
        verdicts: Mutex<Vec<Result<TxCheckStatus>>>,
    }

    impl ScriptedGateway {
        fn new(verdicts: Vec<Result<TxCheckStatus>>) -> Self {
            Self {
                verdicts: Mutex::new(verdicts),
            }
        }
    }

    #[async_trait]
    impl TenantGateway for ScriptedGateway {
        async fn notify_result(
            &self,
            _service_name: &str,
            _request: &NotificationResultRequest,
        ) -> Result<bool> {
            Ok(true)
        }

        async fn transaction_check(
            &self,
            _service_name: &str,
            _key: &str,
        ) -> Result<TxCheckStatus> {
            let mut verdicts = self.verdicts.lock().unwrap();
            if verdicts.is_empty() {
                Ok(TxCheckStatus::Unknown)
            } else {
                verdicts.remove(0)
            }
        }
    }

    struct PanickingGateway;

    #[async_trait]
    impl TenantGateway for PanickingGateway {
        async fn notify_result(
            &self,
            _service_name: &str,
            _request: &NotificationResultRequest,
        ) -> Result<bool> {
            Ok(true)
        }

        async fn transaction_check(
            &self,
            _service_name: &str,
            _key: &str,
        ) -> Result<TxCheckStatus> {
            panic!("tenant stub exploded");
        }
    }

    struct NoopSender;

    #[async_trait]
    impl NotificationSender for NoopSender {
        async fn send(&self, notification: Notification) -> Result<SendReceipt> {
            Ok(SendReceipt {
                notification_id: notification.id,
                status: SendStatus::Succeeded,
            })
        }

        async fn batch_send(&self, _notifications: Vec<Notification>) -> Result<Vec<SendReceipt>> {
            Ok(Vec::new())
        }
    }

    struct Fixture {
        service: TxService,
        repo: Arc<MemoryTxNotificationRepository>,
        store: Arc<MemoryStore>,
        config: Arc<dyn BusinessConfigService>,
        idgen: IdGenerator,
    }

    async fn fixture(initial_delay_seconds: i64) -> Fixture {
        let strategy = ShardingStrategy::new("db", "notifications", 2, 4);
        let store = Arc::new(MemoryStore::new(strategy));
        let quota = Arc::new(MemoryQuotaCache::new());
        quota
            .set(Quota {
                biz_id: 7,
                channel: Channel::Sms,
                quota: 100,
            })
            .await
            .unwrap();
        let notifications = Arc::new(MemoryNotificationRepository::new(
            store.clone(),
            quota.clone(),
        ));
        let repo = Arc::new(MemoryTxNotificationRepository::new(
            store.clone(),
            quota,
            notifications.clone(),
        ));

        let configs = Arc::new(MemoryBusinessConfigStore::new());
        configs
            .save(&BusinessConfig {
                id: 7,
                owner_id: 1,
                owner_type: "organization".into(),
                channel_config: None,
                tx_config: Some(TxConfig {
                    service_name: "order-service".into(),
                    initial_delay_seconds,
                    retry_policy: Some(RetryPolicy::FixedInterval {
                        interval_ms: 10,
                        max_retries: 2,
                    }),
                }),
                callback_config: None,
                quota_config: None,
                rate_limit: 0,
                ctime: 0,
                utime: 0,
            })
            .await
            .unwrap();
        let config: Arc<dyn BusinessConfigService> =
            Arc::new(CachedBusinessConfigService::new(configs, None));

        Fixture {
            service: TxService::new(
                repo.clone(),
                notifications,
                config.clone(),
                Arc::new(NoopSender),
            ),
            repo,
            store,
            config,
            idgen: IdGenerator::new(),
        }
    }

    fn notification(fixture: &Fixture, key: &str) -> Notification {
        let mut params = HashMap::new();
        params.insert("c".to_string(), "1".to_string());
        Notification {
            id: fixture.idgen.generate(7, key),
            biz_id: 7,
            key: key.to_string(),
            receivers: vec!["r".into()],
            channel: Channel::Sms,
            template: TemplateRef {
                id: 1,
                version_id: 1,
                params,
            },
            status: SendStatus::Pending,
            scheduled_start: 0,
            scheduled_end: 0,
            version: 1,
            strategy: SendStrategyConfig::Delayed { delay_seconds: 60 },
        }
    }

    fn check_context() -> LoopContext {
        LoopContext {
            shard: None,
            deadline: Instant::now() + Duration::from_millis(100),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn prepare_is_idempotent() {
        let fixture = fixture(1).await;
        let n = notification(&fixture, "tx-1");
        let first = fixture.service.prepare(n.clone()).await.unwrap();
        let second = fixture.service.prepare(n).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(fixture.store.status_of(first), Some(SendStatus::Prepare));
    }

    #[tokio::test]
    async fn commit_moves_notification_to_pending() {
        let fixture = fixture(1).await;
        let id = fixture
            .service
            .prepare(notification(&fixture, "tx-1"))
            .await
            .unwrap();

        fixture.service.commit(7, "tx-1").await.unwrap();
        assert_eq!(fixture.store.status_of(id), Some(SendStatus::Pending));
        let txn = fixture.repo.get_by_key(7, "tx-1").await.unwrap();
        assert_eq!(txn.status, TxNotificationStatus::Commit);
    }

    #[tokio::test]
    async fn cancel_terminates_both_rows() {
        let fixture = fixture(1).await;
        let id = fixture
            .service
            .prepare(notification(&fixture, "tx-1"))
            .await
            .unwrap();

        fixture.service.cancel(7, "tx-1").await.unwrap();
        assert_eq!(fixture.store.status_of(id), Some(SendStatus::Canceled));
        let txn = fixture.repo.get_by_key(7, "tx-1").await.unwrap();
        assert_eq!(txn.status, TxNotificationStatus::Cancel);
    }

    #[tokio::test]
    async fn commit_without_prepare_is_an_error() {
        let fixture = fixture(1).await;
        assert!(fixture.service.commit(7, "ghost").await.is_err());
    }

    async fn run_check(fixture: &Fixture, gateway: Arc<dyn TenantGateway>) {
        let task = TxCheckTask::new(fixture.repo.clone(), fixture.config.clone(), gateway, 10);
        task.run_once(&check_context()).await.unwrap();
    }

    #[tokio::test]
    async fn check_back_commits_when_tenant_says_commit() {
        let fixture = fixture(0).await;
        let id = fixture
            .service
            .prepare(notification(&fixture, "tx-1"))
            .await
            .unwrap();

        let gateway = Arc::new(ScriptedGateway::new(vec![Ok(TxCheckStatus::Commit)]));
        run_check(&fixture, gateway).await;

        let txn = fixture.repo.get_by_key(7, "tx-1").await.unwrap();
        assert_eq!(txn.status, TxNotificationStatus::Commit);
        assert_eq!(txn.check_count, 1);
        assert_eq!(fixture.store.status_of(id), Some(SendStatus::Pending));
    }

    #[tokio::test]
    async fn check_back_cancels_when_tenant_says_cancel() {
        let fixture = fixture(0).await;
        let id = fixture
            .service
            .prepare(notification(&fixture, "tx-1"))
            .await
            .unwrap();

        let gateway = Arc::new(ScriptedGateway::new(vec![Ok(TxCheckStatus::Cancel)]));
        run_check(&fixture, gateway).await;

        let txn = fixture.repo.get_by_key(7, "tx-1").await.unwrap();
        assert_eq!(txn.status, TxNotificationStatus::Cancel);
        assert_eq!(fixture.store.status_of(id), Some(SendStatus::Canceled));
    }

    #[tokio::test]
    async fn unknown_verdicts_retry_until_policy_exhausts() {
        let fixture = fixture(0).await;
        let id = fixture
            .service
            .prepare(notification(&fixture, "tx-1"))
            .await
            .unwrap();

        let gateway: Arc<dyn TenantGateway> = Arc::new(ScriptedGateway::new(Vec::new()));
        // max_retries = 2; the third unknown check fails the transaction.
        for _ in 0..3 {
            run_check(&fixture, gateway.clone()).await;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let txn = fixture.repo.get_by_key(7, "tx-1").await.unwrap();
        assert_eq!(txn.status, TxNotificationStatus::Fail);
        assert_eq!(txn.next_check_time, 0);
        assert_eq!(fixture.store.status_of(id), Some(SendStatus::Failed));
    }

    #[tokio::test]
    async fn panicking_tenant_counts_as_unknown() {
        let fixture = fixture(0).await;
        fixture
            .service
            .prepare(notification(&fixture, "tx-1"))
            .await
            .unwrap();

        run_check(&fixture, Arc::new(PanickingGateway)).await;

        // The loop survived and the transaction was scheduled for retry.
        let txn = fixture.repo.get_by_key(7, "tx-1").await.unwrap();
        assert_eq!(txn.status, TxNotificationStatus::Prepare);
        assert_eq!(txn.check_count, 1);
        assert!(txn.next_check_time > 0);
    }
}
