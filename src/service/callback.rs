//! Result callbacks to tenants.
//!
//! [`CallbackService`] delivers terminal send results and applies the
//! tenant's retry policy to the callback log.
//! [`AsyncRequestResultCallbackTask`] is the loop-job business that drains
//! PENDING logs whose retry time has elapsed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{CallbackLog, CallbackLogStatus, Notification};
use crate::error::Result;
use crate::loopjob::{LoopBiz, LoopContext};
use crate::metrics::CALLBACK_ATTEMPTS_TOTAL;
use crate::redis::current_time_ms;
use crate::repository::{
    BusinessConfigService, CallbackLogRepository, NotificationRepository,
};

use super::client::{NotificationResultRequest, TenantGateway};

pub struct CallbackService {
    config: Arc<dyn BusinessConfigService>,
    repo: Arc<dyn CallbackLogRepository>,
    notifications: Arc<dyn NotificationRepository>,
    gateway: Arc<dyn TenantGateway>,
}

impl CallbackService {
    pub fn new(
        config: Arc<dyn BusinessConfigService>,
        repo: Arc<dyn CallbackLogRepository>,
        notifications: Arc<dyn NotificationRepository>,
        gateway: Arc<dyn TenantGateway>,
    ) -> Self {
        Self {
            config,
            repo,
            notifications,
            gateway,
        }
    }

    /// Drain all due PENDING logs as of `start_time`, paging until a partial
    /// page comes back.
    pub async fn send_pending(&self, start_time: i64, batch_size: usize) -> Result<()> {
        let mut start_id = 0i64;
        loop {
            let (logs, next_start_id) = self
                .repo
                .find_pending(start_time, batch_size, start_id)
                .await?;
            if logs.is_empty() {
                return Ok(());
            }
            let full_page = logs.len() == batch_size;
            self.process_logs(logs).await?;
            if !full_page {
                return Ok(());
            }
            start_id = next_start_id;
        }
    }

    /// Fire callbacks for freshly terminal notifications (invoked by the
    /// sender). Notifications without a callback log have no callback
    /// configured and are skipped.
    pub async fn send_for_notifications(&self, notifications: &[Notification]) -> Result<()> {
        if notifications.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = notifications.iter().map(|n| n.id).collect();
        let logs = self.repo.find_by_notification_ids(&ids).await?;
        // Only PENDING logs are actionable; INIT ones belong to rows that
        // have not reached a terminal state yet.
        let actionable: Vec<CallbackLog> = logs
            .into_iter()
            .filter(|log| log.status == CallbackLogStatus::Pending)
            .collect();
        if actionable.is_empty() {
            return Ok(());
        }
        self.process_logs(actionable).await
    }

    async fn process_logs(&self, mut logs: Vec<CallbackLog>) -> Result<()> {
        let ids: Vec<i64> = logs.iter().map(|log| log.notification_id).collect();
        let notifications = self.notifications.batch_get_by_ids(&ids).await?;

        let mut changed = Vec::with_capacity(logs.len());
        for log in logs.iter_mut() {
            let Some(notification) = notifications.get(&log.notification_id) else {
                tracing::warn!(
                    notification_id = log.notification_id,
                    "callback log without a notification, skipping"
                );
                continue;
            };
            match self.attempt(log, notification).await {
                Ok(true) => changed.push(log.clone()),
                Ok(false) => {}
                Err(e) => {
                    // Transport failure: leave the log untouched and let the
                    // next scan retry it.
                    CALLBACK_ATTEMPTS_TOTAL.with_label_values(&["error"]).inc();
                    tracing::warn!(
                        notification_id = log.notification_id,
                        error = %e,
                        "tenant callback failed"
                    );
                }
            }
        }
        self.repo.update(&changed).await
    }

    /// One delivery attempt. Returns whether the log changed.
    async fn attempt(&self, log: &mut CallbackLog, notification: &Notification) -> Result<bool> {
        let config = self.config.get_by_id(notification.biz_id).await?;
        let Some(callback_config) = config.callback_config else {
            // Config was removed after acceptance; nothing to deliver to.
            log.status = CallbackLogStatus::Failed;
            return Ok(true);
        };

        let request = NotificationResultRequest::from_notification(notification);
        let acknowledged = self
            .gateway
            .notify_result(&callback_config.service_name, &request)
            .await?;

        if acknowledged {
            CALLBACK_ATTEMPTS_TOTAL.with_label_values(&["ok"]).inc();
            log.status = CallbackLogStatus::Succeeded;
            return Ok(true);
        }

        CALLBACK_ATTEMPTS_TOTAL
            .with_label_values(&["rejected"])
            .inc();
        let next_interval = callback_config
            .retry_policy
            .and_then(|policy| policy.interval_for(log.retry_count + 1));
        match next_interval {
            Some(interval) => {
                log.retry_count += 1;
                log.next_retry_time = current_time_ms() + interval.as_millis() as i64;
            }
            None => {
                log.status = CallbackLogStatus::Failed;
            }
        }
        Ok(true)
    }
}

/// Loop-job business scanning due callback logs. Each tick is padded to a
/// minimum duration so an empty scan does not busy-loop under the lock.
pub struct AsyncRequestResultCallbackTask {
    service: Arc<CallbackService>,
    batch_size: usize,
}

impl AsyncRequestResultCallbackTask {
    pub const LOCK_KEY: &'static str = "notifyd:job:async_result_callback";
    const MIN_TICK: Duration = Duration::from_secs(3);

    pub fn new(service: Arc<CallbackService>, batch_size: usize) -> Self {
        Self {
            service,
            batch_size,
        }
    }
}

#[async_trait]
impl LoopBiz for AsyncRequestResultCallbackTask {
    async fn run_once(&self, ctx: &LoopContext) -> Result<()> {
        while !ctx.expired() {
            let started = std::time::Instant::now();
            self.service
                .send_pending(current_time_ms(), self.batch_size)
                .await?;
            let elapsed = started.elapsed();
            if elapsed < Self::MIN_TICK {
                ctx.sleep(Self::MIN_TICK - elapsed).await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex;

    use crate::domain::{
        BusinessConfig, CallbackConfig, Channel, RetryPolicy, SendStatus, SendStrategyConfig,
        TemplateRef,
    };
    use crate::repository::memory::{
        MemoryBusinessConfigStore, MemoryCallbackLogRepository, MemoryNotificationRepository,
        MemoryQuotaCache, MemoryStore,
    };
    use crate::repository::{BusinessConfigStore, CachedBusinessConfigService, QuotaCache};
    use crate::service::client::TxCheckStatus;
    use crate::sharding::ShardingStrategy;

    /// Gateway whose answers are scripted per service name.
    pub(crate) struct StubGateway {
        responses: Mutex<Vec<bool>>,
        pub calls: Mutex<Vec<NotificationResultRequest>>,
    }

    impl StubGateway {
        pub(crate) fn new(responses: Vec<bool>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TenantGateway for StubGateway {
        async fn notify_result(
            &self,
            _service_name: &str,
            request: &NotificationResultRequest,
        ) -> Result<bool> {
            self.calls.lock().unwrap().push(request.clone());
            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                Ok(responses.remove(0))
            } else {
                Ok(responses.first().copied().unwrap_or(true))
            }
        }

        async fn transaction_check(
            &self,
            _service_name: &str,
            _key: &str,
        ) -> Result<TxCheckStatus> {
            Ok(TxCheckStatus::Unknown)
        }
    }

    struct Fixture {
        service: CallbackService,
        repo: Arc<MemoryCallbackLogRepository>,
        notifications: Arc<MemoryNotificationRepository>,
        store: Arc<MemoryStore>,
    }

    async fn fixture(gateway: Arc<dyn TenantGateway>, max_retries: u32) -> Fixture {
        let strategy = ShardingStrategy::new("db", "notifications", 2, 4);
        let store = Arc::new(MemoryStore::new(strategy));
        let quota = Arc::new(MemoryQuotaCache::new());
        quota
            .set(crate::domain::Quota {
                biz_id: 7,
                channel: Channel::Sms,
                quota: 100,
            })
            .await
            .unwrap();
        let notifications = Arc::new(MemoryNotificationRepository::new(store.clone(), quota));
        let repo = Arc::new(MemoryCallbackLogRepository::new(store.clone()));

        let configs = Arc::new(MemoryBusinessConfigStore::new());
        configs
            .save(&BusinessConfig {
                id: 7,
                owner_id: 1,
                owner_type: "organization".into(),
                channel_config: None,
                tx_config: None,
                callback_config: Some(CallbackConfig {
                    service_name: "tenant-svc".into(),
                    retry_policy: Some(RetryPolicy::FixedInterval {
                        interval_ms: 10,
                        max_retries,
                    }),
                }),
                quota_config: None,
                rate_limit: 0,
                ctime: 0,
                utime: 0,
            })
            .await
            .unwrap();
        let config_service = Arc::new(CachedBusinessConfigService::new(configs, None));

        Fixture {
            service: CallbackService::new(
                config_service,
                repo.clone(),
                notifications.clone(),
                gateway,
            ),
            repo,
            notifications,
            store,
        }
    }

    async fn terminal_notification(fixture: &Fixture, id: i64, key: &str) -> Notification {
        let mut params = StdHashMap::new();
        params.insert("c".to_string(), "1".to_string());
        let n = Notification {
            id,
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
            scheduled_end: i64::MAX,
            version: 1,
            strategy: SendStrategyConfig::Immediate,
        };
        let created = fixture.notifications.create(n, true).await.unwrap();
        fixture.notifications.mark_success(&created).await.unwrap();
        fixture.notifications.get_by_id(id).await.unwrap()
    }

    #[tokio::test]
    async fn successful_callback_finishes_the_log() {
        let gateway = Arc::new(StubGateway::new(vec![true]));
        let fixture = fixture(gateway.clone(), 3).await;
        let n = terminal_notification(&fixture, 1, "k1").await;

        fixture.service.send_for_notifications(&[n]).await.unwrap();

        let log = fixture.store.callback_log_of(1).unwrap();
        assert_eq!(log.status, CallbackLogStatus::Succeeded);
        assert_eq!(gateway.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejected_callback_schedules_retry() {
        let gateway = Arc::new(StubGateway::new(vec![false]));
        let fixture = fixture(gateway, 3).await;
        let n = terminal_notification(&fixture, 1, "k1").await;

        fixture.service.send_for_notifications(&[n]).await.unwrap();

        let log = fixture.store.callback_log_of(1).unwrap();
        assert_eq!(log.status, CallbackLogStatus::Pending);
        assert_eq!(log.retry_count, 1);
        assert!(log.next_retry_time > current_time_ms() - 100);
    }

    #[tokio::test]
    async fn retry_exhaustion_fails_the_log() {
        let gateway = Arc::new(StubGateway::new(vec![false]));
        let max_retries = 2;
        let fixture = fixture(gateway, max_retries).await;
        let _ = terminal_notification(&fixture, 1, "k1").await;

        // Drive the scan loop until the policy gives up.
        for _ in 0..=max_retries {
            fixture
                .service
                .send_pending(current_time_ms() + 60_000, 10)
                .await
                .unwrap();
        }

        let log = fixture.store.callback_log_of(1).unwrap();
        assert_eq!(log.status, CallbackLogStatus::Failed);
        assert_eq!(log.retry_count, max_retries);
    }

    #[tokio::test]
    async fn pending_scan_pages_until_partial_page() {
        let gateway = Arc::new(StubGateway::new(vec![true]));
        let fixture = fixture(gateway.clone(), 3).await;
        for i in 1..=5 {
            let _ = terminal_notification(&fixture, i, &format!("k{i}")).await;
        }

        fixture
            .service
            .send_pending(current_time_ms() + 1_000, 2)
            .await
            .unwrap();

        assert_eq!(gateway.calls.lock().unwrap().len(), 5);
        let (remaining, _) = fixture
            .repo
            .find_pending(current_time_ms() + 1_000, 10, 0)
            .await
            .unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn notifications_without_logs_are_skipped() {
        let gateway = Arc::new(StubGateway::new(vec![true]));
        let fixture = fixture(gateway.clone(), 3).await;
        // Created without a callback log (tenant without callback config).
        let mut params = StdHashMap::new();
        params.insert("c".to_string(), "1".to_string());
        let n = fixture
            .notifications
            .create(
                Notification {
                    id: 9,
                    biz_id: 7,
                    key: "no-log".into(),
                    receivers: vec!["r".into()],
                    channel: Channel::Sms,
                    template: TemplateRef {
                        id: 1,
                        version_id: 1,
                        params,
                    },
                    status: SendStatus::Pending,
                    scheduled_start: 0,
                    scheduled_end: i64::MAX,
                    version: 1,
                    strategy: SendStrategyConfig::Immediate,
                },
                false,
            )
            .await
            .unwrap();

        fixture.service.send_for_notifications(&[n]).await.unwrap();
        assert!(gateway.calls.lock().unwrap().is_empty());
    }
}
