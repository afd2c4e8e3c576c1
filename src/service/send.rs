//! Front door of the send pipeline: validation, id assignment, and routing
//! to the send strategies. The async variants rewrite IMMEDIATE to a
//! one-minute deadline so the scheduler delivers them.

use std::sync::Arc;

use crate::domain::{Notification, SendReceipt, SendStatus};
use crate::error::{AppError, Result};
use crate::repository::NotificationRepository;
use crate::sharding::IdGenerator;

use super::strategy::SendStrategyDispatcher;

/// Hard cap on one batch request.
pub const MAX_BATCH_SIZE: usize = 100;

pub struct SendService {
    dispatcher: Arc<SendStrategyDispatcher>,
    repo: Arc<dyn NotificationRepository>,
    idgen: Arc<IdGenerator>,
}

impl SendService {
    pub fn new(
        dispatcher: Arc<SendStrategyDispatcher>,
        repo: Arc<dyn NotificationRepository>,
        idgen: Arc<IdGenerator>,
    ) -> Self {
        Self {
            dispatcher,
            repo,
            idgen,
        }
    }

    fn admit(&self, notification: &mut Notification) -> Result<()> {
        notification.validate()?;
        notification.id = self.idgen.generate(notification.biz_id, &notification.key);
        notification.status = SendStatus::Pending;
        notification.version = 1;
        Ok(())
    }

    fn admit_batch(&self, notifications: &mut [Notification]) -> Result<()> {
        if notifications.is_empty() {
            return Err(AppError::InvalidParameter(
                "notification batch must not be empty".into(),
            ));
        }
        if notifications.len() > MAX_BATCH_SIZE {
            return Err(AppError::InvalidParameter(format!(
                "batch size {} exceeds the limit of {MAX_BATCH_SIZE}",
                notifications.len()
            )));
        }
        for n in notifications.iter_mut() {
            self.admit(n)?;
        }
        Ok(())
    }

    /// Synchronous single send.
    pub async fn send_notification(&self, mut notification: Notification) -> Result<SendReceipt> {
        self.admit(&mut notification)?;
        self.dispatcher.send(notification).await
    }

    /// Asynchronous single send: accepted now, delivered by the scheduler.
    pub async fn send_notification_async(
        &self,
        mut notification: Notification,
    ) -> Result<SendReceipt> {
        self.admit(&mut notification)?;
        notification.replace_async_immediate();
        self.dispatcher.send(notification).await
    }

    /// Synchronous batch send; the whole batch shares one strategy type.
    pub async fn batch_send_notifications(
        &self,
        mut notifications: Vec<Notification>,
    ) -> Result<Vec<SendReceipt>> {
        self.admit_batch(&mut notifications)?;
        self.dispatcher.batch_send(notifications).await
    }

    /// Asynchronous batch send; returns the assigned ids immediately.
    pub async fn batch_send_notifications_async(
        &self,
        mut notifications: Vec<Notification>,
    ) -> Result<Vec<i64>> {
        self.admit_batch(&mut notifications)?;
        for n in notifications.iter_mut() {
            n.replace_async_immediate();
        }
        let ids = notifications.iter().map(|n| n.id).collect();
        self.dispatcher.batch_send(notifications).await?;
        Ok(ids)
    }

    /// Query one notification by its idempotency key.
    pub async fn query_notification(&self, biz_id: i64, key: &str) -> Result<Notification> {
        self.repo.get_by_key(biz_id, key).await
    }

    /// Query a set of notifications by keys.
    pub async fn batch_query_notifications(
        &self,
        biz_id: i64,
        keys: &[String],
    ) -> Result<Vec<Notification>> {
        if keys.is_empty() {
            return Err(AppError::InvalidParameter(
                "key list must not be empty".into(),
            ));
        }
        self.repo.get_by_keys(biz_id, keys).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::domain::{Channel, Quota, SendStrategyConfig, TemplateRef};
    use crate::repository::memory::{
        MemoryBusinessConfigStore, MemoryCallbackLogRepository, MemoryNotificationRepository,
        MemoryQuotaCache, MemoryStore,
    };
    use crate::repository::{
        BusinessConfigService, CachedBusinessConfigService, QuotaCache,
    };
    use crate::service::callback::CallbackService;
    use crate::service::channel::ChannelDispatcher;
    use crate::service::client::{
        NotificationResultRequest, TenantGateway, TxCheckStatus,
    };
    use crate::service::provider::console::ScriptedProvider;
    use crate::service::provider::sequential::SequentialSelectorBuilder;
    use crate::service::provider::SelectorBuilder;
    use crate::service::sender::Sender;
    use crate::service::strategy::{DefaultStrategy, ImmediateStrategy};
    use crate::sharding::ShardingStrategy;

    struct NoopGateway;

    #[async_trait::async_trait]
    impl TenantGateway for NoopGateway {
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
            Ok(TxCheckStatus::Unknown)
        }
    }

    async fn service() -> (SendService, Arc<ScriptedProvider>) {
        let strategy = ShardingStrategy::new("db", "notifications", 2, 4);
        let store = Arc::new(MemoryStore::new(strategy));
        let quota = Arc::new(MemoryQuotaCache::new());
        quota
            .set(Quota {
                biz_id: 7,
                channel: Channel::Sms,
                quota: 1_000,
            })
            .await
            .unwrap();
        let repo = Arc::new(MemoryNotificationRepository::new(
            store.clone(),
            quota.clone(),
        ));

        let provider = Arc::new(ScriptedProvider::always_succeeding("p"));
        let mut selectors: HashMap<Channel, Arc<dyn SelectorBuilder>> = HashMap::new();
        selectors.insert(
            Channel::Sms,
            Arc::new(SequentialSelectorBuilder::new(vec![provider.clone()])),
        );
        let channel = Arc::new(ChannelDispatcher::new(selectors));

        let configs = Arc::new(MemoryBusinessConfigStore::new());
        let config_service: Arc<dyn BusinessConfigService> =
            Arc::new(CachedBusinessConfigService::new(configs, None));
        let callbacks = Arc::new(CallbackService::new(
            config_service.clone(),
            Arc::new(MemoryCallbackLogRepository::new(store.clone())),
            repo.clone(),
            Arc::new(NoopGateway),
        ));
        let sender = Arc::new(Sender::new(repo.clone(), channel, callbacks));
        let immediate = Arc::new(ImmediateStrategy::new(
            repo.clone(),
            config_service.clone(),
            sender,
        ));
        let default = Arc::new(DefaultStrategy::new(repo.clone(), config_service));
        let dispatcher = Arc::new(SendStrategyDispatcher::new(immediate, default));

        (
            SendService::new(dispatcher, repo, Arc::new(IdGenerator::new())),
            provider,
        )
    }

    fn notification(key: &str, strategy: SendStrategyConfig) -> Notification {
        let mut params = HashMap::new();
        params.insert("c".to_string(), "1".to_string());
        Notification {
            id: 0,
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
            strategy,
        }
    }

    #[tokio::test]
    async fn send_assigns_id_and_delivers() {
        let (service, provider) = service().await;
        let receipt = service
            .send_notification(notification("k1", SendStrategyConfig::Immediate))
            .await
            .unwrap();
        assert_ne!(receipt.notification_id, 0);
        assert_eq!(receipt.status, SendStatus::Succeeded);
        assert_eq!(provider.sent_count(), 1);
    }

    #[tokio::test]
    async fn async_immediate_defers_to_scheduler() {
        let (service, provider) = service().await;
        let receipt = service
            .send_notification_async(notification("k1", SendStrategyConfig::Immediate))
            .await
            .unwrap();
        // Rewritten to a deadline strategy, so only persisted.
        assert_eq!(receipt.status, SendStatus::Pending);
        assert_eq!(provider.sent_count(), 0);

        let stored = service.query_notification(7, "k1").await.unwrap();
        assert!(matches!(
            stored.strategy,
            SendStrategyConfig::Deadline { .. }
        ));
    }

    #[tokio::test]
    async fn oversized_batch_is_rejected() {
        let (service, _) = service().await;
        let batch: Vec<Notification> = (0..=MAX_BATCH_SIZE)
            .map(|i| notification(&format!("k{i}"), SendStrategyConfig::Immediate))
            .collect();
        assert_eq!(batch.len(), 101);
        let err = service.batch_send_notifications(batch).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn invalid_notification_is_rejected_before_id_assignment() {
        let (service, _) = service().await;
        let mut bad = notification("k1", SendStrategyConfig::Immediate);
        bad.receivers.clear();
        let err = service.send_notification(bad).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn async_batch_returns_ids() {
        let (service, _) = service().await;
        let batch = vec![
            notification("k1", SendStrategyConfig::Delayed { delay_seconds: 10 }),
            notification("k2", SendStrategyConfig::Delayed { delay_seconds: 10 }),
        ];
        let ids = service.batch_send_notifications_async(batch).await.unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.iter().all(|&id| id != 0));
    }

    #[tokio::test]
    async fn batch_query_requires_keys() {
        let (service, _) = service().await;
        assert!(service.batch_query_notifications(7, &[]).await.is_err());
    }
}
