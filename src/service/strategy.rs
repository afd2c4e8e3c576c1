//! Send strategies: immediate (persist + send synchronously) and default
//! (persist only; the scheduler drains it later). The dispatcher routes on
//! the notification's strategy config.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{Notification, SendReceipt, SendStatus};
use crate::error::{AppError, Result};
use crate::metrics::NOTIFICATIONS_ACCEPTED_TOTAL;
use crate::repository::{BusinessConfigService, NotificationRepository};

use super::sender::NotificationSender;

#[async_trait]
pub trait SendStrategy: Send + Sync {
    async fn send(&self, notification: Notification) -> Result<SendReceipt>;
    /// Batched send; callers guarantee the batch shares one strategy type.
    async fn batch_send(&self, notifications: Vec<Notification>) -> Result<Vec<SendReceipt>>;
}

/// Whether acceptance should create a callback log alongside the row.
async fn tenant_has_callback(config: &Arc<dyn BusinessConfigService>, biz_id: i64) -> bool {
    match config.get_by_id(biz_id).await {
        Ok(config) => config.callback_config.is_some(),
        Err(e) => {
            tracing::warn!(biz_id, error = %e, "business config lookup failed");
            false
        }
    }
}

/// Persist and deliver in the caller's request.
pub struct ImmediateStrategy {
    repo: Arc<dyn NotificationRepository>,
    config: Arc<dyn BusinessConfigService>,
    sender: Arc<dyn NotificationSender>,
}

impl ImmediateStrategy {
    pub fn new(
        repo: Arc<dyn NotificationRepository>,
        config: Arc<dyn BusinessConfigService>,
        sender: Arc<dyn NotificationSender>,
    ) -> Self {
        Self {
            repo,
            config,
            sender,
        }
    }

    /// Duplicate `(biz_id, key)` means the tenant is retrying. Replay the
    /// stored outcome when it is final, reject when a send is in flight,
    /// otherwise claim the row and send it now.
    async fn handle_duplicate(&self, biz_id: i64, key: &str) -> Result<SendReceipt> {
        let existing = self.repo.get_by_key(biz_id, key).await?;
        match existing.status {
            SendStatus::Succeeded => Ok(SendReceipt {
                notification_id: existing.id,
                status: SendStatus::Succeeded,
            }),
            SendStatus::Sending => Err(AppError::SendInProgress),
            _ => {
                self.repo
                    .cas_status(existing.id, existing.version, SendStatus::Sending)
                    .await?;
                let mut claimed = existing;
                claimed.status = SendStatus::Sending;
                claimed.version += 1;
                self.sender.send(claimed).await
            }
        }
    }
}

#[async_trait]
impl SendStrategy for ImmediateStrategy {
    async fn send(&self, mut notification: Notification) -> Result<SendReceipt> {
        notification.fill_send_window();
        let with_log = tenant_has_callback(&self.config, notification.biz_id).await;

        match self.repo.create(notification.clone(), with_log).await {
            Ok(created) => {
                NOTIFICATIONS_ACCEPTED_TOTAL
                    .with_label_values(&[created.channel.as_str()])
                    .inc();
                self.sender.send(created).await
            }
            Err(AppError::DuplicateNotification) => {
                self.handle_duplicate(notification.biz_id, &notification.key)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    async fn batch_send(&self, mut notifications: Vec<Notification>) -> Result<Vec<SendReceipt>> {
        if notifications.is_empty() {
            return Err(AppError::InvalidParameter(
                "notification batch must not be empty".into(),
            ));
        }
        for n in notifications.iter_mut() {
            n.fill_send_window();
        }
        // One tenant per batch; its config decides the callback logs.
        let with_log = tenant_has_callback(&self.config, notifications[0].biz_id).await;
        let created = self.repo.batch_create(notifications, with_log).await?;
        for n in &created {
            NOTIFICATIONS_ACCEPTED_TOTAL
                .with_label_values(&[n.channel.as_str()])
                .inc();
        }
        self.sender.batch_send(created).await
    }
}

/// Persist only; the response status is whatever was stored (PENDING) and
/// the sharded scheduler picks the row up inside its window.
pub struct DefaultStrategy {
    repo: Arc<dyn NotificationRepository>,
    config: Arc<dyn BusinessConfigService>,
}

impl DefaultStrategy {
    pub fn new(
        repo: Arc<dyn NotificationRepository>,
        config: Arc<dyn BusinessConfigService>,
    ) -> Self {
        Self { repo, config }
    }
}

#[async_trait]
impl SendStrategy for DefaultStrategy {
    async fn send(&self, mut notification: Notification) -> Result<SendReceipt> {
        notification.fill_send_window();
        let with_log = tenant_has_callback(&self.config, notification.biz_id).await;
        let created = self.repo.create(notification, with_log).await?;
        NOTIFICATIONS_ACCEPTED_TOTAL
            .with_label_values(&[created.channel.as_str()])
            .inc();
        Ok(SendReceipt {
            notification_id: created.id,
            status: created.status,
        })
    }

    async fn batch_send(&self, mut notifications: Vec<Notification>) -> Result<Vec<SendReceipt>> {
        if notifications.is_empty() {
            return Err(AppError::InvalidParameter(
                "notification batch must not be empty".into(),
            ));
        }
        for n in notifications.iter_mut() {
            n.fill_send_window();
        }
        let with_log = tenant_has_callback(&self.config, notifications[0].biz_id).await;
        let created = self.repo.batch_create(notifications, with_log).await?;
        let receipts = created
            .iter()
            .map(|n| {
                NOTIFICATIONS_ACCEPTED_TOTAL
                    .with_label_values(&[n.channel.as_str()])
                    .inc();
                SendReceipt {
                    notification_id: n.id,
                    status: n.status,
                }
            })
            .collect();
        Ok(receipts)
    }
}

/// Routes to the immediate strategy for IMMEDIATE configs, the default
/// strategy for everything else.
pub struct SendStrategyDispatcher {
    immediate: Arc<ImmediateStrategy>,
    default: Arc<DefaultStrategy>,
}

impl SendStrategyDispatcher {
    pub fn new(immediate: Arc<ImmediateStrategy>, default: Arc<DefaultStrategy>) -> Self {
        Self { immediate, default }
    }

    fn select(&self, notification: &Notification) -> &dyn SendStrategy {
        if notification.is_immediate() {
            self.immediate.as_ref()
        } else {
            self.default.as_ref()
        }
    }

    pub async fn send(&self, notification: Notification) -> Result<SendReceipt> {
        self.select(&notification).send(notification).await
    }

    pub async fn batch_send(&self, notifications: Vec<Notification>) -> Result<Vec<SendReceipt>> {
        let first = notifications.first().ok_or_else(|| {
            AppError::InvalidParameter("notification batch must not be empty".into())
        })?;
        // One strategy per batch, decided by the first element.
        self.select(first).batch_send(notifications).await
    }
}
