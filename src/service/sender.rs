//! The sender: pushes a notification through the channel dispatcher,
//! persists the terminal status, refunds quota on failure (via the
//! repository coupling), and fires tenant callbacks.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;

use crate::domain::{Notification, SendReceipt, SendStatus};
use crate::error::Result;
use crate::metrics::NOTIFICATIONS_TERMINAL_TOTAL;
use crate::repository::NotificationRepository;

use super::callback::CallbackService;
use super::channel::ChannelDispatcher;

const DEFAULT_MAX_CONCURRENT_SENDS: usize = 64;

#[async_trait]
pub trait NotificationSender: Send + Sync {
    /// Send one notification to completion and persist the outcome.
    async fn send(&self, notification: Notification) -> Result<SendReceipt>;

    /// Send a batch with bounded concurrency; one batched status update
    /// covers the whole set. Result ordering is not guaranteed.
    async fn batch_send(&self, notifications: Vec<Notification>) -> Result<Vec<SendReceipt>>;
}

pub struct Sender {
    repo: Arc<dyn NotificationRepository>,
    channel: Arc<ChannelDispatcher>,
    callbacks: Arc<CallbackService>,
    send_permits: Arc<Semaphore>,
}

impl Sender {
    pub fn new(
        repo: Arc<dyn NotificationRepository>,
        channel: Arc<ChannelDispatcher>,
        callbacks: Arc<CallbackService>,
    ) -> Self {
        Self::with_concurrency(repo, channel, callbacks, DEFAULT_MAX_CONCURRENT_SENDS)
    }

    pub fn with_concurrency(
        repo: Arc<dyn NotificationRepository>,
        channel: Arc<ChannelDispatcher>,
        callbacks: Arc<CallbackService>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            repo,
            channel,
            callbacks,
            send_permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }
}

#[async_trait]
impl NotificationSender for Sender {
    async fn send(&self, mut notification: Notification) -> Result<SendReceipt> {
        let outcome = self.channel.send(&notification).await;
        match outcome {
            Ok(_) => {
                notification.status = SendStatus::Succeeded;
                self.repo.mark_success(&notification).await?;
            }
            Err(e) => {
                tracing::warn!(
                    notification_id = notification.id,
                    error = %e,
                    "delivery failed, marking notification FAILED"
                );
                notification.status = SendStatus::Failed;
                self.repo.mark_failed(&notification).await?;
            }
        }
        NOTIFICATIONS_TERMINAL_TOTAL
            .with_label_values(&[notification.status.as_str()])
            .inc();

        // Terminal either way; the callback service skips tenants without a
        // callback config.
        if let Err(e) = self
            .callbacks
            .send_for_notifications(std::slice::from_ref(&notification))
            .await
        {
            tracing::warn!(
                notification_id = notification.id,
                error = %e,
                "result callback dispatch failed"
            );
        }

        Ok(SendReceipt {
            notification_id: notification.id,
            status: notification.status,
        })
    }

    async fn batch_send(&self, notifications: Vec<Notification>) -> Result<Vec<SendReceipt>> {
        if notifications.is_empty() {
            return Ok(Vec::new());
        }

        // Fan out over the bounded pool and collect per-item outcomes.
        let mut futures = FuturesUnordered::new();
        for notification in notifications {
            let channel = self.channel.clone();
            let permits = self.send_permits.clone();
            futures.push(async move {
                let _permit = permits
                    .acquire()
                    .await
                    .expect("send semaphore never closes");
                let outcome = channel.send(&notification).await;
                (notification.id, outcome.is_ok())
            });
        }

        let mut succeeded_ids = Vec::new();
        let mut failed_ids = Vec::new();
        while let Some((id, ok)) = futures.next().await {
            if ok {
                succeeded_ids.push(id);
            } else {
                failed_ids.push(id);
            }
        }

        // Re-read rows for current versions before the batched update.
        let mut all_ids = Vec::with_capacity(succeeded_ids.len() + failed_ids.len());
        all_ids.extend(&succeeded_ids);
        all_ids.extend(&failed_ids);
        let mut rows = self.repo.batch_get_by_ids(&all_ids).await?;

        let collect = |ids: &[i64],
                       status: SendStatus,
                       rows: &mut std::collections::HashMap<i64, Notification>| {
            ids.iter()
                .filter_map(|id| {
                    rows.remove(id).map(|mut n| {
                        n.status = status;
                        n
                    })
                })
                .collect::<Vec<_>>()
        };
        let succeeded = collect(&succeeded_ids, SendStatus::Succeeded, &mut rows);
        let failed = collect(&failed_ids, SendStatus::Failed, &mut rows);

        self.repo
            .batch_mark_succeeded_or_failed(&succeeded, &failed)
            .await?;
        NOTIFICATIONS_TERMINAL_TOTAL
            .with_label_values(&[SendStatus::Succeeded.as_str()])
            .inc_by(succeeded.len() as u64);
        NOTIFICATIONS_TERMINAL_TOTAL
            .with_label_values(&[SendStatus::Failed.as_str()])
            .inc_by(failed.len() as u64);

        let mut terminal = succeeded;
        terminal.extend(failed);
        if let Err(e) = self.callbacks.send_for_notifications(&terminal).await {
            tracing::warn!(error = %e, "batched result callback dispatch failed");
        }

        Ok(terminal
            .into_iter()
            .map(|n| SendReceipt {
                notification_id: n.id,
                status: n.status,
            })
            .collect())
    }
}
