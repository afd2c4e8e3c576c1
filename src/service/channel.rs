//! Channel dispatcher: routes a notification to its channel's provider
//! selector and iterates providers until one succeeds.

use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::{Channel, Notification, SendReceipt};
use crate::error::{AppError, Result};
use crate::metrics::PROVIDER_SEND_TOTAL;

use super::provider::SelectorBuilder;

pub struct ChannelDispatcher {
    selectors: HashMap<Channel, Arc<dyn SelectorBuilder>>,
}

impl ChannelDispatcher {
    pub fn new(selectors: HashMap<Channel, Arc<dyn SelectorBuilder>>) -> Self {
        Self { selectors }
    }

    /// Try providers for the notification's channel in selector order.
    /// Returns the first success, or the exhaustion error once the selector
    /// runs dry.
    pub async fn send(&self, notification: &Notification) -> Result<SendReceipt> {
        let builder = self
            .selectors
            .get(&notification.channel)
            .ok_or_else(|| AppError::NoAvailableChannel(notification.channel.to_string()))?;

        let mut selector = builder.build();
        loop {
            let provider = selector.next(notification).await?;
            match provider.send(notification).await {
                Ok(receipt) => {
                    PROVIDER_SEND_TOTAL
                        .with_label_values(&[provider.name(), "ok"])
                        .inc();
                    return Ok(receipt);
                }
                Err(e) => {
                    PROVIDER_SEND_TOTAL
                        .with_label_values(&[provider.name(), "error"])
                        .inc();
                    tracing::warn!(
                        notification_id = notification.id,
                        provider = %provider.name(),
                        error = %e,
                        "provider send failed, trying next"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{SendStatus, SendStrategyConfig, TemplateRef};
    use crate::service::provider::console::ScriptedProvider;
    use crate::service::provider::sequential::SequentialSelectorBuilder;

    fn notification(channel: Channel) -> Notification {
        Notification {
            id: 1,
            biz_id: 7,
            key: "k".into(),
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

    fn dispatcher_with(providers: Vec<Arc<ScriptedProvider>>) -> ChannelDispatcher {
        let providers: Vec<Arc<dyn crate::service::provider::Provider>> = providers
            .into_iter()
            .map(|p| p as Arc<dyn crate::service::provider::Provider>)
            .collect();
        let mut selectors: HashMap<Channel, Arc<dyn SelectorBuilder>> = HashMap::new();
        selectors.insert(
            Channel::Sms,
            Arc::new(SequentialSelectorBuilder::new(providers)),
        );
        ChannelDispatcher::new(selectors)
    }

    #[tokio::test]
    async fn fails_over_to_second_provider() {
        let first = Arc::new(ScriptedProvider::always_failing("first"));
        let second = Arc::new(ScriptedProvider::always_succeeding("second"));
        let dispatcher = dispatcher_with(vec![first.clone(), second.clone()]);

        let receipt = dispatcher.send(&notification(Channel::Sms)).await.unwrap();
        assert_eq!(receipt.status, SendStatus::Succeeded);
        assert_eq!(first.failed_count(), 1);
        assert_eq!(second.sent_count(), 1);
    }

    #[tokio::test]
    async fn exhaustion_surfaces_no_available_provider() {
        let only = Arc::new(ScriptedProvider::always_failing("only"));
        let dispatcher = dispatcher_with(vec![only]);
        let err = dispatcher
            .send(&notification(Channel::Sms))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NoAvailableProvider));
    }

    #[tokio::test]
    async fn unconfigured_channel_is_rejected() {
        let dispatcher = dispatcher_with(vec![Arc::new(ScriptedProvider::always_succeeding(
            "sms-only",
        ))]);
        let err = dispatcher
            .send(&notification(Channel::Email))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NoAvailableChannel(_)));
    }
}
