//! Development and test providers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::domain::{Notification, SendReceipt, SendStatus};
use crate::error::{AppError, Result};

use super::Provider;

/// Logs instead of delivering. The development stand-in for a real vendor.
pub struct ConsoleProvider {
    name: String,
}

impl ConsoleProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Provider for ConsoleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, notification: &Notification) -> Result<SendReceipt> {
        tracing::info!(
            provider = %self.name,
            notification_id = notification.id,
            channel = %notification.channel,
            receivers = notification.receivers.len(),
            "console provider delivered notification"
        );
        Ok(SendReceipt {
            notification_id: notification.id,
            status: SendStatus::Succeeded,
        })
    }
}

/// Test provider following a scripted sequence of outcomes; once the script
/// runs out the last outcome repeats.
pub struct ScriptedProvider {
    name: String,
    script: Mutex<Vec<bool>>,
    sent: AtomicU64,
    failed: AtomicU64,
}

impl ScriptedProvider {
    pub fn new(name: &str, script: Vec<bool>) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(script),
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn always_failing(name: &str) -> Self {
        Self::new(name, vec![false])
    }

    pub fn always_succeeding(name: &str) -> Self {
        Self::new(name, vec![true])
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, notification: &Notification) -> Result<SendReceipt> {
        let ok = {
            let mut script = self.script.lock().expect("script mutex poisoned");
            if script.len() > 1 {
                script.remove(0)
            } else {
                script.first().copied().unwrap_or(true)
            }
        };
        if ok {
            self.sent.fetch_add(1, Ordering::Relaxed);
            Ok(SendReceipt {
                notification_id: notification.id,
                status: SendStatus::Succeeded,
            })
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
            Err(AppError::ProviderRejected {
                code: "SCRIPTED_FAILURE".to_string(),
                message: format!("{} rejected by script", self.name),
            })
        }
    }
}
