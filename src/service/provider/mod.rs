//! Provider contracts and selectors.
//!
//! A [`Selector`] yields providers for one send attempt until it is
//! exhausted; a [`SelectorBuilder`] constructs a fresh selector per send.

pub mod console;
pub mod health;
pub mod sequential;

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{Notification, SendReceipt};
use crate::error::{AppError, Result};

/// A concrete delivery backend for one channel (an SMS vendor, an SMTP
/// relay, the in-app pipe). Status codes are normalized by implementations:
/// provider-side OK means success, anything else surfaces as an error.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, notification: &Notification) -> Result<SendReceipt>;
}

/// Iterator over candidate providers for a single send attempt.
#[async_trait]
pub trait Selector: Send {
    /// The next provider to try, or [`AppError::NoAvailableProvider`] when
    /// the stream is exhausted.
    async fn next(&mut self, notification: &Notification) -> Result<Arc<dyn Provider>>;
}

/// Constructs a fresh [`Selector`] for each send.
pub trait SelectorBuilder: Send + Sync {
    fn build(&self) -> Box<dyn Selector>;
}

/// Convenience for tests and single-provider channels.
pub fn exhausted_error() -> AppError {
    AppError::NoAvailableProvider
}
