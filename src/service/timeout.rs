//! Sweeps notifications stuck in SENDING past the deadline so they do not
//! linger when a sender died mid-flight.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::loopjob::{LoopBiz, LoopContext};
use crate::repository::NotificationRepository;

pub struct SendingTimeoutTask {
    repo: Arc<dyn NotificationRepository>,
    batch_size: usize,
}

impl SendingTimeoutTask {
    pub const LOCK_KEY: &'static str = "notifyd:job:sending_timeout";
    const IDLE_PAUSE: Duration = Duration::from_secs(10);

    pub fn new(repo: Arc<dyn NotificationRepository>, batch_size: usize) -> Self {
        Self { repo, batch_size }
    }
}

#[async_trait]
impl LoopBiz for SendingTimeoutTask {
    async fn run_once(&self, ctx: &LoopContext) -> Result<()> {
        while !ctx.expired() {
            let swept = self
                .repo
                .mark_timeout_sending_as_failed(self.batch_size)
                .await?;
            if swept > 0 {
                tracing::info!(swept, "failed notifications stuck in SENDING");
            }
            // A short page means the backlog is drained; rest a while.
            if (swept as usize) < self.batch_size {
                ctx.sleep(Self::IDLE_PAUSE).await;
            }
        }
        Ok(())
    }
}
