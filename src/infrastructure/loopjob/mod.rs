//! Distributed loop jobs.
//!
//! Two primitives schedule recurring work without an external job platform:
//!
//! * [`InfiniteLoop`] — one named lock, one owner at a time, business runs in
//!   a bounded-timeout inner loop with lock refresh between iterations.
//! * [`ShardingLoopJob`] — contends for one lock per `(db, table)` shard,
//!   capped by a process-wide [`ResourceSemaphore`], and runs an owned loop
//!   per acquired shard.
//!
//! The business timeout is kept below the lock TTL so a live owner never
//! loses its lease mid-iteration.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::dlock::{DistributedLock, LockClient};
use crate::error::AppError;
use crate::sharding::{ShardDst, ShardingStrategy};

const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60);
const DEFAULT_BIZ_TIMEOUT: Duration = Duration::from_secs(50);

/// Per-invocation context handed to the business closure.
pub struct LoopContext {
    /// The owned shard, when running under a [`ShardingLoopJob`].
    pub shard: Option<ShardDst>,
    /// Soft deadline for this invocation; the business must return by then.
    pub deadline: Instant,
    pub cancel: CancellationToken,
}

impl LoopContext {
    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline || self.cancel.is_cancelled()
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Sleep for `duration`, waking early on cancellation or deadline.
    pub async fn sleep(&self, duration: Duration) {
        let capped = duration.min(self.remaining());
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(capped) => {}
        }
    }
}

/// Business body of a loop job. One invocation should respect
/// `ctx.deadline`; the framework refreshes the lock in between.
#[async_trait]
pub trait LoopBiz: Send + Sync + 'static {
    async fn run_once(&self, ctx: &LoopContext) -> Result<(), AppError>;
}

/// Tuning knobs shared by both loop primitives.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub retry_interval: Duration,
    pub default_timeout: Duration,
    pub lock_ttl: Duration,
    pub biz_timeout: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
            default_timeout: DEFAULT_TIMEOUT,
            lock_ttl: DEFAULT_LOCK_TTL,
            biz_timeout: DEFAULT_BIZ_TIMEOUT,
        }
    }
}

/// Singleton loop guarded by one named distributed lock.
pub struct InfiniteLoop {
    client: Arc<dyn LockClient>,
    key: String,
    biz: Arc<dyn LoopBiz>,
    config: LoopConfig,
}

impl InfiniteLoop {
    pub fn new(client: Arc<dyn LockClient>, biz: Arc<dyn LoopBiz>, key: &str) -> Self {
        Self::with_config(client, biz, key, LoopConfig::default())
    }

    pub fn with_config(
        client: Arc<dyn LockClient>,
        biz: Arc<dyn LoopBiz>,
        key: &str,
        config: LoopConfig,
    ) -> Self {
        Self {
            client,
            key: key.to_string(),
            biz,
            config,
        }
    }

    /// Run until `cancel` fires. Lock acquisition failure is non-fatal and
    /// retried after the retry interval.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                tracing::info!(key = %self.key, "loop job cancelled, exiting");
                return;
            }

            let lock = self.client.new_lock(&self.key, self.config.lock_ttl);
            match timeout(self.config.default_timeout, lock.acquire()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(key = %self.key, error = %e, "lock not acquired, will retry");
                    sleep_or_cancel(&cancel, self.config.retry_interval).await;
                    continue;
                }
                Err(_) => {
                    tracing::warn!(key = %self.key, "lock acquisition timed out, will retry");
                    sleep_or_cancel(&cancel, self.config.retry_interval).await;
                    continue;
                }
            }

            let result = guarded_biz_loop(
                self.biz.as_ref(),
                None,
                lock.as_ref(),
                &cancel,
                &self.config,
                false,
            )
            .await;
            if let Err(e) = result {
                tracing::warn!(key = %self.key, error = %e, "loop job released its lock");
            }

            release_lock(lock.as_ref(), self.config.default_timeout).await;

            if cancel.is_cancelled() {
                tracing::info!(key = %self.key, "loop job cancelled, exiting");
                return;
            }
            sleep_or_cancel(&cancel, self.config.retry_interval).await;
        }
    }
}

/// Contends for every shard's lock and runs an owned loop per acquisition.
pub struct ShardingLoopJob {
    client: Arc<dyn LockClient>,
    base_key: String,
    biz: Arc<dyn LoopBiz>,
    strategy: ShardingStrategy,
    semaphore: Arc<ResourceSemaphore>,
    config: LoopConfig,
}

impl ShardingLoopJob {
    pub fn new(
        client: Arc<dyn LockClient>,
        base_key: &str,
        biz: Arc<dyn LoopBiz>,
        strategy: ShardingStrategy,
        semaphore: Arc<ResourceSemaphore>,
    ) -> Self {
        Self::with_config(client, base_key, biz, strategy, semaphore, LoopConfig::default())
    }

    pub fn with_config(
        client: Arc<dyn LockClient>,
        base_key: &str,
        biz: Arc<dyn LoopBiz>,
        strategy: ShardingStrategy,
        semaphore: Arc<ResourceSemaphore>,
        config: LoopConfig,
    ) -> Self {
        Self {
            client,
            base_key: base_key.to_string(),
            biz,
            strategy,
            semaphore,
            config,
        }
    }

    fn shard_key(&self, dst: &ShardDst) -> String {
        format!("{}:{}:{}", self.base_key, dst.db, dst.table)
    }

    /// Sweep all shards, spawning an owned loop for each lock won, then
    /// sleep and sweep again. Runs until `cancel` fires; owned shard loops
    /// observe the same token.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            for dst in self.strategy.broadcast() {
                if cancel.is_cancelled() {
                    tracing::info!(key = %self.base_key, "sharding loop job cancelled, exiting");
                    return;
                }

                // Process-wide cap on owned shards. At capacity no later
                // destination can be taken either, so stop this sweep.
                if self.semaphore.acquire().is_err() {
                    break;
                }

                let key = self.shard_key(&dst);
                let lock = self.client.new_lock(&key, self.config.lock_ttl);
                match timeout(self.config.default_timeout, lock.acquire()).await {
                    Ok(Ok(())) => {
                        tracing::info!(shard_key = %key, "shard lock acquired");
                        let job = self.clone();
                        let shard_cancel = cancel.clone();
                        tokio::spawn(async move {
                            job.shard_loop(dst, lock, shard_cancel).await;
                        });
                    }
                    _ => {
                        // Held elsewhere or unreachable; give the permit back.
                        self.semaphore.release();
                    }
                }
            }

            sleep_or_cancel(&cancel, self.config.retry_interval).await;
            if cancel.is_cancelled() {
                tracing::info!(key = %self.base_key, "sharding loop job cancelled, exiting");
                return;
            }
        }
    }

    async fn shard_loop(
        self: Arc<Self>,
        dst: ShardDst,
        lock: Arc<dyn DistributedLock>,
        cancel: CancellationToken,
    ) {
        let result = guarded_biz_loop(
            self.biz.as_ref(),
            Some(dst.clone()),
            lock.as_ref(),
            &cancel,
            &self.config,
            true,
        )
        .await;
        if let Err(e) = result {
            tracing::warn!(
                db = %dst.db,
                table = %dst.table,
                error = %e,
                "shard loop released its shard"
            );
        }

        release_lock(lock.as_ref(), self.config.default_timeout).await;
        self.semaphore.release();
    }
}

/// Shared owner loop: run the business with a bounded deadline, then refresh
/// the lock. Refresh failure always exits so another process can take over;
/// a business error exits only when `release_on_biz_error` is set (the
/// sharded scheduler's error-condition sentinel rides this path).
async fn guarded_biz_loop(
    biz: &dyn LoopBiz,
    shard: Option<ShardDst>,
    lock: &dyn DistributedLock,
    cancel: &CancellationToken,
    config: &LoopConfig,
    release_on_biz_error: bool,
) -> Result<(), AppError> {
    loop {
        let ctx = LoopContext {
            shard: shard.clone(),
            deadline: Instant::now() + config.biz_timeout,
            cancel: cancel.clone(),
        };
        if let Err(e) = biz.run_once(&ctx).await {
            tracing::error!(key = %lock.key(), error = %e, "loop business failed");
            if release_on_biz_error {
                return Err(e);
            }
        }

        if cancel.is_cancelled() {
            return Ok(());
        }

        match timeout(config.default_timeout, lock.refresh()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(key = %lock.key(), error = %e, "lock refresh failed");
                return Err(e);
            }
            Err(_) => {
                tracing::error!(key = %lock.key(), "lock refresh timed out");
                return Err(AppError::LockUnavailable(lock.key().to_string()));
            }
        }
    }
}

/// Unlock on a fresh bounded timeout so release is attempted even when the
/// parent context is already cancelled.
async fn release_lock(lock: &dyn DistributedLock, release_timeout: Duration) {
    match timeout(release_timeout, lock.release()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(key = %lock.key(), error = %e, "lock release failed"),
        Err(_) => tracing::error!(key = %lock.key(), "lock release timed out"),
    }
}

async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}

/// Counting semaphore whose maximum can change at runtime.
///
/// Lowering the maximum below the number of current holders never preempts;
/// the limit only gates new acquisitions.
#[derive(Debug)]
pub struct ResourceSemaphore {
    counts: Mutex<Counts>,
}

#[derive(Debug)]
struct Counts {
    max: usize,
    current: usize,
}

impl ResourceSemaphore {
    pub fn new(max: usize) -> Self {
        Self {
            counts: Mutex::new(Counts { max, current: 0 }),
        }
    }

    pub fn acquire(&self) -> Result<(), AppError> {
        let mut counts = self.counts.lock().expect("semaphore mutex poisoned");
        if counts.current >= counts.max {
            return Err(AppError::ShardLimitReached);
        }
        counts.current += 1;
        Ok(())
    }

    pub fn release(&self) {
        let mut counts = self.counts.lock().expect("semaphore mutex poisoned");
        counts.current = counts.current.saturating_sub(1);
    }

    /// Fed by the configuration watcher.
    pub fn update_max_count(&self, max: usize) {
        let mut counts = self.counts.lock().expect("semaphore mutex poisoned");
        counts.max = max;
    }

    pub fn current(&self) -> usize {
        self.counts.lock().expect("semaphore mutex poisoned").current
    }

    pub fn max(&self) -> usize {
        self.counts.lock().expect("semaphore mutex poisoned").max
    }
}
