//! Round-robin selector with per-provider health tracking.
//!
//! Every provider is wrapped with a sliding window of success/failure bits
//! over packed atomic words. Crossing the failure threshold flips the
//! provider unhealthy; a timer clears the window and restores it a minute
//! later. `next` scans from a shared rotating cursor and returns the first
//! healthy provider.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{Notification, SendReceipt};
use crate::error::Result;

use super::{exhausted_error, Provider, Selector, SelectorBuilder};

const DEFAULT_BUFFER_WORDS: usize = 1;
const DEFAULT_FAIL_PERCENT: f64 = 0.1;
const DEFAULT_RECOVERY: Duration = Duration::from_secs(60);
const BITS_PER_WORD: u64 = 64;

/// A provider plus its failure window and health flag.
pub struct HealthTrackedProvider {
    inner: Arc<dyn Provider>,
    healthy: Arc<AtomicBool>,
    bits: Arc<[AtomicU64]>,
    req_count: AtomicU64,
    bit_count: u64,
    fail_threshold: u64,
    recovery: Duration,
}

impl HealthTrackedProvider {
    pub fn new(inner: Arc<dyn Provider>, buffer_words: usize) -> Self {
        Self::with_recovery(inner, buffer_words, DEFAULT_RECOVERY)
    }

    pub fn with_recovery(
        inner: Arc<dyn Provider>,
        buffer_words: usize,
        recovery: Duration,
    ) -> Self {
        let buffer_words = buffer_words.max(DEFAULT_BUFFER_WORDS);
        let bit_count = buffer_words as u64 * BITS_PER_WORD;
        let bits: Arc<[AtomicU64]> = (0..buffer_words)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into();
        Self {
            inner,
            healthy: Arc::new(AtomicBool::new(true)),
            bits,
            req_count: AtomicU64::new(0),
            bit_count,
            fail_threshold: (bit_count as f64 * DEFAULT_FAIL_PERCENT) as u64,
            recovery,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    fn record(&self, failed: bool) {
        let pos = self.req_count.fetch_add(1, Ordering::Relaxed) % self.bit_count;
        let word = (pos / BITS_PER_WORD) as usize;
        let mask = 1u64 << (pos % BITS_PER_WORD);
        if failed {
            self.bits[word].fetch_or(mask, Ordering::Relaxed);
        } else {
            self.bits[word].fetch_and(!mask, Ordering::Relaxed);
        }
    }

    fn failure_count(&self) -> u64 {
        self.bits
            .iter()
            .map(|word| word.load(Ordering::Relaxed).count_ones() as u64)
            .sum()
    }

    fn maybe_trip(&self) {
        if self.failure_count() <= self.fail_threshold {
            return;
        }
        if self
            .healthy
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        tracing::warn!(provider = %self.inner.name(), "provider marked unhealthy");

        let healthy = self.healthy.clone();
        let bits = self.bits.clone();
        let recovery = self.recovery;
        let name = self.inner.name().to_string();
        tokio::spawn(async move {
            tokio::time::sleep(recovery).await;
            for word in bits.iter() {
                word.store(0, Ordering::Relaxed);
            }
            healthy.store(true, Ordering::Release);
            tracing::info!(provider = %name, "provider restored to healthy");
        });
    }
}

#[async_trait]
impl Provider for HealthTrackedProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn send(&self, notification: &Notification) -> Result<SendReceipt> {
        let result = self.inner.send(notification).await;
        match &result {
            Ok(_) => self.record(false),
            Err(_) => {
                self.record(true);
                self.maybe_trip();
            }
        }
        result
    }
}

/// Builder sharing one rotating cursor across all sends, so load spreads
/// evenly over healthy providers.
pub struct RoundRobinSelectorBuilder {
    providers: Arc<[Arc<HealthTrackedProvider>]>,
    cursor: AtomicU64,
}

impl RoundRobinSelectorBuilder {
    pub fn new(providers: Vec<Arc<dyn Provider>>, buffer_words: usize) -> Self {
        let wrapped: Vec<Arc<HealthTrackedProvider>> = providers
            .into_iter()
            .map(|p| Arc::new(HealthTrackedProvider::new(p, buffer_words)))
            .collect();
        Self {
            providers: wrapped.into(),
            cursor: AtomicU64::new(0),
        }
    }

    pub fn from_tracked(providers: Vec<Arc<HealthTrackedProvider>>) -> Self {
        Self {
            providers: providers.into(),
            cursor: AtomicU64::new(0),
        }
    }
}

impl SelectorBuilder for RoundRobinSelectorBuilder {
    fn build(&self) -> Box<dyn Selector> {
        Box::new(RoundRobinSelector {
            providers: self.providers.clone(),
            start: self.cursor.fetch_add(1, Ordering::Relaxed) as usize,
            scanned: 0,
        })
    }
}

struct RoundRobinSelector {
    providers: Arc<[Arc<HealthTrackedProvider>]>,
    start: usize,
    scanned: usize,
}

#[async_trait]
impl Selector for RoundRobinSelector {
    async fn next(&mut self, _notification: &Notification) -> Result<Arc<dyn Provider>> {
        let len = self.providers.len();
        while self.scanned < len {
            let idx = (self.start + self.scanned) % len;
            self.scanned += 1;
            let provider = &self.providers[idx];
            if provider.is_healthy() {
                return Ok(provider.clone() as Arc<dyn Provider>);
            }
        }
        Err(exhausted_error())
    }
}
