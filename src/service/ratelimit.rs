//! Per-tenant request rate limiting.
//!
//! One token bucket per biz id, refilled at the tenant's configured rate.
//! A zero rate limit disables limiting for that tenant.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{AppError, Result};
use crate::redis::current_time_ms;
use crate::repository::BusinessConfigService;

/// Lock-free token bucket. Tokens refill continuously up to capacity.
#[derive(Debug)]
pub struct TokenBucket {
    tokens: AtomicU32,
    last_refill: AtomicI64,
    capacity: u32,
    refill_rate: u32,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_rate: u32) -> Self {
        Self {
            tokens: AtomicU32::new(capacity),
            last_refill: AtomicI64::new(current_time_ms()),
            capacity,
            refill_rate,
        }
    }

    /// Take one token if available.
    pub fn try_consume(&self) -> bool {
        let now = current_time_ms();
        let last = self.last_refill.load(Ordering::Relaxed);
        let elapsed_ms = (now - last).max(0) as u64;
        let tokens_to_add = (elapsed_ms * self.refill_rate as u64 / 1_000) as u32;

        loop {
            let current = self.tokens.load(Ordering::Relaxed);
            let refilled = current.saturating_add(tokens_to_add).min(self.capacity);
            if refilled == 0 {
                return false;
            }
            let new_value = refilled - 1;
            if self
                .tokens
                .compare_exchange_weak(current, new_value, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                if tokens_to_add > 0 {
                    self.last_refill.store(now, Ordering::Relaxed);
                }
                return true;
            }
        }
    }

    pub fn available(&self) -> u32 {
        let now = current_time_ms();
        let last = self.last_refill.load(Ordering::Relaxed);
        let elapsed_ms = (now - last).max(0) as u64;
        let tokens_to_add = (elapsed_ms * self.refill_rate as u64 / 1_000) as u32;
        self.tokens
            .load(Ordering::Relaxed)
            .saturating_add(tokens_to_add)
            .min(self.capacity)
    }
}

pub struct TenantRateLimiter {
    config: Arc<dyn BusinessConfigService>,
    buckets: DashMap<i64, Arc<TokenBucket>>,
}

impl TenantRateLimiter {
    pub fn new(config: Arc<dyn BusinessConfigService>) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    /// Admit or reject one request for the tenant.
    pub async fn check(&self, biz_id: i64) -> Result<()> {
        let rate = match self.config.get_by_id(biz_id).await {
            Ok(config) => config.rate_limit,
            // Unknown tenants fail later on their missing config; don't
            // rate-limit them here.
            Err(_) => return Ok(()),
        };
        if rate == 0 {
            return Ok(());
        }

        let bucket = self
            .buckets
            .entry(biz_id)
            .or_insert_with(|| Arc::new(TokenBucket::new(rate, rate)))
            .clone();
        if bucket.try_consume() {
            Ok(())
        } else {
            Err(AppError::RateLimited(biz_id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BusinessConfig;
    use crate::repository::memory::MemoryBusinessConfigStore;
    use crate::repository::{BusinessConfigStore, CachedBusinessConfigService};

    #[test]
    fn bucket_exhausts_and_reports() {
        let bucket = TokenBucket::new(3, 1);
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());
        assert_eq!(bucket.available(), 0);
    }

    #[tokio::test]
    async fn limiter_enforces_tenant_rate() {
        let store = Arc::new(MemoryBusinessConfigStore::new());
        store
            .save(&BusinessConfig {
                id: 7,
                owner_id: 1,
                owner_type: "organization".into(),
                channel_config: None,
                tx_config: None,
                callback_config: None,
                quota_config: None,
                rate_limit: 2,
                ctime: 0,
                utime: 0,
            })
            .await
            .unwrap();
        let config = Arc::new(CachedBusinessConfigService::new(store, None));
        let limiter = TenantRateLimiter::new(config);

        assert!(limiter.check(7).await.is_ok());
        assert!(limiter.check(7).await.is_ok());
        assert!(matches!(
            limiter.check(7).await,
            Err(AppError::RateLimited(7))
        ));
    }

    #[tokio::test]
    async fn zero_rate_disables_limiting() {
        let store = Arc::new(MemoryBusinessConfigStore::new());
        store
            .save(&BusinessConfig {
                id: 8,
                owner_id: 1,
                owner_type: "person".into(),
                channel_config: None,
                tx_config: None,
                callback_config: None,
                quota_config: None,
                rate_limit: 0,
                ctime: 0,
                utime: 0,
            })
            .await
            .unwrap();
        let config = Arc::new(CachedBusinessConfigService::new(store, None));
        let limiter = TenantRateLimiter::new(config);
        for _ in 0..50 {
            assert!(limiter.check(8).await.is_ok());
        }
    }
}
