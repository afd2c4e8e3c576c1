//! Quota provisioning: writes a tenant's configured monthly allowance into
//! the durable rows and the hot counters. The monthly reset cron that
//! schedules this lives outside the platform; this is the operation it
//! calls.

use std::sync::Arc;

use crate::domain::{BusinessConfig, Channel, Quota};
use crate::error::{AppError, Result};
use crate::repository::{QuotaCache, QuotaStore};

pub struct QuotaService {
    store: Arc<dyn QuotaStore>,
    cache: Arc<dyn QuotaCache>,
}

impl QuotaService {
    pub fn new(store: Arc<dyn QuotaStore>, cache: Arc<dyn QuotaCache>) -> Self {
        Self { store, cache }
    }

    /// Overwrite the tenant's SMS and EMAIL allowances from its quota
    /// config: durable rows first, then the counters the send path reads.
    pub async fn reset_quota(&self, config: &BusinessConfig) -> Result<()> {
        let quota_config = config.quota_config.as_ref().ok_or(AppError::NoQuota {
            biz_id: config.id,
            channel: "ALL".to_string(),
        })?;

        let quotas = [
            Quota {
                biz_id: config.id,
                channel: Channel::Sms,
                quota: quota_config.monthly.sms,
            },
            Quota {
                biz_id: config.id,
                channel: Channel::Email,
                quota: quota_config.monthly.email,
            },
        ];
        self.store.create_or_update(&quotas).await?;
        for quota in quotas {
            self.cache.set(quota).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MonthlyQuota, QuotaConfig};
    use crate::repository::memory::{MemoryQuotaCache, MemoryQuotaStore};

    fn config(quota: Option<QuotaConfig>) -> BusinessConfig {
        BusinessConfig {
            id: 7,
            owner_id: 1,
            owner_type: "organization".into(),
            channel_config: None,
            tx_config: None,
            callback_config: None,
            quota_config: quota,
            rate_limit: 0,
            ctime: 0,
            utime: 0,
        }
    }

    #[tokio::test]
    async fn reset_seeds_rows_and_counters() {
        let store = Arc::new(MemoryQuotaStore::new());
        let cache = Arc::new(MemoryQuotaCache::new());
        let service = QuotaService::new(store.clone(), cache.clone());
        service
            .reset_quota(&config(Some(QuotaConfig {
                monthly: MonthlyQuota {
                    sms: 100,
                    email: 500,
                },
            })))
            .await
            .unwrap();

        assert_eq!(store.find(7, Channel::Sms).await.unwrap().quota, 100);
        assert_eq!(store.find(7, Channel::Email).await.unwrap().quota, 500);
        assert_eq!(cache.get(7, Channel::Sms).await.unwrap().quota, 100);
        assert_eq!(cache.get(7, Channel::Email).await.unwrap().quota, 500);
    }

    #[tokio::test]
    async fn reset_without_quota_config_fails() {
        let store = Arc::new(MemoryQuotaStore::new());
        let cache = Arc::new(MemoryQuotaCache::new());
        let service = QuotaService::new(store, cache);
        assert!(matches!(
            service.reset_quota(&config(None)).await,
            Err(AppError::NoQuota { .. })
        ));
    }
}
