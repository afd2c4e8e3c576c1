//! Redis-backed quota counters.
//!
//! Decrements run as Lua scripts so the balance check and the movement are
//! one atomic step; the batched variants check every key before touching
//! any of them.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use crate::domain::{Channel, Quota};
use crate::error::{AppError, Result};
use crate::metrics::QUOTA_REJECTED_TOTAL;

use super::{QuotaCache, QuotaDelta};

const DECR_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local amount = tonumber(ARGV[1])
if current < amount then
    return -1
end
return redis.call('DECRBY', KEYS[1], amount)
"#;

const MULTI_DECR_SCRIPT: &str = r#"
for i, key in ipairs(KEYS) do
    local current = tonumber(redis.call('GET', key) or '0')
    if current < tonumber(ARGV[i]) then
        return key
    end
end
for i, key in ipairs(KEYS) do
    redis.call('DECRBY', key, ARGV[i])
end
return ''
"#;

const MULTI_INCR_SCRIPT: &str = r#"
for i, key in ipairs(KEYS) do
    redis.call('INCRBY', key, ARGV[i])
end
return ''
"#;

pub struct RedisQuotaCache {
    conn: ConnectionManager,
}

impl RedisQuotaCache {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn key(biz_id: i64, channel: Channel) -> String {
        format!("quota:{biz_id}:{channel}")
    }
}

#[async_trait]
impl QuotaCache for RedisQuotaCache {
    async fn decr(&self, biz_id: i64, channel: Channel, amount: i32) -> Result<()> {
        let mut conn = self.conn.clone();
        let remaining: i64 = Script::new(DECR_SCRIPT)
            .key(Self::key(biz_id, channel))
            .arg(amount)
            .invoke_async(&mut conn)
            .await?;
        if remaining < 0 {
            QUOTA_REJECTED_TOTAL.inc();
            tracing::warn!(biz_id, channel = %channel, "quota exhausted");
            return Err(AppError::NoQuota {
                biz_id,
                channel: channel.as_str().to_string(),
            });
        }
        Ok(())
    }

    async fn incr(&self, biz_id: i64, channel: Channel, amount: i32) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.incr(Self::key(biz_id, channel), amount as i64).await?;
        Ok(())
    }

    async fn multi_decr(&self, items: &[QuotaDelta]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let script = Script::new(MULTI_DECR_SCRIPT);
        let mut invocation = script.prepare_invoke();
        for item in items {
            invocation.key(Self::key(item.biz_id, item.channel));
            invocation.arg(item.amount);
        }
        let failed_key: String = invocation.invoke_async(&mut conn).await?;
        if !failed_key.is_empty() {
            QUOTA_REJECTED_TOTAL.inc();
            tracing::warn!(key = %failed_key, "batched quota decrement rejected");
            let item = items
                .iter()
                .find(|i| Self::key(i.biz_id, i.channel) == failed_key);
            return Err(match item {
                Some(item) => AppError::NoQuota {
                    biz_id: item.biz_id,
                    channel: item.channel.as_str().to_string(),
                },
                None => AppError::Internal(format!("quota rejection on unknown key {failed_key}")),
            });
        }
        Ok(())
    }

    async fn multi_incr(&self, items: &[QuotaDelta]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let script = Script::new(MULTI_INCR_SCRIPT);
        let mut invocation = script.prepare_invoke();
        for item in items {
            invocation.key(Self::key(item.biz_id, item.channel));
            invocation.arg(item.amount);
        }
        let _: String = invocation.invoke_async(&mut conn).await?;
        Ok(())
    }

    async fn set(&self, quota: Quota) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set(Self::key(quota.biz_id, quota.channel), quota.quota as i64)
            .await?;
        Ok(())
    }

    async fn get(&self, biz_id: i64, channel: Channel) -> Result<Quota> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = conn.get(Self::key(biz_id, channel)).await?;
        Ok(Quota {
            biz_id,
            channel,
            quota: value.unwrap_or(0) as i32,
        })
    }
}
