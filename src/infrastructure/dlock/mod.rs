//! Distributed locks guarding the per-shard scheduler loops and the
//! singleton background tasks.
//!
//! A lock is owned by whoever wrote its token; refresh and release verify
//! the token so a lock that expired and was re-acquired elsewhere cannot be
//! stolen back.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::Script;

use crate::error::AppError;
use crate::redis::current_time_ms;

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Take the lock. Fails when another owner currently holds it.
    async fn acquire(&self) -> Result<(), AppError>;
    /// Extend the lease. Fails when the lock was lost.
    async fn refresh(&self) -> Result<(), AppError>;
    /// Give the lock up. A lost lock releases cleanly.
    async fn release(&self) -> Result<(), AppError>;
    fn key(&self) -> &str;
}

#[async_trait]
pub trait LockClient: Send + Sync {
    fn new_lock(&self, key: &str, ttl: Duration) -> Arc<dyn DistributedLock>;
}

const REFRESH_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// Redis-backed lock client.
#[derive(Clone)]
pub struct RedisLockClient {
    conn: ConnectionManager,
}

impl RedisLockClient {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl LockClient for RedisLockClient {
    fn new_lock(&self, key: &str, ttl: Duration) -> Arc<dyn DistributedLock> {
        let token: u128 = rand::thread_rng().gen();
        Arc::new(RedisLock {
            conn: self.conn.clone(),
            key: key.to_string(),
            token: format!("{token:032x}"),
            ttl,
        })
    }
}

struct RedisLock {
    conn: ConnectionManager,
    key: String,
    token: String,
    ttl: Duration,
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn acquire(&self) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let acquired: bool = redis::cmd("SET")
            .arg(&self.key)
            .arg(&self.token)
            .arg("NX")
            .arg("PX")
            .arg(self.ttl.as_millis() as u64)
            .query_async::<_, Option<String>>(&mut conn)
            .await?
            .is_some();
        if acquired {
            Ok(())
        } else {
            Err(AppError::LockUnavailable(self.key.clone()))
        }
    }

    async fn refresh(&self) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let refreshed: i64 = Script::new(REFRESH_SCRIPT)
            .key(&self.key)
            .arg(&self.token)
            .arg(self.ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        if refreshed == 1 {
            Ok(())
        } else {
            Err(AppError::LockUnavailable(self.key.clone()))
        }
    }

    async fn release(&self) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let _: i64 = Script::new(RELEASE_SCRIPT)
            .key(&self.key)
            .arg(&self.token)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    fn key(&self) -> &str {
        &self.key
    }
}

/// Process-local lock client. Backs tests and the memory storage mode, where
/// only one process competes.
#[derive(Clone, Default)]
pub struct MemoryLockClient {
    locks: Arc<DashMap<String, MemoryLockEntry>>,
}

#[derive(Clone)]
struct MemoryLockEntry {
    token: u128,
    expires_at_ms: i64,
}

impl MemoryLockClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of currently held (unexpired) locks.
    pub fn held_count(&self) -> usize {
        let now = current_time_ms();
        self.locks
            .iter()
            .filter(|entry| entry.value().expires_at_ms > now)
            .count()
    }

    /// Drop a lock regardless of owner. Test hook for simulating lease loss.
    pub fn force_expire(&self, key: &str) {
        self.locks.remove(key);
    }
}

#[async_trait]
impl LockClient for MemoryLockClient {
    fn new_lock(&self, key: &str, ttl: Duration) -> Arc<dyn DistributedLock> {
        Arc::new(MemoryLock {
            locks: self.locks.clone(),
            key: key.to_string(),
            token: rand::thread_rng().gen(),
            ttl,
        })
    }
}

struct MemoryLock {
    locks: Arc<DashMap<String, MemoryLockEntry>>,
    key: String,
    token: u128,
    ttl: Duration,
}

impl MemoryLock {
    fn fresh_entry(&self) -> MemoryLockEntry {
        MemoryLockEntry {
            token: self.token,
            expires_at_ms: current_time_ms() + self.ttl.as_millis() as i64,
        }
    }
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn acquire(&self) -> Result<(), AppError> {
        let now = current_time_ms();
        let mut acquired = false;
        let entry = self
            .locks
            .entry(self.key.clone())
            .and_modify(|existing| {
                if existing.expires_at_ms <= now || existing.token == self.token {
                    *existing = self.fresh_entry();
                    acquired = true;
                }
            })
            .or_insert_with(|| {
                acquired = true;
                self.fresh_entry()
            });
        drop(entry);
        if acquired {
            Ok(())
        } else {
            Err(AppError::LockUnavailable(self.key.clone()))
        }
    }

    async fn refresh(&self) -> Result<(), AppError> {
        let now = current_time_ms();
        match self.locks.get_mut(&self.key) {
            Some(mut entry) if entry.token == self.token && entry.expires_at_ms > now => {
                entry.expires_at_ms = now + self.ttl.as_millis() as i64;
                Ok(())
            }
            _ => Err(AppError::LockUnavailable(self.key.clone())),
        }
    }

    async fn release(&self) -> Result<(), AppError> {
        self.locks
            .remove_if(&self.key, |_, entry| entry.token == self.token);
        Ok(())
    }

    fn key(&self) -> &str {
        &self.key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_lock_mutual_exclusion() {
        let client = MemoryLockClient::new();
        let a = client.new_lock("job", Duration::from_secs(10));
        let b = client.new_lock("job", Duration::from_secs(10));

        a.acquire().await.unwrap();
        assert!(matches!(
            b.acquire().await,
            Err(AppError::LockUnavailable(_))
        ));

        a.release().await.unwrap();
        b.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn refresh_fails_after_forced_expiry() {
        let client = MemoryLockClient::new();
        let lock = client.new_lock("job", Duration::from_secs(10));
        lock.acquire().await.unwrap();
        lock.refresh().await.unwrap();

        client.force_expire("job");
        assert!(lock.refresh().await.is_err());
    }

    #[tokio::test]
    async fn release_is_owner_scoped() {
        let client = MemoryLockClient::new();
        let a = client.new_lock("job", Duration::from_secs(10));
        let b = client.new_lock("job", Duration::from_secs(10));

        a.acquire().await.unwrap();
        // A release by a non-owner must not free the lock.
        b.release().await.unwrap();
        assert!(b.acquire().await.is_err());
        assert_eq!(client.held_count(), 1);
    }
}
