//! Named mutex backends for the distributed lock.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::errors::ServiceError;

/// Compare-and-delete: only the holder of `token` may release the key.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Sets `key` to `token` if absent (or expired), expiring after `ttl`.
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration)
        -> Result<bool, ServiceError>;

    /// Deletes `key` if it still holds `token`. Returns whether it did.
    async fn release(&self, key: &str, token: &str) -> Result<bool, ServiceError>;

    /// Adds `delta` to the counter at `key` and returns the new value.
    async fn increment(&self, key: &str, delta: i64) -> Result<i64, ServiceError>;
}

#[derive(Debug, Clone)]
struct HeldLock {
    token: String,
    expires_at: Instant,
}

/// Single-process backend. Used in tests and when no Redis is configured.
#[derive(Debug, Default, Clone)]
pub struct InMemoryLockBackend {
    locks: Arc<DashMap<String, HeldLock>>,
    counters: Arc<DashMap<String, i64>>,
}

impl InMemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.locks
            .get(key)
            .map(|held| held.expires_at > Instant::now())
            .unwrap_or(false)
    }
}

#[async_trait]
impl LockBackend for InMemoryLockBackend {
    async fn try_acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, ServiceError> {
        let now = Instant::now();
        let fresh = HeldLock {
            token: token.to_string(),
            expires_at: now + ttl,
        };
        match self.locks.entry(key.to_string()) {
            Entry::Occupied(mut held) => {
                if held.get().expires_at <= now {
                    debug!(key, "Taking over expired lock");
                    held.insert(fresh);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, ServiceError> {
        Ok(self
            .locks
            .remove_if(key, |_, held| held.token == token)
            .is_some())
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64, ServiceError> {
        let mut value = self.counters.entry(key.to_string()).or_insert(0);
        *value += delta;
        Ok(*value)
    }
}

/// Redis backend: `SET NX PX` to acquire, a token-checked script to release
/// and `INCRBY` for counters. Works across processes.
#[derive(Clone)]
pub struct RedisLockBackend {
    conn: ConnectionManager,
    namespace: String,
}

impl RedisLockBackend {
    pub async fn connect(redis_url: &str, namespace: &str) -> Result<Self, ServiceError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(namespace, "Connected redis lock backend");
        Ok(Self {
            conn,
            namespace: namespace.to_string(),
        })
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }
}

#[async_trait]
impl LockBackend for RedisLockBackend {
    async fn try_acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, ServiceError> {
        let mut conn = self.conn.clone();
        let ttl_ms = ttl.as_millis().max(1) as u64;
        let result: Option<String> = redis::cmd("SET")
            .arg(self.namespaced(key))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(result.is_some())
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, ServiceError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(self.namespaced(key))
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64, ServiceError> {
        let mut conn = self.conn.clone();
        let value: i64 = redis::cmd("INCRBY")
            .arg(self.namespaced(key))
            .arg(delta)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }
}
