//! Redis-backed lock store (optional).
//!
//! Acquisition is a plain `SET key value NX PX ttl`; release and extend run as
//! Lua scripts so the ownership check and the mutation happen atomically on
//! the server.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{RedisError, Script};

use super::store::{LockStore, LockStoreError};

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Redis lock store.
///
/// Uses a `ConnectionManager`, which reconnects transparently; commands issued
/// while the server is down fail with `LockStoreError::Unavailable`.
#[derive(Clone)]
pub struct RedisLockStore {
    conn: ConnectionManager,
    release: Script,
    extend: Script,
}

impl std::fmt::Debug for RedisLockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLockStore").finish_non_exhaustive()
    }
}

impl RedisLockStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, LockStoreError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| LockStoreError::Configuration(e.to_string()))?;
        let conn = ConnectionManager::new(client).await.map_err(map_redis_error)?;

        Ok(Self {
            conn,
            release: Script::new(RELEASE_SCRIPT),
            extend: Script::new(EXTEND_SCRIPT),
        })
    }
}

fn map_redis_error(e: RedisError) -> LockStoreError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
        LockStoreError::Unavailable(e.to_string())
    } else {
        LockStoreError::Command(e.to_string())
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockStoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, LockStoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, LockStoreError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(deleted == 1)
    }

    async fn expire_if_equals(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockStoreError> {
        let mut conn = self.conn.clone();
        let updated: i64 = self
            .extend
            .key(key)
            .arg(value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(updated == 1)
    }
}
