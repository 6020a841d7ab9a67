use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use scan_core::CoreError;
use scan_core::CoreResult;
use tracing::warn;

use crate::KeyValueStore;

/// Redis-backed [`KeyValueStore`]. Uses `ConnectionManager` so transient
/// disconnects are retried transparently by the client rather than bubbling
/// up on every call.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`).
    ///
    /// # Errors
    /// Returns [`CoreError::KvUnavailable`] if the client can't be
    /// constructed or the initial connection fails.
    pub async fn connect(url: &str) -> CoreResult<Self> {
        let client = redis::Client::open(url).map_err(|e| CoreError::KvUnavailable(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| CoreError::KvUnavailable(e.to_string()))?;
        Ok(Self { conn })
    }

    fn map_err(e: redis::RedisError) -> CoreError {
        warn!(error = %e, "redis operation failed");
        CoreError::KvUnavailable(e.to_string())
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> CoreResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(Self::map_err)
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await.map_err(Self::map_err)
    }

    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await
            .map_err(Self::map_err)
    }

    async fn delete(&self, key: &str) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await.map_err(Self::map_err)
    }

    async fn exists(&self, key: &str) -> CoreResult<bool> {
        let mut conn = self.conn.clone();
        conn.exists(key).await.map_err(Self::map_err)
    }

    async fn list_append(&self, key: &str, value: Vec<u8>) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(key, value).await.map_err(Self::map_err)
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> CoreResult<Vec<Vec<u8>>> {
        let mut conn = self.conn.clone();
        conn.lrange(key, start as i64, stop as i64).await.map_err(Self::map_err)
    }

    async fn list_trim(&self, key: &str, start: isize, stop: isize) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        conn.ltrim::<_, ()>(key, start as i64, stop as i64).await.map_err(Self::map_err)
    }

    async fn list_len(&self, key: &str) -> CoreResult<usize> {
        let mut conn = self.conn.clone();
        conn.llen(key).await.map_err(Self::map_err)
    }

    async fn set_add(&self, key: &str, member: &str) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(key, member).await.map_err(Self::map_err)
    }

    async fn set_members(&self, key: &str) -> CoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.smembers(key).await.map_err(Self::map_err)
    }

    async fn scan_keys(&self, pattern: &str) -> CoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.keys(pattern).await.map_err(Self::map_err)
    }
}
