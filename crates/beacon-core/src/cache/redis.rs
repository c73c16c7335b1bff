//! Shared Redis cache backend.
//!
//! TTL and per-key atomicity are delegated to Redis's native expiry and
//! per-command atomicity; no cross-key transactions are provided. Values
//! are stored as JSON strings.

use super::{CacheBackend, CacheError};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

/// Shared Redis cache backend.
pub struct RedisCache {
    manager: ConnectionManager,
    stopped: AtomicBool,
}

impl RedisCache {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns a [`CacheError`] if the URL is invalid or the server is
    /// unreachable.
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        debug!("Connected Redis cache backend");
        Ok(Self {
            manager,
            stopped: AtomicBool::new(false),
        })
    }

    fn check_stopped(&self) -> Result<(), CacheError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(CacheError::Stopped);
        }
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        self.check_stopped()?;
        let mut conn = self.manager.clone();
        let text: Option<String> = conn.get(key).await?;
        match text {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    async fn has(&self, key: &str) -> Result<bool, CacheError> {
        self.check_stopped()?;
        let mut conn = self.manager.clone();
        Ok(conn.exists(key).await?)
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.check_stopped()?;
        let text = serde_json::to_string(&value)?;
        let mut conn = self.manager.clone();

        match ttl {
            // A zero ttl expires immediately; Redis rejects PX 0, so
            // just make sure the key is absent.
            Some(ttl) if ttl.is_zero() => {
                let _: () = conn.del(key).await?;
            }
            Some(ttl) => {
                let _: () = redis::cmd("SET")
                    .arg(key)
                    .arg(text)
                    .arg("PX")
                    .arg(ttl.as_millis() as u64)
                    .query_async(&mut conn)
                    .await?;
            }
            None => {
                let _: () = conn.set(key, text).await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.check_stopped()?;
        let mut conn = self.manager.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.check_stopped()?;
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("FLUSHDB").query_async(&mut conn).await?;
        Ok(())
    }

    async fn stop(&self) -> Result<(), CacheError> {
        // The pooled connection closes when the manager is dropped
        self.stopped.swap(true, Ordering::SeqCst);
        Ok(())
    }
}
