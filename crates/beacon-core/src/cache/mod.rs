//! Ephemeral key/value cache for Beacon handlers.
//!
//! A uniform TTL'd key/value contract over two backends: an in-process
//! map and a shared Redis store. Which backend runs is a process-wide
//! startup decision made once through [`build_cache`]; the resulting
//! handle is shared by dependency injection (at most one active cache
//! per process, since handlers assume a single namespace).

mod memory;
mod redis;

pub use memory::MemoryCache;
pub use redis::RedisCache;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Cache errors.
///
/// Surfaced to the calling handler, which decides whether to degrade
/// gracefully (e.g. recompute without caching) or propagate.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The backend refused or failed the operation.
    #[error("Cache backend error: {0}")]
    Backend(String),

    /// A value could not be (de)serialized.
    #[error("Cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The cache has been stopped.
    #[error("Cache stopped")]
    Stopped,
}

impl From<::redis::RedisError> for CacheError {
    fn from(error: ::redis::RedisError) -> Self {
        CacheError::Backend(error.to_string())
    }
}

/// The uniform backend contract.
///
/// An expired key behaves as absent to every read operation, regardless
/// of backend. `set` without a ttl means no expiry. Mutations are atomic
/// per key; no cross-key transactions are provided.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Read a value, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError>;

    /// Whether a live (non-expired) value exists for the key.
    async fn has(&self, key: &str) -> Result<bool, CacheError>;

    /// Store a value, overwriting any existing one.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Remove a key. Removing an absent key is a no-op.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Remove every key.
    async fn clear(&self) -> Result<(), CacheError>;

    /// Release backend resources (sweep tasks, pooled connections).
    async fn stop(&self) -> Result<(), CacheError>;
}

/// The process-wide cache handle. Cheap to clone.
#[derive(Clone)]
pub struct Cache {
    backend: Arc<dyn CacheBackend>,
}

impl Cache {
    /// Wrap a backend.
    #[must_use]
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    /// Read a raw value.
    ///
    /// # Errors
    ///
    /// Returns a [`CacheError`] if the backend fails.
    pub async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        self.backend.get(key).await
    }

    /// Read and deserialize a value.
    ///
    /// # Errors
    ///
    /// Returns a [`CacheError`] if the backend fails or the stored value
    /// does not deserialize to `T`.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.backend.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Whether a live value exists for the key.
    ///
    /// # Errors
    ///
    /// Returns a [`CacheError`] if the backend fails.
    pub async fn has(&self, key: &str) -> Result<bool, CacheError> {
        self.backend.has(key).await
    }

    /// Store a raw value. `ttl: None` means no expiry.
    ///
    /// # Errors
    ///
    /// Returns a [`CacheError`] if the backend fails.
    pub async fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        self.backend.set(key, value, ttl).await
    }

    /// Serialize and store a value.
    ///
    /// # Errors
    ///
    /// Returns a [`CacheError`] if serialization or the backend fails.
    pub async fn set_as<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        self.backend
            .set(key, serde_json::to_value(value)?, ttl)
            .await
    }

    /// Remove a key.
    ///
    /// # Errors
    ///
    /// Returns a [`CacheError`] if the backend fails.
    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.backend.delete(key).await
    }

    /// Remove every key.
    ///
    /// # Errors
    ///
    /// Returns a [`CacheError`] if the backend fails.
    pub async fn clear(&self) -> Result<(), CacheError> {
        self.backend.clear().await
    }

    /// Release backend resources.
    ///
    /// # Errors
    ///
    /// Returns a [`CacheError`] if the backend fails to shut down.
    pub async fn stop(&self) -> Result<(), CacheError> {
        self.backend.stop().await
    }
}

/// Backend selection, decided once at process startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum CacheConfig {
    /// Process-local map with a background expiry sweep.
    Memory {
        /// How often the sweep removes expired entries, in milliseconds.
        #[serde(default = "default_sweep_interval_ms")]
        sweep_interval_ms: u64,
    },
    /// Shared Redis store; TTL and per-key atomicity are delegated to
    /// Redis itself.
    Redis {
        /// Redis connection URL.
        url: String,
    },
}

fn default_sweep_interval_ms() -> u64 {
    30_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig::Memory {
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

/// Build the process-wide cache from configuration.
///
/// Invoked exactly once at startup; components receive the returned
/// handle by dependency injection.
///
/// # Errors
///
/// Returns a [`CacheError`] if the backend cannot be reached.
pub async fn build_cache(config: &CacheConfig) -> Result<Cache, CacheError> {
    match config {
        CacheConfig::Memory { sweep_interval_ms } => {
            info!(sweep_interval_ms = *sweep_interval_ms, "Using in-process cache");
            Ok(Cache::new(Arc::new(MemoryCache::new(Duration::from_millis(
                *sweep_interval_ms,
            )))))
        }
        CacheConfig::Redis { url } => {
            info!("Using shared Redis cache");
            let backend = RedisCache::connect(url).await?;
            Ok(Cache::new(Arc::new(backend)))
        }
    }
}
