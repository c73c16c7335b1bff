//! In-process cache backend.
//!
//! Entries live in a process-local map. Expiry is enforced both lazily
//! on every read and by a background sweep task, so expired data is
//! never returned and does not accumulate unbounded.

use super::{CacheBackend, CacheError};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

/// Process-local cache backend.
///
/// Per-key atomicity comes from the map's per-entry locking; concurrent
/// `set` calls racing on the same key cannot produce lost updates.
pub struct MemoryCache {
    entries: Arc<DashMap<String, Entry>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl MemoryCache {
    /// Create the backend and start its expiry sweep task.
    #[must_use]
    pub fn new(sweep_interval: Duration) -> Self {
        let entries: Arc<DashMap<String, Entry>> = Arc::new(DashMap::new());

        let sweep_entries = Arc::clone(&entries);
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let before = sweep_entries.len();
                sweep_entries.retain(|_, entry| !entry.is_expired());
                // Concurrent inserts can grow the map mid-sweep
                let swept = before.saturating_sub(sweep_entries.len());
                if swept > 0 {
                    trace!(swept, "Swept expired cache entries");
                }
            }
        });

        Self {
            entries,
            sweeper: Mutex::new(Some(sweeper)),
            stopped: AtomicBool::new(false),
        }
    }

    fn check_stopped(&self) -> Result<(), CacheError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(CacheError::Stopped);
        }
        Ok(())
    }

    /// Number of entries currently stored, expired ones included until
    /// the next sweep or read touches them.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        self.check_stopped()?;
        // Lazy expiry: drop the entry before reading if its ttl passed
        self.entries.remove_if(key, |_, entry| entry.is_expired());
        Ok(self.entries.get(key).map(|entry| entry.value.clone()))
    }

    async fn has(&self, key: &str) -> Result<bool, CacheError> {
        self.check_stopped()?;
        self.entries.remove_if(key, |_, entry| entry.is_expired());
        Ok(self.entries.contains_key(key))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.check_stopped()?;
        let entry = Entry {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.check_stopped()?;
        self.entries.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.check_stopped()?;
        self.entries.clear();
        Ok(())
    }

    async fn stop(&self) -> Result<(), CacheError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(sweeper) = self.sweeper.lock().unwrap().take() {
            sweeper.abort();
        }
        Ok(())
    }
}

impl Drop for MemoryCache {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.lock().unwrap().take() {
            sweeper.abort();
        }
    }
}
