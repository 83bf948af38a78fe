use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{ShoalError, ShoalResult};

/// TTL applied when `set_array` appends to an existing key
const APPEND_REFRESH_TTL: Duration = Duration::from_secs(15 * 60);
/// Expired entries are swept on this cadence
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// The key/value contract the sticky-session layer consumes.
///
/// Arrays are stored as JSON arrays. `set_array` on an existing key decodes
/// the stored array, appends the new items, re-encodes and refreshes the
/// TTL; a plain `set` would clobber the affinities other services already
/// recorded under the same session.
#[async_trait]
pub trait SessionCache: Send + Sync {
    async fn set_string(&self, key: &str, value: &str, ttl: Option<Duration>) -> ShoalResult<()>;
    async fn get_string(&self, key: &str) -> ShoalResult<Option<String>>;
    async fn exists(&self, key: &str) -> ShoalResult<bool>;
    async fn expire(&self, key: &str, ttl: Duration) -> ShoalResult<bool>;
    async fn ttl(&self, key: &str) -> ShoalResult<Option<Duration>>;
    async fn del(&self, key: &str) -> ShoalResult<u64>;
    async fn set_array(&self, key: &str, items: Vec<Value>, ttl: Option<Duration>)
        -> ShoalResult<()>;
    async fn get_array(&self, key: &str) -> ShoalResult<Vec<Value>>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.expires_at
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }
}

/// In-memory TTL store backing the session cache in a single process.
#[derive(Clone)]
pub struct MemoryCache {
    storage: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            storage: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Spawn the background sweep for expired entries.
    ///
    /// The task exits when the returned shutdown receiver fires.
    pub fn start_cleanup(&self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let storage = Arc::clone(&self.storage);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let mut guard = storage.write().await;
                        let before = guard.len();
                        guard.retain(|_, entry| !entry.is_expired());
                        let evicted = before - guard.len();
                        if evicted > 0 {
                            debug!(evicted, "Evicted expired cache entries");
                        }
                    }
                    _ = shutdown.recv() => return,
                }
            }
        });
    }

    async fn get_live(&self, key: &str) -> Option<CacheEntry> {
        let storage = self.storage.read().await;
        storage.get(key).filter(|e| !e.is_expired()).cloned()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionCache for MemoryCache {
    async fn set_string(&self, key: &str, value: &str, ttl: Option<Duration>) -> ShoalResult<()> {
        let mut storage = self.storage.write().await;
        storage.insert(
            key.to_string(),
            CacheEntry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn get_string(&self, key: &str) -> ShoalResult<Option<String>> {
        Ok(self.get_live(key).await.map(|e| e.value))
    }

    async fn exists(&self, key: &str) -> ShoalResult<bool> {
        Ok(self.get_live(key).await.is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> ShoalResult<bool> {
        let mut storage = self.storage.write().await;
        match storage.get_mut(key) {
            Some(entry) if !entry.is_expired() => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> ShoalResult<Option<Duration>> {
        Ok(self
            .get_live(key)
            .await
            .and_then(|e| e.expires_at)
            .map(|deadline| deadline.saturating_duration_since(Instant::now())))
    }

    async fn del(&self, key: &str) -> ShoalResult<u64> {
        let mut storage = self.storage.write().await;
        Ok(storage.remove(key).map(|_| 1).unwrap_or(0))
    }

    async fn set_array(
        &self,
        key: &str,
        items: Vec<Value>,
        ttl: Option<Duration>,
    ) -> ShoalResult<()> {
        let existing = self.get_live(key).await;

        let (merged, expires_at) = match existing {
            Some(entry) => {
                let mut current: Vec<Value> = serde_json::from_str(&entry.value)
                    .map_err(|e| ShoalError::session_lookup(format!("corrupt array: {}", e)))?;
                current.extend(items);
                (current, Some(Instant::now() + APPEND_REFRESH_TTL))
            }
            None => (items, ttl.map(|t| Instant::now() + t)),
        };

        let encoded = serde_json::to_string(&merged)?;
        let mut storage = self.storage.write().await;
        storage.insert(
            key.to_string(),
            CacheEntry {
                value: encoded,
                expires_at,
            },
        );
        Ok(())
    }

    async fn get_array(&self, key: &str) -> ShoalResult<Vec<Value>> {
        match self.get_live(key).await {
            Some(entry) => serde_json::from_str(&entry.value)
                .map_err(|e| ShoalError::session_lookup(format!("corrupt array: {}", e))),
            None => Ok(Vec::new()),
        }
    }
}
