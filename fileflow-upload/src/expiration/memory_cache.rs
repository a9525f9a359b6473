use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fileflow_core::{PeriodicJob, SharedClock, SystemClock};
use fileflow_outbox::BoxStream;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::debug;

use super::{CacheError, CachePort};

struct Entry {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Clock-driven TTL cache.
///
/// Entries are dropped and announced by [`evict_expired`](Self::evict_expired),
/// which the worker runs as a periodic job.
pub struct MemoryTtlCache {
    entries: Mutex<HashMap<String, Entry>>,
    clock: SharedClock,
    expired_tx: broadcast::Sender<String>,
}

impl MemoryTtlCache {
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        let (expired_tx, _) = broadcast::channel(1024);
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            expired_tx,
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let now = self.clock.now();
        self.entries
            .lock()
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.value.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove entries whose TTL has passed and notify subscribers.
    pub fn evict_expired(&self) -> Vec<String> {
        let now = self.clock.now();
        let mut expired: Vec<(DateTime<Utc>, String)> = {
            let mut entries = self.entries.lock();
            let keys: Vec<(DateTime<Utc>, String)> = entries
                .iter()
                .filter(|(_, e)| e.expires_at <= now)
                .map(|(k, e)| (e.expires_at, k.clone()))
                .collect();
            for (_, key) in &keys {
                entries.remove(key);
            }
            keys
        };
        expired.sort();

        let keys: Vec<String> = expired.into_iter().map(|(_, k)| k).collect();
        for key in &keys {
            debug!(key = %key, "Cache entry expired");
            let _ = self.expired_tx.send(key.clone());
        }
        keys
    }
}

impl Default for MemoryTtlCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CachePort for MemoryTtlCache {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| CacheError::Unavailable(e.to_string()))?;
        let expires_at = self.clock.now() + ttl;
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.get(key).is_some())
    }

    async fn subscribe_expirations(&self) -> Result<BoxStream<String>, CacheError> {
        let stream = BroadcastStream::new(self.expired_tx.subscribe()).filter_map(|key| key.ok());
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl PeriodicJob for MemoryTtlCache {
    fn name(&self) -> &'static str {
        "cache-evictor"
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        self.evict_expired();
        Ok(())
    }
}
