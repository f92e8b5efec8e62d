//! TTL cache in front of the draft database.
//!
//! Entries expire lazily: an expired entry is dropped by the read that finds
//! it, there is no background sweep.
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub data: V,
    pub timestamp: Instant,
}

impl<V> CacheEntry<V> {
    fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.timestamp) <= ttl
    }
}

#[derive(Debug)]
pub struct DraftCache<V> {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
}

impl<V: Clone> DraftCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the cached value unless it is missing or older than the TTL.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let entry = entries.get(key)?;
        if entry.is_fresh(now, self.ttl) {
            return Some(entry.data.clone());
        }
        entries.remove(key);
        tracing::trace!(key, "cache entry expired");
        None
    }

    pub fn set(&self, key: impl Into<String>, data: V) {
        let key = key.into();
        let entry = CacheEntry {
            key: key.clone(),
            data,
            timestamp: Instant::now(),
        };
        self.entries.lock().insert(key, entry);
    }

    /// Removes every entry whose key contains `pattern`.
    pub fn invalidate(&self, pattern: &str) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| !key.contains(pattern));
        let removed = before - entries.len();
        if removed > 0 {
            tracing::trace!(pattern, removed, "cache invalidated");
        }
        removed
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of stored entries, expired ones included until they are read.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> Default for DraftCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}
