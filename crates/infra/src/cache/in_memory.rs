use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::debug;

use super::{Cache, CacheEntry};

/// Process-local cache behind a single mutex.
///
/// Expired entries are evicted lazily on lookup; [`purge_expired`](Self::purge_expired)
/// sweeps them eagerly for callers that want bounded memory.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove every expired entry; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let purged = before - entries.len();
        if purged > 0 {
            debug!(purged, "purged expired cache entries");
        }
        purged
    }

    /// Number of stored entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl Cache for InMemoryCache {
    fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.lock();
        let entry = entries.get(key)?;
        if entry.is_expired(Instant::now()) {
            entries.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        self.lock().insert(key.to_string(), CacheEntry::new(value, ttl));
    }

    fn delete(&self, key: &str) {
        self.lock().remove(key);
    }

    fn delete_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn set_then_get_returns_value() {
        let cache = InMemoryCache::new();
        cache.set("a", json!({"n": 1}), Some(Duration::from_secs(60)));
        assert_eq!(cache.get("a"), Some(json!({"n": 1})));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn entry_expires_after_ttl_and_is_evicted() {
        let cache = InMemoryCache::new();
        cache.set("short", json!(1), Some(Duration::from_millis(20)));
        cache.set("forever", json!(2), None);
        assert_eq!(cache.get("short"), Some(json!(1)));

        thread::sleep(Duration::from_millis(40));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("short"), None);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("forever"), Some(json!(2)));
    }

    #[test]
    fn purge_removes_only_expired() {
        let cache = InMemoryCache::new();
        cache.set("gone", json!(1), Some(Duration::ZERO));
        cache.set("kept", json!(2), Some(Duration::from_secs(60)));

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn huge_ttl_is_stored_without_expiry() {
        let cache = InMemoryCache::new();
        cache.set("k", json!(1), Some(Duration::from_secs(u64::MAX)));

        assert_eq!(cache.get("k"), Some(json!(1)));
        assert_eq!(cache.purge_expired(), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn delete_and_delete_prefix() {
        let cache = InMemoryCache::new();
        cache.set("tasks:get_multi:1", json!(1), None);
        cache.set("tasks:count:2", json!(2), None);
        cache.set("users:count:3", json!(3), None);

        cache.delete("users:count:3");
        assert_eq!(cache.get("users:count:3"), None);

        assert_eq!(cache.delete_prefix("tasks:"), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn concurrent_writers_do_not_lose_keys() {
        let cache = Arc::new(InMemoryCache::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = cache.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        cache.set(&format!("{t}:{i}"), json!(i), None);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 800);
    }
}
