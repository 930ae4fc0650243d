//! Key/value cache with per-entry TTL.
//!
//! The cache is orthogonal to the repository: it memoizes expensive reads
//! when a caller opts in, and callers invalidate keys on writes. Values are
//! stored as JSON so a single cache instance can hold any serializable
//! result.

mod in_memory;
#[cfg(feature = "redis")]
mod redis;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::warn;

use taskhub_core::DomainResult;

pub use in_memory::InMemoryCache;
#[cfg(feature = "redis")]
pub use self::redis::{RedisCache, RedisCacheError};

/// TTLs beyond this are stored without expiry.
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Clamp a requested TTL: anything past [`MAX_TTL`] means "never expires".
pub fn bounded_ttl(ttl: Option<Duration>) -> Option<Duration> {
    ttl.filter(|ttl| *ttl <= MAX_TTL)
}

/// A cached value and its optional expiry. No expiry means "never expires".
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub value: Value,
    pub expires_at: Option<Instant>,
}

impl CacheEntry {
    pub fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: bounded_ttl(ttl).and_then(|ttl| Instant::now().checked_add(ttl)),
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Cache contract.
///
/// Implementations must be safe for concurrent use; `get`, `set` and
/// `delete` are atomic with respect to each other for a given key. An
/// expired entry is a miss.
pub trait Cache: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    fn set(&self, key: &str, value: Value, ttl: Option<Duration>);

    fn delete(&self, key: &str);

    /// Remove every key starting with `prefix`; returns how many were removed.
    fn delete_prefix(&self, prefix: &str) -> usize;
}

impl<T> Cache for Arc<T>
where
    T: Cache + ?Sized,
{
    fn get(&self, key: &str) -> Option<Value> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        (**self).set(key, value, ttl)
    }

    fn delete(&self, key: &str) {
        (**self).delete(key)
    }

    fn delete_prefix(&self, prefix: &str) -> usize {
        (**self).delete_prefix(prefix)
    }
}

/// Typed helpers over any [`Cache`].
pub trait CacheExt: Cache {
    /// Fetch and deserialize. A value of the wrong shape is evicted and
    /// reported as a miss.
    fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key)?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(err) => {
                warn!(key, error = %err, "discarding cache entry with unexpected shape");
                self.delete(key);
                None
            }
        }
    }

    fn set_serialized<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> DomainResult<()> {
        let value = serde_json::to_value(value)?;
        self.set(key, value, ttl);
        Ok(())
    }
}

impl<C: Cache + ?Sized> CacheExt for C {}

/// Derive the cache key for a read: `component:operation:<sha256 of args>`.
///
/// Arguments are hashed in canonical JSON form (object keys sorted), so two
/// logically identical argument sets map to the same key and any change to a
/// value changes it.
pub fn cache_key(component: &str, operation: &str, args: &impl Serialize) -> DomainResult<String> {
    let canonical = canonicalize(serde_json::to_value(args)?);
    let bytes = serde_json::to_vec(&canonical)?;
    let digest = Sha256::digest(&bytes);
    Ok(format!("{component}:{operation}:{digest:x}"))
}

/// Prefix shared by every key of `component`.
pub fn component_prefix(component: &str) -> String {
    format!("{component}:")
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let sorted: Map<String, Value> = entries
                .into_iter()
                .map(|(k, v)| (k, canonicalize(v)))
                .collect();
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn key_ignores_object_key_order() {
        let a = json!({"filters": [{"field": "status", "value": 1}], "skip": 0});
        let b = json!({"skip": 0, "filters": [{"value": 1, "field": "status"}]});
        assert_eq!(
            cache_key("tasks", "get_multi", &a).unwrap(),
            cache_key("tasks", "get_multi", &b).unwrap()
        );
    }

    #[test]
    fn key_is_scoped_by_component_and_operation() {
        let args = json!({"x": 1});
        let key = cache_key("tasks", "count", &args).unwrap();
        assert!(key.starts_with(&component_prefix("tasks")));
        assert!(key.starts_with("tasks:count:"));
        assert_ne!(key, cache_key("users", "count", &args).unwrap());
        assert_ne!(key, cache_key("tasks", "get_multi", &args).unwrap());
    }

    #[test]
    fn oversized_ttl_never_expires() {
        let entry = CacheEntry::new(json!(1), Some(Duration::from_secs(u64::MAX)));
        assert_eq!(entry.expires_at, None);
        assert!(!entry.is_expired(Instant::now()));

        let bounded = CacheEntry::new(json!(1), Some(MAX_TTL));
        assert!(bounded.expires_at.is_some());
        assert_eq!(bounded_ttl(Some(MAX_TTL + Duration::from_secs(1))), None);
    }

    #[test]
    fn typed_helpers_round_trip_and_evict_bad_shapes() {
        let cache = InMemoryCache::new();
        cache.set_serialized("k", &vec![1u32, 2, 3], None).unwrap();
        assert_eq!(cache.get_as::<Vec<u32>>("k"), Some(vec![1, 2, 3]));

        assert_eq!(cache.get_as::<String>("k"), None);
        assert_eq!(cache.get("k"), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: identical arguments give identical keys, and changing a
        /// filter value changes the key.
        #[test]
        fn key_tracks_filter_values(field in "[a-z]{1,8}", a in any::<i64>(), b in any::<i64>()) {
            let args_a = json!({"filters": [{"field": field, "value": a}]});
            let args_b = json!({"filters": [{"field": field, "value": b}]});

            let key_a = cache_key("c", "op", &args_a).unwrap();
            prop_assert_eq!(&key_a, &cache_key("c", "op", &args_a.clone()).unwrap());
            if a != b {
                prop_assert_ne!(key_a, cache_key("c", "op", &args_b).unwrap());
            }
        }
    }
}
