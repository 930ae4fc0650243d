//! Redis-backed cache (shared across processes).
//!
//! TTLs map onto `SET .. PX`. Redis failures never surface to callers: a
//! failed read is a miss and a failed write is dropped, both logged.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use super::{Cache, bounded_ttl};

const DEFAULT_NAMESPACE: &str = "taskhub:cache:";
const SCAN_BATCH: u32 = 200;

#[derive(Debug, thiserror::Error)]
pub enum RedisCacheError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),
}

#[derive(Debug, Clone)]
pub struct RedisCache {
    client: Arc<redis::Client>,
    namespace: String,
}

impl RedisCache {
    /// Open a client for `redis_url` (e.g. "redis://localhost:6379").
    ///
    /// Keys are stored under `namespace` (default `taskhub:cache:`).
    pub fn new(redis_url: impl AsRef<str>, namespace: Option<String>) -> Result<Self, RedisCacheError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisCacheError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            namespace: namespace.unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
        })
    }

    fn connection(&self) -> Result<redis::Connection, RedisCacheError> {
        self.client
            .get_connection()
            .map_err(|e| RedisCacheError::Connection(e.to_string()))
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{key}", self.namespace)
    }

    fn try_get(&self, key: &str) -> Result<Option<Value>, RedisCacheError> {
        let mut conn = self.connection()?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.namespaced(key))
            .query(&mut conn)
            .map_err(|e| RedisCacheError::Command(e.to_string()))?;

        Ok(raw.and_then(|raw| serde_json::from_str(&raw).ok()))
    }

    fn try_set(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<(), RedisCacheError> {
        let mut conn = self.connection()?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.namespaced(key)).arg(value.to_string());
        if let Some(ttl) = bounded_ttl(ttl) {
            // PX 0 is rejected by Redis.
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        cmd.query::<()>(&mut conn)
            .map_err(|e| RedisCacheError::Command(e.to_string()))
    }

    fn try_delete(&self, key: &str) -> Result<(), RedisCacheError> {
        let mut conn = self.connection()?;
        redis::cmd("DEL")
            .arg(self.namespaced(key))
            .query::<()>(&mut conn)
            .map_err(|e| RedisCacheError::Command(e.to_string()))
    }

    fn try_delete_prefix(&self, prefix: &str) -> Result<usize, RedisCacheError> {
        let mut conn = self.connection()?;
        let pattern = format!("{}*", escape_glob(&self.namespaced(prefix)));
        let mut cursor: u64 = 0;
        let mut removed = 0usize;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query(&mut conn)
                .map_err(|e| RedisCacheError::Command(e.to_string()))?;

            if !keys.is_empty() {
                let deleted: usize = redis::cmd("DEL")
                    .arg(&keys)
                    .query(&mut conn)
                    .map_err(|e| RedisCacheError::Command(e.to_string()))?;
                removed += deleted;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(prefix, removed, "deleted cache keys by prefix");
        Ok(removed)
    }
}

impl Cache for RedisCache {
    fn get(&self, key: &str) -> Option<Value> {
        self.try_get(key)
            .inspect_err(|e| warn!(key, error = %e, "cache read failed; treating as miss"))
            .ok()
            .flatten()
    }

    fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        if let Err(e) = self.try_set(key, &value, ttl) {
            warn!(key, error = %e, "cache write failed");
        }
    }

    fn delete(&self, key: &str) {
        if let Err(e) = self.try_delete(key) {
            warn!(key, error = %e, "cache delete failed");
        }
    }

    fn delete_prefix(&self, prefix: &str) -> usize {
        self.try_delete_prefix(prefix)
            .inspect_err(|e| warn!(prefix, error = %e, "cache prefix delete failed"))
            .unwrap_or(0)
    }
}

/// Escape glob metacharacters so a literal prefix can be used with `SCAN MATCH`.
fn escape_glob(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
