//! Audit capture for repository writes.
//!
//! Updates and deletes read the previous row inside the same transaction as
//! the write, so `old` is exactly the state the write replaced. Records are
//! emitted only after the transaction commits.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use taskhub_core::Row;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::Create => "CREATE",
            AuditAction::Update => "UPDATE",
            AuditAction::Delete => "DELETE",
        }
    }
}

/// One committed change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub entity: String,
    pub entity_id: String,
    pub action: AuditAction,
    pub old: Option<Row>,
    pub new: Option<Row>,
    pub at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(entity: &str, entity_id: impl Into<String>, action: AuditAction, old: Option<Row>, new: Option<Row>) -> Self {
        Self {
            entity: entity.to_string(),
            entity_id: entity_id.into(),
            action,
            old,
            new,
            at: Utc::now(),
        }
    }

    /// Fields whose value differs between `old` and `new`.
    pub fn changed_fields(&self) -> Vec<&str> {
        match (&self.old, &self.new) {
            (Some(old), Some(new)) => {
                let mut fields: Vec<&str> = new
                    .iter()
                    .filter(|(k, v)| old.get(*k) != Some(*v))
                    .map(|(k, _)| k.as_str())
                    .chain(old.keys().filter(|k| !new.contains_key(*k)).map(String::as_str))
                    .collect();
                fields.sort_unstable();
                fields
            }
            (None, Some(row)) | (Some(row), None) => {
                let mut fields: Vec<&str> = row.keys().map(String::as_str).collect();
                fields.sort_unstable();
                fields
            }
            (None, None) => Vec::new(),
        }
    }
}

/// Receives audit records after commit.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}

impl<T> AuditSink for Arc<T>
where
    T: AuditSink + ?Sized,
{
    fn record(&self, record: AuditRecord) {
        (**self).record(record)
    }
}

/// Logs each record through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: AuditRecord) {
        info!(
            entity = %record.entity,
            entity_id = %record.entity_id,
            action = record.action.as_str(),
            changed = ?record.changed_fields(),
            "audit"
        );
    }
}

/// Keeps records in memory; useful for inspection in tests.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: AuditRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }
}
