//! In-memory transactional store.
//!
//! A transaction works on a private snapshot taken at `begin`. On commit its
//! writes are replayed onto the live tables with uniqueness re-checked, and
//! the result is swapped in atomically: either every write lands or none do.
//! Intended for tests and embedded use; every commit copies the tables.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use taskhub_core::query::evaluate;
use taskhub_core::value::values_equal;
use taskhub_core::{Page, QueryFilter, QuerySort, Row};

use super::store::{DataStore, StoreError, StoreResult, StoreTransaction};

#[derive(Debug, Clone)]
struct StoredRow {
    seq: u64,
    row: Row,
}

#[derive(Debug, Clone, Default)]
struct Table {
    rows: HashMap<String, StoredRow>,
    next_seq: u64,
}

impl Table {
    /// Rows in insertion order.
    fn ordered_rows(&self) -> Vec<Row> {
        let mut stored: Vec<&StoredRow> = self.rows.values().collect();
        stored.sort_by_key(|s| s.seq);
        stored.into_iter().map(|s| s.row.clone()).collect()
    }

    fn check_unique(&self, table: &str, id: &str, row: &Row, unique_fields: &[String]) -> StoreResult<()> {
        for field in unique_fields {
            let Some(value) = row.get(field).filter(|v| !v.is_null()) else {
                continue;
            };
            let clash = self
                .rows
                .iter()
                .any(|(other_id, other)| other_id != id && other.row.get(field).is_some_and(|v| values_equal(v, value)));
            if clash {
                return Err(StoreError::UniqueViolation {
                    table: table.to_string(),
                    field: field.clone(),
                });
            }
        }
        Ok(())
    }

    fn apply(&mut self, table: &str, op: &WriteOp) -> StoreResult<bool> {
        match op {
            WriteOp::Insert { id, row, unique_fields, .. } => {
                if self.rows.contains_key(id) {
                    return Err(StoreError::UniqueViolation {
                        table: table.to_string(),
                        field: "id".to_string(),
                    });
                }
                self.check_unique(table, id, row, unique_fields)?;
                let seq = self.next_seq;
                self.next_seq += 1;
                self.rows.insert(id.clone(), StoredRow { seq, row: row.clone() });
                Ok(true)
            }
            WriteOp::Replace { id, row, unique_fields, .. } => {
                if !self.rows.contains_key(id) {
                    return Ok(false);
                }
                self.check_unique(table, id, row, unique_fields)?;
                if let Some(stored) = self.rows.get_mut(id) {
                    stored.row = row.clone();
                }
                Ok(true)
            }
            WriteOp::Remove { id, .. } => Ok(self.rows.remove(id).is_some()),
        }
    }
}

type Tables = HashMap<String, Table>;

#[derive(Debug, Clone)]
enum WriteOp {
    Insert {
        table: String,
        id: String,
        row: Row,
        unique_fields: Vec<String>,
    },
    Replace {
        table: String,
        id: String,
        row: Row,
        unique_fields: Vec<String>,
    },
    Remove {
        table: String,
        id: String,
    },
}

impl WriteOp {
    fn table(&self) -> &str {
        match self {
            WriteOp::Insert { table, .. } | WriteOp::Replace { table, .. } | WriteOp::Remove { table, .. } => table,
        }
    }
}

/// Transaction counters, for asserting transaction scope in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub begun: u64,
    pub committed: u64,
    pub rolled_back: u64,
}

#[derive(Debug, Default)]
struct Inner {
    tables: Mutex<Tables>,
    faults: Mutex<VecDeque<StoreError>>,
    begun: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
}

impl Inner {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_fault(&self) -> StoreResult<()> {
        let fault = self
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match fault {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Shared handle to an in-memory store. Clones see the same data.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue errors to be returned by the next store calls, one per call.
    pub fn inject_faults(&self, faults: impl IntoIterator<Item = StoreError>) {
        self.inner
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(faults);
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            begun: self.inner.begun.load(Ordering::SeqCst),
            committed: self.inner.committed.load(Ordering::SeqCst),
            rolled_back: self.inner.rolled_back.load(Ordering::SeqCst),
        }
    }

    /// Committed row count of `table`.
    pub fn row_count(&self, table: &str) -> usize {
        self.inner.tables().get(table).map_or(0, |t| t.rows.len())
    }
}

#[async_trait]
impl DataStore for InMemoryStore {
    type Tx = InMemoryTransaction;

    async fn begin(&self) -> StoreResult<InMemoryTransaction> {
        self.inner.take_fault()?;
        self.inner.begun.fetch_add(1, Ordering::SeqCst);
        let snapshot = self.inner.tables().clone();
        Ok(InMemoryTransaction {
            inner: self.inner.clone(),
            snapshot,
            writes: Vec::new(),
        })
    }
}

/// An open transaction over an [`InMemoryStore`].
#[derive(Debug)]
pub struct InMemoryTransaction {
    inner: Arc<Inner>,
    snapshot: Tables,
    writes: Vec<WriteOp>,
}

impl InMemoryTransaction {
    fn write(&mut self, op: WriteOp) -> StoreResult<bool> {
        let table = self.snapshot.entry(op.table().to_string()).or_default();
        let applied = table.apply(op.table(), &op)?;
        if applied {
            self.writes.push(op);
        }
        Ok(applied)
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn get(&mut self, table: &str, id: &str) -> StoreResult<Option<Row>> {
        self.inner.take_fault()?;
        Ok(self
            .snapshot
            .get(table)
            .and_then(|t| t.rows.get(id))
            .map(|stored| stored.row.clone()))
    }

    async fn select(
        &mut self,
        table: &str,
        filters: &[QueryFilter],
        sorts: &[QuerySort],
        page: Option<Page>,
    ) -> StoreResult<Vec<Row>> {
        self.inner.take_fault()?;
        let rows = self.snapshot.get(table).map(Table::ordered_rows).unwrap_or_default();
        Ok(evaluate(rows, filters, sorts, page))
    }

    async fn count(&mut self, table: &str, filters: &[QueryFilter]) -> StoreResult<u64> {
        self.inner.take_fault()?;
        let count = self.snapshot.get(table).map_or(0, |t| {
            t.rows
                .values()
                .filter(|stored| filters.iter().all(|f| f.matches(&stored.row)))
                .count()
        });
        Ok(count as u64)
    }

    async fn insert(&mut self, table: &str, id: &str, row: Row, unique_fields: &[&str]) -> StoreResult<()> {
        self.inner.take_fault()?;
        self.write(WriteOp::Insert {
            table: table.to_string(),
            id: id.to_string(),
            row,
            unique_fields: unique_fields.iter().map(|f| f.to_string()).collect(),
        })
        .map(|_| ())
    }

    async fn replace(&mut self, table: &str, id: &str, row: Row, unique_fields: &[&str]) -> StoreResult<bool> {
        self.inner.take_fault()?;
        self.write(WriteOp::Replace {
            table: table.to_string(),
            id: id.to_string(),
            row,
            unique_fields: unique_fields.iter().map(|f| f.to_string()).collect(),
        })
    }

    async fn remove(&mut self, table: &str, id: &str) -> StoreResult<bool> {
        self.inner.take_fault()?;
        self.write(WriteOp::Remove {
            table: table.to_string(),
            id: id.to_string(),
        })
    }

    async fn commit(self) -> StoreResult<()> {
        self.inner.take_fault()?;
        let mut live = self.inner.tables();
        let mut next = live.clone();
        for op in &self.writes {
            next.entry(op.table().to_string())
                .or_default()
                .apply(op.table(), op)?;
        }
        *live = next;
        drop(live);

        self.inner.committed.fetch_add(1, Ordering::SeqCst);
        debug!(writes = self.writes.len(), "in-memory transaction committed");
        Ok(())
    }

    async fn rollback(self) -> StoreResult<()> {
        self.inner.rolled_back.fetch_add(1, Ordering::SeqCst);
        debug!(discarded = self.writes.len(), "in-memory transaction rolled back");
        Ok(())
    }
}
