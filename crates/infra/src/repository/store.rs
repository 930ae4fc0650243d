//! Data-store boundary.
//!
//! The repository does not implement storage. It drives an externally supplied
//! transactional store through these two traits: [`DataStore`] opens
//! transactions, and every read and write goes through a [`StoreTransaction`]
//! that is either committed or rolled back. Rows are JSON objects keyed by
//! table name and the entity id rendered as a string.

use async_trait::async_trait;
use thiserror::Error;

use taskhub_core::{Page, QueryFilter, QuerySort, Row};

pub type StoreResult<T> = Result<T, StoreError>;

/// Failure reported by a backing store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Connection refused/reset, pool exhausted or closed.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store operation timed out: {0}")]
    Timeout(String),

    #[error("unique constraint violated on {table}.{field}")]
    UniqueViolation { table: String, field: String },

    #[error("foreign key violated on {field}: {message}")]
    ForeignKeyViolation { field: String, message: String },

    /// A stored row could not be decoded.
    #[error("corrupt row in {table}: {message}")]
    Corrupt { table: String, message: String },

    /// Anything the store could not classify.
    #[error("store error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }
}

/// A transactional data store.
#[async_trait]
pub trait DataStore: Send + Sync + 'static {
    type Tx: StoreTransaction;

    async fn begin(&self) -> StoreResult<Self::Tx>;
}

/// One open transaction. Dropping it without `commit` discards its writes.
#[async_trait]
pub trait StoreTransaction: Send + 'static {
    async fn get(&mut self, table: &str, id: &str) -> StoreResult<Option<Row>>;

    /// Rows matching every filter, ordered by `sorts` (insertion order when
    /// empty) and windowed by `page`.
    async fn select(
        &mut self,
        table: &str,
        filters: &[QueryFilter],
        sorts: &[QuerySort],
        page: Option<Page>,
    ) -> StoreResult<Vec<Row>>;

    async fn count(&mut self, table: &str, filters: &[QueryFilter]) -> StoreResult<u64>;

    /// Insert a new row. Fails with `UniqueViolation` when `id` or any of
    /// `unique_fields` collides with an existing row.
    async fn insert(&mut self, table: &str, id: &str, row: Row, unique_fields: &[&str]) -> StoreResult<()>;

    /// Replace an existing row; returns false when no row has `id`.
    async fn replace(&mut self, table: &str, id: &str, row: Row, unique_fields: &[&str]) -> StoreResult<bool>;

    /// Remove a row; returns false when no row has `id`.
    async fn remove(&mut self, table: &str, id: &str) -> StoreResult<bool>;

    async fn commit(self) -> StoreResult<()>;

    async fn rollback(self) -> StoreResult<()>;
}

#[async_trait]
impl<S> DataStore for std::sync::Arc<S>
where
    S: DataStore,
{
    type Tx = S::Tx;

    async fn begin(&self) -> StoreResult<Self::Tx> {
        (**self).begin().await
    }
}
