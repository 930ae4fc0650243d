//! Repository layer: a generic query executor over a transactional data store.

pub mod audit;
mod error;
mod executor;
pub mod in_memory;
pub mod postgres;
pub mod store;

pub use audit::{AuditAction, AuditRecord, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use error::{RepositoryError, RepositoryResult};
pub use executor::{BoxFuture, Repository};
pub use in_memory::{InMemoryStore, InMemoryTransaction, StoreStats};
pub use postgres::{PostgresStore, PostgresTransaction};
pub use store::{DataStore, StoreError, StoreResult, StoreTransaction};
