//! `taskhub-core`: storage-agnostic building blocks.
//!
//! This crate contains **pure** primitives (no IO): identifiers, the entity
//! schema trait, query specifications and the value ordering they rely on.

pub mod entity;
pub mod error;
pub mod id;
pub mod query;
pub mod value;

pub use entity::{Cardinality, Entity, Patch, Relation, Row};
pub use error::{DomainError, DomainResult};
pub use id::{JobId, RecordId};
pub use query::{FilterOp, Page, QueryFilter, QuerySort, QuerySpec, QuerySpecBuilder};
