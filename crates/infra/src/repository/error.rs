use thiserror::Error;

use taskhub_core::DomainError;

use super::store::StoreError;

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Error surfaced by the query executor.
///
/// Every variant tells the caller whether retrying can help
/// ([`is_retryable`](Self::is_retryable)) and, where one applies, which field
/// caused it ([`field`](Self::field)).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// Unknown field, or an operator used with an incompatible value.
    #[error("invalid query on field '{field}': {reason}")]
    InvalidQuery { field: String, reason: String },

    /// A record required to exist was missing.
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    /// Duplicate key or foreign-key violation.
    #[error("constraint violated on '{field}': {message}")]
    ConstraintViolation { field: String, message: String },

    /// Connection reset, timeout or pool exhaustion.
    #[error("transient store failure: {0}")]
    TransientStore(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Caller input rejected before reaching the store.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A store failure that could not be classified.
    #[error("store failure: {0}")]
    Store(String),
}

impl RepositoryError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, RepositoryError::TransientStore(_))
    }

    pub fn field(&self) -> Option<&str> {
        match self {
            RepositoryError::InvalidQuery { field, .. }
            | RepositoryError::ConstraintViolation { field, .. } => Some(field),
            _ => None,
        }
    }
}

impl From<DomainError> for RepositoryError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InvalidQuery { field, reason } => Self::InvalidQuery { field, reason },
            DomainError::Serialization(msg) => Self::Serialization(msg),
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => Self::Validation(msg),
            DomainError::NotFound => Self::Validation("referenced record not found".to_string()),
        }
    }
}

impl From<StoreError> for RepositoryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) | StoreError::Timeout(msg) => Self::TransientStore(msg),
            StoreError::UniqueViolation { table, field } => Self::ConstraintViolation {
                message: format!("duplicate value for {table}.{field}"),
                field,
            },
            StoreError::ForeignKeyViolation { field, message } => {
                Self::ConstraintViolation { field, message }
            }
            StoreError::Corrupt { table, message } => {
                Self::Serialization(format!("{table}: {message}"))
            }
            StoreError::Backend(msg) => Self::Store(msg),
        }
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
