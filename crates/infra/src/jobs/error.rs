use thiserror::Error;

use taskhub_core::JobId;

use super::types::JobStatus;

/// Errors returned by the job queue API.
///
/// Handler failures never surface here: a worker turns them into job state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobQueueError {
    /// Dispatch found no handler bound to the job's handler name.
    #[error("no handler registered for '{0}'")]
    UnknownHandler(String),

    #[error("invalid handler name '{0}': must be non-empty and contain no whitespace")]
    InvalidHandlerName(String),

    /// Admission rejected: the waiting area is at capacity.
    #[error("job queue is full ({max_pending} pending jobs)")]
    QueueFull { max_pending: usize },

    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
}

/// Handler names are opaque, but must be non-empty and free of whitespace.
pub(crate) fn validate_handler_name(name: &str) -> Result<(), JobQueueError> {
    if name.is_empty() || name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(JobQueueError::InvalidHandlerName(name.to_string()));
    }
    Ok(())
}
