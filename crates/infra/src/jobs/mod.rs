//! Background job queue with a worker pool, retries and backoff.
//!
//! ## Components
//!
//! - `Job`: a unit of deferred work and its lifecycle
//! - `JobStore`: owns jobs and the priority-ordered waiting area
//! - `JobHandler`: callable bound to a handler name
//! - `JobQueue`: accepts submissions and runs them on N async workers
//!
//! A failed attempt is retried after a backoff delay computed by
//! [`RetryConfig`](crate::retry::RetryConfig) until the job's retry budget is
//! spent. Retrying jobs wait outside the waiting area and hold no worker.

pub mod error;
pub mod handler;
pub mod pool;
pub mod store;
pub mod types;

pub use error::JobQueueError;
pub use handler::{FnHandler, HandlerError, HandlerResult, JobContext, JobHandler, handler_fn};
pub use pool::{JobQueue, JobQueueConfig, QueueReport, WorkerStats};
pub use store::{InMemoryJobStore, JobStore, StatusCounts};
pub use types::{EnqueueOptions, Job, JobAttemptRecord, JobStatus};
