//! Core job types and lifecycle.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use taskhub_core::JobId;

use super::error::JobQueueError;

/// Job execution status.
///
/// `PENDING -> RUNNING -> {COMPLETED | RETRYING | FAILED}`, and
/// `RETRYING -> PENDING` once the backoff delay elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting to be claimed by a worker
    Pending,
    /// Claimed and executing
    Running,
    /// Handler succeeded
    Completed,
    /// Retry budget exhausted or non-retryable failure
    Failed,
    /// Waiting out a backoff delay before re-entering the queue
    Retrying,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Retrying,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Retrying)
                | (Running, Failed)
                | (Retrying, Pending)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Retrying => "RETRYING",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Submission options for [`JobQueue::enqueue`](super::JobQueue::enqueue).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOptions {
    /// Higher runs first; ties run in submission order.
    pub priority: i32,
    pub max_retries: u32,
    /// Display name; defaults to the handler name.
    pub name: Option<String>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            max_retries: 3,
            name: None,
        }
    }
}

impl EnqueueOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// A background job.
///
/// `id`, `name`, `handler`, `args`, `kwargs` and `created_at` never change
/// after creation. Everything else moves only through the checked
/// transitions below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    /// Registered handler name
    pub handler: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    /// Start of the most recent attempt
    pub started_at: Option<DateTime<Utc>>,
    /// Set once the job reaches a terminal state
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    /// Most recent failure message
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub priority: i32,
    /// One record per execution attempt
    pub history: Vec<JobAttemptRecord>,
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl Job {
    pub fn new(handler: impl Into<String>, args: Vec<Value>, kwargs: Map<String, Value>, options: EnqueueOptions) -> Self {
        let handler = handler.into();
        Self {
            id: JobId::new(),
            name: options.name.unwrap_or_else(|| handler.clone()),
            handler,
            args,
            kwargs,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            retry_count: 0,
            max_retries: options.max_retries,
            priority: options.priority,
            history: Vec::new(),
        }
    }

    /// 1-based number of the current (or next) attempt.
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }

    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }

    fn transition(&mut self, next: JobStatus) -> Result<(), JobQueueError> {
        if !self.status.can_transition_to(next) {
            return Err(JobQueueError::InvalidTransition {
                job_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    fn record_attempt(&mut self, started_at: DateTime<Utc>, finished_at: DateTime<Utc>, error: Option<String>) {
        self.history.push(JobAttemptRecord {
            attempt: self.attempt(),
            started_at,
            finished_at,
            success: error.is_none(),
            error,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
        });
    }

    /// PENDING -> RUNNING.
    pub fn mark_running(&mut self, at: DateTime<Utc>) -> Result<(), JobQueueError> {
        self.transition(JobStatus::Running)?;
        self.started_at = Some(at);
        Ok(())
    }

    /// RUNNING -> COMPLETED.
    pub fn mark_completed(&mut self, result: Value, at: DateTime<Utc>) -> Result<(), JobQueueError> {
        self.transition(JobStatus::Completed)?;
        let started = self.started_at.unwrap_or(at);
        self.record_attempt(started, at, None);
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(at);
        Ok(())
    }

    /// RUNNING -> RETRYING, consuming one retry. Requires retries left.
    pub fn mark_retrying(&mut self, error: String, at: DateTime<Utc>) -> Result<(), JobQueueError> {
        if !self.has_retries_left() {
            return Err(JobQueueError::InvalidTransition {
                job_id: self.id,
                from: self.status,
                to: JobStatus::Retrying,
            });
        }
        self.transition(JobStatus::Retrying)?;
        let started = self.started_at.unwrap_or(at);
        self.record_attempt(started, at, Some(error.clone()));
        self.error = Some(error);
        self.retry_count += 1;
        Ok(())
    }

    /// RUNNING -> FAILED (terminal).
    pub fn mark_failed(&mut self, error: String, at: DateTime<Utc>) -> Result<(), JobQueueError> {
        self.transition(JobStatus::Failed)?;
        let started = self.started_at.unwrap_or(at);
        self.record_attempt(started, at, Some(error.clone()));
        self.error = Some(error);
        self.completed_at = Some(at);
        Ok(())
    }

    /// RETRYING -> PENDING, after the backoff delay.
    pub fn mark_requeued(&mut self) -> Result<(), JobQueueError> {
        self.transition(JobStatus::Pending)
    }
}
