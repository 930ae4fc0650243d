//! Job storage implementations.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use taskhub_core::JobId;

use super::error::JobQueueError;
use super::types::{Job, JobStatus};

/// Job store abstraction.
///
/// The store owns every job and the waiting area. Each method is atomic:
/// in particular `claim_next` removes a job from the waiting area and marks it
/// RUNNING in one step, so no two callers can claim the same job.
pub trait JobStore: Send + Sync {
    /// Add a PENDING job to the waiting area, rejecting it when the waiting
    /// area already holds `max_pending` jobs.
    fn push(&self, job: Job, max_pending: Option<usize>) -> Result<JobId, JobQueueError>;

    /// Snapshot of a job.
    fn get(&self, job_id: JobId) -> Option<Job>;

    /// Claim the highest-priority, oldest waiting job.
    fn claim_next(&self, at: DateTime<Utc>) -> Option<Job>;

    fn complete(&self, job_id: JobId, result: Value, at: DateTime<Utc>) -> Result<Job, JobQueueError>;

    /// RUNNING -> RETRYING. The job stays out of the waiting area until `requeue`.
    fn retry(&self, job_id: JobId, error: String, at: DateTime<Utc>) -> Result<Job, JobQueueError>;

    fn fail(&self, job_id: JobId, error: String, at: DateTime<Utc>) -> Result<Job, JobQueueError>;

    /// RETRYING -> PENDING, back into the waiting area with its original priority.
    fn requeue(&self, job_id: JobId) -> Result<Job, JobQueueError>;

    /// Jobs per status, computed from current state.
    fn counts(&self) -> StatusCounts;

    /// Newest first, optionally filtered by status.
    fn list(&self, status: Option<JobStatus>, limit: usize) -> Vec<Job>;
}

/// Number of jobs in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub retrying: usize,
}

impl StatusCounts {
    pub fn get(&self, status: JobStatus) -> usize {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Running => self.running,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Retrying => self.retrying,
        }
    }

    fn bump(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Retrying => self.retrying += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed + self.retrying
    }
}

/// Waiting-area entry: higher priority first, then lower sequence (FIFO).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Waiting {
    priority: i32,
    seq: u64,
    job_id: JobId,
}

impl Ord for Waiting {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Waiting {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    waiting: BinaryHeap<Waiting>,
    next_seq: u64,
}

impl State {
    fn enter_waiting(&mut self, job_id: JobId, priority: i32) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.waiting.push(Waiting { priority, seq, job_id });
    }

    fn job_mut(&mut self, job_id: JobId) -> Result<&mut Job, JobQueueError> {
        self.jobs
            .get_mut(&job_id)
            .ok_or(JobQueueError::JobNotFound(job_id))
    }
}

/// In-memory job store: one mutex guards jobs and the waiting area together.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: Mutex<State>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn modify(
        &self,
        job_id: JobId,
        f: impl FnOnce(&mut Job) -> Result<(), JobQueueError>,
    ) -> Result<Job, JobQueueError> {
        let mut state = self.lock();
        let job = state.job_mut(job_id)?;
        f(job)?;
        Ok(job.clone())
    }
}

impl JobStore for InMemoryJobStore {
    fn push(&self, job: Job, max_pending: Option<usize>) -> Result<JobId, JobQueueError> {
        let mut state = self.lock();
        if let Some(max_pending) = max_pending {
            if state.waiting.len() >= max_pending {
                return Err(JobQueueError::QueueFull { max_pending });
            }
        }

        let (job_id, priority) = (job.id, job.priority);
        state.jobs.insert(job_id, job);
        state.enter_waiting(job_id, priority);
        Ok(job_id)
    }

    fn get(&self, job_id: JobId) -> Option<Job> {
        self.lock().jobs.get(&job_id).cloned()
    }

    fn claim_next(&self, at: DateTime<Utc>) -> Option<Job> {
        let mut state = self.lock();
        while let Some(next) = state.waiting.pop() {
            let Some(job) = state.jobs.get_mut(&next.job_id) else {
                continue;
            };
            if job.mark_running(at).is_ok() {
                return Some(job.clone());
            }
        }
        None
    }

    fn complete(&self, job_id: JobId, result: Value, at: DateTime<Utc>) -> Result<Job, JobQueueError> {
        self.modify(job_id, |job| job.mark_completed(result, at))
    }

    fn retry(&self, job_id: JobId, error: String, at: DateTime<Utc>) -> Result<Job, JobQueueError> {
        self.modify(job_id, |job| job.mark_retrying(error, at))
    }

    fn fail(&self, job_id: JobId, error: String, at: DateTime<Utc>) -> Result<Job, JobQueueError> {
        self.modify(job_id, |job| job.mark_failed(error, at))
    }

    fn requeue(&self, job_id: JobId) -> Result<Job, JobQueueError> {
        let mut state = self.lock();
        let job = state.job_mut(job_id)?;
        job.mark_requeued()?;
        let snapshot = job.clone();
        state.enter_waiting(job_id, snapshot.priority);
        Ok(snapshot)
    }

    fn counts(&self) -> StatusCounts {
        let state = self.lock();
        let mut counts = StatusCounts::default();
        for job in state.jobs.values() {
            counts.bump(job.status);
        }
        counts
    }

    fn list(&self, status: Option<JobStatus>, limit: usize) -> Vec<Job> {
        let state = self.lock();
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        jobs.truncate(limit);
        jobs
    }
}

impl<T> JobStore for Arc<T>
where
    T: JobStore + ?Sized,
{
    fn push(&self, job: Job, max_pending: Option<usize>) -> Result<JobId, JobQueueError> {
        (**self).push(job, max_pending)
    }

    fn get(&self, job_id: JobId) -> Option<Job> {
        (**self).get(job_id)
    }

    fn claim_next(&self, at: DateTime<Utc>) -> Option<Job> {
        (**self).claim_next(at)
    }

    fn complete(&self, job_id: JobId, result: Value, at: DateTime<Utc>) -> Result<Job, JobQueueError> {
        (**self).complete(job_id, result, at)
    }

    fn retry(&self, job_id: JobId, error: String, at: DateTime<Utc>) -> Result<Job, JobQueueError> {
        (**self).retry(job_id, error, at)
    }

    fn fail(&self, job_id: JobId, error: String, at: DateTime<Utc>) -> Result<Job, JobQueueError> {
        (**self).fail(job_id, error, at)
    }

    fn requeue(&self, job_id: JobId) -> Result<Job, JobQueueError> {
        (**self).requeue(job_id)
    }

    fn counts(&self) -> StatusCounts {
        (**self).counts()
    }

    fn list(&self, status: Option<JobStatus>, limit: usize) -> Vec<Job> {
        (**self).list(status, limit)
    }
}
