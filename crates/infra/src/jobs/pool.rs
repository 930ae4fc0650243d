//! Worker pool: dispatches queued jobs to registered handlers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use taskhub_core::JobId;

use crate::retry::{RetryAttempt, RetryConfig, RetryPolicy};

use super::error::{JobQueueError, validate_handler_name};
use super::handler::{HandlerError, HandlerResult, JobContext, JobHandler, handler_fn};
use super::store::{InMemoryJobStore, JobStore, StatusCounts};
use super::types::{EnqueueOptions, Job, JobStatus};

/// Job queue configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobQueueConfig {
    /// Workers started by [`JobQueue::start_configured`]
    pub workers: usize,
    /// Admission limit on PENDING jobs; `None` is unbounded
    pub max_pending: Option<usize>,
    /// Idle workers re-check the waiting area at least this often
    pub poll_interval: Duration,
    /// Backoff between a job's failed attempt and its next one
    pub retry: RetryConfig,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_pending: None,
            poll_interval: Duration::from_millis(100),
            retry: RetryConfig::default(),
        }
    }
}

impl JobQueueConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = Some(max_pending);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    /// Attempts finished (any outcome)
    pub processed: u64,
    pub succeeded: u64,
    /// Attempts that scheduled another attempt
    pub retried: u64,
    /// Jobs that ended FAILED
    pub failed: u64,
    /// Handlers executing right now
    pub running: usize,
    pub workers: usize,
}

/// Queue report, computed on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueReport {
    pub counts: StatusCounts,
    pub total: usize,
    pub stats: WorkerStats,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    running: AtomicUsize,
}

struct Workers {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

struct Inner {
    config: JobQueueConfig,
    store: Arc<dyn JobStore>,
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
    /// Always built from `config.retry`; only the observer varies.
    retry: RwLock<RetryPolicy>,
    wakeup: Notify,
    counters: Counters,
    workers: Mutex<Option<Workers>>,
    worker_count: AtomicUsize,
}

/// In-process job queue with a bounded pool of async workers.
///
/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("config", &self.inner.config)
            .field("workers", &self.inner.worker_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new(JobQueueConfig::default())
    }
}

impl JobQueue {
    /// Queue backed by an [`InMemoryJobStore`].
    pub fn new(config: JobQueueConfig) -> Self {
        Self::with_store(config, InMemoryJobStore::arc())
    }

    pub fn with_store(config: JobQueueConfig, store: Arc<dyn JobStore>) -> Self {
        let retry = RetryPolicy::new(config.retry.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                handlers: RwLock::new(HashMap::new()),
                retry: RwLock::new(retry),
                wakeup: Notify::new(),
                counters: Counters::default(),
                workers: Mutex::new(None),
                worker_count: AtomicUsize::new(0),
            }),
        }
    }

    /// Attach an observer called before each job retry sleeps.
    ///
    /// Backoff stays governed by `config().retry`. Clones share the observer,
    /// and it takes effect for retries scheduled after this call.
    pub fn with_retry_observer<F>(self, observer: F) -> Self
    where
        F: Fn(&RetryAttempt<'_>) + Send + Sync + 'static,
    {
        let policy = RetryPolicy::new(self.inner.config.retry.clone()).with_observer(observer);
        *self.inner.retry.write().unwrap_or_else(PoisonError::into_inner) = policy;
        self
    }

    pub fn config(&self) -> &JobQueueConfig {
        &self.inner.config
    }

    /// Bind `name` to a handler, replacing any previous binding.
    pub fn register_handler<H>(&self, name: impl Into<String>, handler: H) -> Result<(), JobQueueError>
    where
        H: JobHandler,
    {
        let name = name.into();
        validate_handler_name(&name)?;
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if handlers.insert(name.clone(), Arc::new(handler)).is_some() {
            debug!(handler = %name, "replaced job handler");
        } else {
            debug!(handler = %name, "registered job handler");
        }
        Ok(())
    }

    /// Bind `name` to an async closure.
    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, f: F) -> Result<(), JobQueueError>
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_handler(name, handler_fn(f))
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Submit a job. Returns as soon as the job is PENDING in the waiting area.
    ///
    /// The handler does not need to be registered yet; a job whose handler is
    /// still unknown when claimed fails immediately.
    pub fn enqueue(
        &self,
        handler: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        options: EnqueueOptions,
    ) -> Result<JobId, JobQueueError> {
        validate_handler_name(handler)?;
        let job = Job::new(handler, args, kwargs, options);
        let priority = job.priority;
        let job_id = self.inner.store.push(job, self.inner.config.max_pending)?;

        debug!(job_id = %job_id, handler, priority, "job enqueued");
        self.inner.wakeup.notify_one();
        Ok(job_id)
    }

    /// Start `workers` workers (at least one). No-op when already started.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, workers: usize) {
        let mut slot = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            debug!("job queue already started");
            return;
        }

        let workers = workers.max(1);
        let (shutdown, receiver) = watch::channel(false);
        let handles = (0..workers)
            .map(|worker| {
                let inner = Arc::clone(&self.inner);
                let receiver = receiver.clone();
                tokio::spawn(async move { inner.worker_loop(worker, receiver).await })
            })
            .collect();

        self.inner.worker_count.store(workers, Ordering::Relaxed);
        *slot = Some(Workers { shutdown, handles });
        info!(workers, "job queue started");
    }

    /// Start with the configured worker count.
    pub fn start_configured(&self) {
        self.start(self.inner.config.workers);
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Stop claiming new jobs and wait for in-flight handlers to finish.
    ///
    /// Jobs still PENDING stay queued; a later `start` picks them up.
    pub async fn stop(&self) {
        let running = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Workers { shutdown, handles }) = running else {
            return;
        };

        let _ = shutdown.send(true);
        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = %err, "job worker terminated abnormally");
            }
        }
        self.inner.worker_count.store(0, Ordering::Relaxed);
        info!("job queue stopped");
    }

    pub fn get_job(&self, job_id: JobId) -> Option<Job> {
        self.inner.store.get(job_id)
    }

    /// Newest first, optionally filtered by status.
    pub fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> Vec<Job> {
        self.inner.store.list(status, limit)
    }

    /// Instantaneous per-status counts plus worker statistics.
    pub fn report(&self) -> QueueReport {
        let counts = self.inner.store.counts();
        let c = &self.inner.counters;
        QueueReport {
            total: counts.total(),
            counts,
            stats: WorkerStats {
                processed: c.processed.load(Ordering::Relaxed),
                succeeded: c.succeeded.load(Ordering::Relaxed),
                retried: c.retried.load(Ordering::Relaxed),
                failed: c.failed.load(Ordering::Relaxed),
                running: c.running.load(Ordering::Relaxed),
                workers: self.inner.worker_count.load(Ordering::Relaxed),
            },
        }
    }

    /// Poll until the job is COMPLETED or FAILED, or `timeout` elapses.
    ///
    /// Returns the last snapshot seen, `None` if the job does not exist.
    pub async fn wait_for(&self, job_id: JobId, timeout: Duration) -> Option<Job> {
        let deadline = Instant::now() + timeout;
        loop {
            let job = self.get_job(job_id)?;
            if job.status.is_terminal() || Instant::now() >= deadline {
                return Some(job);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Inner {
    fn handler(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    async fn worker_loop(self: Arc<Self>, worker: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(worker, "job worker started");
        while !*shutdown.borrow() {
            match self.store.claim_next(Utc::now()) {
                Some(job) => self.execute(worker, job).await,
                None => {
                    tokio::select! {
                        _ = self.wakeup.notified() => {}
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
        debug!(worker, "job worker stopped");
    }

    async fn execute(self: &Arc<Self>, worker: usize, job: Job) {
        debug!(worker, job_id = %job.id, handler = %job.handler, attempt = job.attempt(), "claimed job");

        let Some(handler) = self.handler(&job.handler) else {
            let err = JobQueueError::UnknownHandler(job.handler.clone());
            warn!(job_id = %job.id, error = %err, "job failed: no handler");
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            self.counters.processed.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = self.store.fail(job.id, err.to_string(), Utc::now()) {
                error!(job_id = %job.id, error = %err, "failed to record job failure");
            }
            return;
        };

        let ctx = JobContext {
            job_id: job.id,
            name: job.name.clone(),
            attempt: job.attempt(),
            args: job.args.clone(),
            kwargs: job.kwargs.clone(),
        };

        self.counters.running.fetch_add(1, Ordering::Relaxed);
        // A panicking handler surfaces as a JoinError instead of taking the worker down.
        let outcome = match tokio::spawn(async move { handler.handle(ctx).await }).await {
            Ok(outcome) => outcome,
            Err(err) => Err(HandlerError::new(format!("handler panicked: {err}"))),
        };
        self.counters.running.fetch_sub(1, Ordering::Relaxed);
        self.counters.processed.fetch_add(1, Ordering::Relaxed);

        match outcome {
            Ok(result) => match self.store.complete(job.id, result, Utc::now()) {
                Ok(_) => {
                    self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                    info!(job_id = %job.id, handler = %job.handler, attempt = job.attempt(), "job completed");
                }
                Err(err) => error!(job_id = %job.id, error = %err, "failed to record job completion"),
            },
            Err(err) if err.is_retryable() && job.has_retries_left() => self.schedule_retry(&job, err),
            Err(err) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    job_id = %job.id,
                    handler = %job.handler,
                    retry_count = job.retry_count,
                    retryable = err.is_retryable(),
                    error = %err,
                    "job failed"
                );
                if let Err(err) = self.store.fail(job.id, err.message, Utc::now()) {
                    error!(job_id = %job.id, error = %err, "failed to record job failure");
                }
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, job: &Job, err: HandlerError) {
        let retried = match self.store.retry(job.id, err.message.clone(), Utc::now()) {
            Ok(retried) => retried,
            Err(store_err) => {
                error!(job_id = %job.id, error = %store_err, "failed to record job retry");
                return;
            }
        };
        self.counters.retried.fetch_add(1, Ordering::Relaxed);

        let next_attempt = retried.attempt();
        let retry = self.retry.read().unwrap_or_else(PoisonError::into_inner).clone();
        let delay = retry.config().delay_for_attempt(next_attempt);
        warn!(
            job_id = %job.id,
            handler = %job.handler,
            retry_count = retried.retry_count,
            max_retries = retried.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "job failed, retrying"
        );
        retry.observe(&RetryAttempt {
            operation: &job.handler,
            attempt: next_attempt,
            error: &err,
            delay,
        });

        let inner = Arc::clone(self);
        let job_id = job.id;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match inner.store.requeue(job_id) {
                Ok(_) => {
                    debug!(job_id = %job_id, "job requeued");
                    inner.wakeup.notify_one();
                }
                Err(err) => error!(job_id = %job_id, error = %err, "failed to requeue job"),
            }
        });
    }
}
