//! Explicit composition of cross-cutting concerns around an operation.
//!
//! Stages always run in the same order, whatever order they were configured in:
//!
//! ```text
//! validate -> audit -> cache -> retry -> execute
//! ```
//!
//! - **validate** rejects bad input before anything else happens.
//! - **audit** records every invocation that passed validation, including
//!   cache hits, with its outcome and duration.
//! - **cache** serves a previous successful result for identical input.
//! - **retry** re-runs the operation on retryable errors.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{Cache, CacheExt, cache_key};
use crate::retry::RetryPolicy;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Validate,
    Audit,
    Cache,
    Retry,
    Execute,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError<E> {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{0}")]
    Operation(E),
}

impl<E> PipelineError<E> {
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Operation(err) => Some(err),
            Self::Validation(_) => None,
        }
    }
}

/// What the audit stage saw for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRecord {
    pub component: String,
    pub operation: String,
    pub success: bool,
    pub error: Option<String>,
    /// Served from cache without executing
    pub cached: bool,
    pub duration: Duration,
}

pub type Validator<I> = Arc<dyn Fn(&I) -> Result<(), String> + Send + Sync>;
pub type OperationAuditor = Arc<dyn Fn(&OperationRecord) + Send + Sync>;

#[derive(Clone)]
struct CacheStage {
    cache: Arc<dyn Cache>,
    ttl: Option<Duration>,
}

/// An operation wrapper for inputs of type `I`.
pub struct Pipeline<I> {
    component: String,
    validators: Vec<Validator<I>>,
    audit: Option<Option<OperationAuditor>>,
    cache: Option<CacheStage>,
    retry: Option<RetryPolicy>,
}

impl<I> Clone for Pipeline<I> {
    fn clone(&self) -> Self {
        Self {
            component: self.component.clone(),
            validators: self.validators.clone(),
            audit: self.audit.clone(),
            cache: self.cache.clone(),
            retry: self.retry.clone(),
        }
    }
}

impl<I> fmt::Debug for Pipeline<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("component", &self.component)
            .field("stages", &self.stages())
            .finish()
    }
}

impl<I> Pipeline<I> {
    /// A pipeline that only executes. `component` scopes cache keys and audit records.
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            validators: Vec::new(),
            audit: None,
            cache: None,
            retry: None,
        }
    }

    /// Add an input check. Checks run in the order added; the first failure wins.
    pub fn validate<F>(mut self, check: F) -> Self
    where
        F: Fn(&I) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validators.push(Arc::new(check));
        self
    }

    /// Log every invocation through `tracing`.
    pub fn audited(mut self) -> Self {
        self.audit = Some(None);
        self
    }

    /// Log every invocation and hand its record to `auditor`.
    pub fn audit_with<F>(mut self, auditor: F) -> Self
    where
        F: Fn(&OperationRecord) + Send + Sync + 'static,
    {
        self.audit = Some(Some(Arc::new(auditor)));
        self
    }

    pub fn cached(mut self, cache: Arc<dyn Cache>, ttl: Option<Duration>) -> Self {
        self.cache = Some(CacheStage { cache, ttl });
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    /// Enabled stages in the order they run.
    pub fn stages(&self) -> Vec<Stage> {
        let mut stages = Vec::with_capacity(5);
        if !self.validators.is_empty() {
            stages.push(Stage::Validate);
        }
        if self.audit.is_some() {
            stages.push(Stage::Audit);
        }
        if self.cache.is_some() {
            stages.push(Stage::Cache);
        }
        if self.retry.is_some() {
            stages.push(Stage::Retry);
        }
        stages.push(Stage::Execute);
        stages
    }
}

impl<I> Pipeline<I>
where
    I: Serialize,
{
    /// Run `op` for `input` through every configured stage.
    ///
    /// `is_retryable` classifies operation errors for the retry stage.
    pub async fn execute<O, E, C, Op, Fut>(
        &self,
        operation: &str,
        input: &I,
        is_retryable: C,
        op: Op,
    ) -> Result<O, PipelineError<E>>
    where
        O: Serialize + DeserializeOwned,
        E: fmt::Display,
        C: Fn(&E) -> bool,
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<O, E>>,
    {
        for check in &self.validators {
            if let Err(reason) = check(input) {
                debug!(component = %self.component, operation, reason = %reason, "input rejected");
                return Err(PipelineError::Validation(reason));
            }
        }

        let started = Instant::now();
        let (outcome, cached) = self.cached_call(operation, input, is_retryable, op).await;

        if let Some(auditor) = &self.audit {
            let record = OperationRecord {
                component: self.component.clone(),
                operation: operation.to_string(),
                success: outcome.is_ok(),
                error: outcome.as_ref().err().map(ToString::to_string),
                cached,
                duration: started.elapsed(),
            };
            emit(&record);
            if let Some(auditor) = auditor {
                auditor(&record);
            }
        }

        outcome.map_err(PipelineError::Operation)
    }

    async fn cached_call<O, E, C, Op, Fut>(&self, operation: &str, input: &I, is_retryable: C, op: Op) -> (Result<O, E>, bool)
    where
        O: Serialize + DeserializeOwned,
        E: fmt::Display,
        C: Fn(&E) -> bool,
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<O, E>>,
    {
        let Some(stage) = &self.cache else {
            return (self.retried_call(operation, is_retryable, op).await, false);
        };

        let key = match cache_key(&self.component, operation, input) {
            Ok(key) => key,
            Err(err) => {
                warn!(component = %self.component, operation, error = %err, "cache bypassed: input not hashable");
                return (self.retried_call(operation, is_retryable, op).await, false);
            }
        };

        if let Some(hit) = stage.cache.get_as::<O>(&key) {
            debug!(component = %self.component, operation, "cache hit");
            return (Ok(hit), true);
        }

        let outcome = self.retried_call(operation, is_retryable, op).await;
        if let Ok(value) = &outcome {
            if let Err(err) = stage.cache.set_serialized(&key, value, stage.ttl) {
                warn!(component = %self.component, operation, error = %err, "result not cached");
            }
        }
        (outcome, false)
    }

    async fn retried_call<O, E, C, Op, Fut>(&self, operation: &str, is_retryable: C, mut op: Op) -> Result<O, E>
    where
        E: fmt::Display,
        C: Fn(&E) -> bool,
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<O, E>>,
    {
        match &self.retry {
            Some(policy) => policy.run(operation, is_retryable, op).await,
            None => op().await,
        }
    }
}

fn emit(record: &OperationRecord) {
    let duration_ms = record.duration.as_millis() as u64;
    match &record.error {
        None => info!(
            component = %record.component,
            operation = %record.operation,
            cached = record.cached,
            duration_ms,
            "operation succeeded"
        ),
        Some(error) => warn!(
            component = %record.component,
            operation = %record.operation,
            duration_ms,
            error = %error,
            "operation failed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::retry::RetryConfig;
    use serde::Deserialize;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Serialize, Deserialize)]
    struct Lookup {
        user: String,
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(RetryConfig::exponential(3, Duration::from_millis(1), Duration::from_millis(2)))
    }

    #[test]
    fn stages_are_listed_in_fixed_order() {
        let cache: Arc<dyn Cache> = Arc::new(InMemoryCache::new());
        let pipeline = Pipeline::<Lookup>::new("users")
            .retry(fast_retry())
            .cached(cache, None)
            .audited()
            .validate(|_| Ok(()));

        assert_eq!(
            pipeline.stages(),
            vec![Stage::Validate, Stage::Audit, Stage::Cache, Stage::Retry, Stage::Execute]
        );
        assert_eq!(Pipeline::<Lookup>::new("bare").stages(), vec![Stage::Execute]);
    }

    #[test]
    fn debug_lists_stages_for_any_input_type() {
        struct Opaque;

        let pipeline = Pipeline::<Opaque>::new("opaque").audited().retry(fast_retry());
        let rendered = format!("{pipeline:?}");

        assert!(rendered.contains("\"opaque\""));
        assert!(rendered.contains("[Audit, Retry, Execute]"));
        assert_eq!(pipeline.component(), "opaque");
    }

    #[tokio::test]
    async fn validation_runs_first_and_skips_everything_else() {
        let records = Arc::new(Mutex::new(Vec::new()));
        let sink = records.clone();
        let calls = AtomicU32::new(0);

        let pipeline = Pipeline::<Lookup>::new("users")
            .validate(|input| {
                if input.user.is_empty() {
                    Err("user is required".to_string())
                } else {
                    Ok(())
                }
            })
            .audit_with(move |record| sink.lock().unwrap().push(record.clone()));

        let result = pipeline
            .execute("lookup", &Lookup { user: String::new() }, |_: &String| true, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, String>(1u32) }
            })
            .await;

        assert_eq!(result, Err(PipelineError::Validation("user is required".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cache_hits_are_audited_and_skip_execution() {
        let records = Arc::new(Mutex::new(Vec::new()));
        let sink = records.clone();
        let calls = AtomicU32::new(0);
        let cache: Arc<dyn Cache> = Arc::new(InMemoryCache::new());

        let pipeline = Pipeline::<Lookup>::new("users")
            .audit_with(move |record| sink.lock().unwrap().push(record.clone()))
            .cached(cache, Some(Duration::from_secs(60)));

        let input = Lookup { user: "ada".to_string() };
        for _ in 0..2 {
            let value = pipeline
                .execute("lookup", &input, |_: &String| false, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, String>(vec![1, 2, 3]) }
                })
                .await
                .unwrap();
            assert_eq!(value, vec![1, 2, 3]);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let records = records.lock().unwrap();
        assert_eq!(records.len(), 2);
        assert!(!records[0].cached);
        assert!(records[1].cached);
        assert!(records.iter().all(|r| r.success));
    }

    #[tokio::test]
    async fn retry_sits_inside_cache() {
        let calls = AtomicU32::new(0);
        let cache = Arc::new(InMemoryCache::new());

        let pipeline = Pipeline::<Lookup>::new("users")
            .cached(cache.clone(), None)
            .retry(fast_retry());

        let input = Lookup { user: "grace".to_string() };
        let value = pipeline
            .execute("lookup", &input, |_: &String| true, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err("transient".to_string())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // Only the eventual success is cached.
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let cache = Arc::new(InMemoryCache::new());
        let pipeline = Pipeline::<Lookup>::new("users").cached(cache.clone(), None).audited();

        let err = pipeline
            .execute("lookup", &Lookup { user: "x".to_string() }, |_: &String| true, || async {
                Err::<u32, _>("down".to_string())
            })
            .await
            .unwrap_err();

        assert_eq!(err.into_operation(), Some("down".to_string()));
        assert!(cache.is_empty());
    }
}
