//! Retry policy with exponential backoff and optional jitter.
//!
//! The same delay formula drives two callers: [`RetryPolicy::run`] wraps any
//! fallible async operation (repository transactions use it for transient
//! store failures), and the job queue uses [`RetryConfig::delay_for_attempt`]
//! to schedule a failed job's next attempt.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use taskhub_core::{DomainError, DomainResult};

/// Backoff parameters. Pure value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one (>= 1).
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays (> 1).
    pub exponential_base: f64,
    /// Scale each delay by a uniform random factor in `[0.5, 1.0]`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// A config that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Exponential backoff without jitter.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            exponential_base: 2.0,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_exponential_base(mut self, base: f64) -> Self {
        self.exponential_base = base;
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.max_attempts < 1 {
            return Err(DomainError::validation("retry max_attempts must be at least 1"));
        }
        if !(self.exponential_base.is_finite() && self.exponential_base > 1.0) {
            return Err(DomainError::validation(
                "retry exponential_base must be a finite number greater than 1",
            ));
        }
        if self.base_delay > self.max_delay {
            return Err(DomainError::validation(
                "retry base_delay must not exceed max_delay",
            ));
        }
        Ok(())
    }

    /// Un-jittered delay before attempt `attempt` (1-indexed):
    /// `min(base_delay * exponential_base^(attempt - 2), max_delay)`.
    ///
    /// The first attempt runs immediately, so attempts below 2 yield zero.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt < 2 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 2).unwrap_or(i32::MAX);
        let raw = self.base_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        let max = self.max_delay.as_secs_f64();

        if !raw.is_finite() || raw >= max {
            self.max_delay
        } else {
            Duration::from_secs_f64(raw.max(0.0))
        }
    }

    /// Delay before attempt `attempt`, with jitter applied when enabled.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for_attempt(attempt);
        if self.jitter && !delay.is_zero() {
            let factor = rand::thread_rng().gen_range(0.5..=1.0);
            delay.mul_f64(factor)
        } else {
            delay
        }
    }
}

/// What an observer sees right before a retry sleeps.
pub struct RetryAttempt<'a> {
    pub operation: &'a str,
    /// The attempt about to run (2 for the first retry).
    pub attempt: u32,
    pub error: &'a dyn fmt::Display,
    pub delay: Duration,
}

/// Observability hook invoked before each retry. Must not influence control flow.
pub type RetryObserver = Arc<dyn Fn(&RetryAttempt<'_>) + Send + Sync>;

/// Executes fallible async operations under a [`RetryConfig`].
#[derive(Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
    observer: Option<RetryObserver>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .field("observer", &self.observer.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            observer: None,
        }
    }

    pub fn no_retry() -> Self {
        Self::new(RetryConfig::no_retry())
    }

    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(&RetryAttempt<'_>) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Report a retry scheduled outside of [`run`](Self::run).
    pub fn observe(&self, attempt: &RetryAttempt<'_>) {
        if let Some(observer) = &self.observer {
            observer(attempt);
        }
    }

    /// Run `op` up to `max_attempts` times.
    ///
    /// Only errors for which `is_retryable` returns true are retried; any other
    /// error is returned on first occurrence. When attempts run out, the last
    /// error is returned.
    pub async fn run<T, E, Op, Fut, C>(&self, operation: &str, is_retryable: C, mut op: Op) -> Result<T, E>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
        E: fmt::Display,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let delay = match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if attempt >= max_attempts || !is_retryable(&err) {
                        return Err(err);
                    }

                    attempt += 1;
                    let delay = self.config.delay_for_attempt(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after failure"
                    );

                    self.observe(&RetryAttempt {
                        operation,
                        attempt,
                        error: &err,
                        delay,
                    });
                    delay
                }
            };

            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum Failure {
        Transient(u32),
        Permanent,
    }

    impl fmt::Display for Failure {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Failure::Transient(n) => write!(f, "transient #{n}"),
                Failure::Permanent => f.write_str("permanent"),
            }
        }
    }

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig::exponential(max_attempts, Duration::from_millis(1), Duration::from_millis(4))
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let config = RetryConfig::exponential(6, Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(config.base_delay_for_attempt(1), Duration::ZERO);
        assert_eq!(config.base_delay_for_attempt(2), Duration::from_millis(100));
        assert_eq!(config.base_delay_for_attempt(3), Duration::from_millis(200));
        assert_eq!(config.base_delay_for_attempt(4), Duration::from_millis(400));
        assert_eq!(config.base_delay_for_attempt(5), Duration::from_millis(800));
    }

    #[test]
    fn delay_is_capped_and_survives_huge_exponents() {
        let config = RetryConfig::exponential(3, Duration::from_millis(100), Duration::from_millis(250));
        assert_eq!(config.base_delay_for_attempt(4), Duration::from_millis(250));
        assert_eq!(config.base_delay_for_attempt(u32::MAX), Duration::from_millis(250));
    }

    #[test]
    fn custom_exponential_base() {
        let config = RetryConfig::exponential(5, Duration::from_millis(10), Duration::from_secs(1))
            .with_exponential_base(3.0);
        assert_eq!(config.base_delay_for_attempt(4), Duration::from_millis(90));
    }

    #[test]
    fn validate_rejects_bad_configs() {
        assert!(RetryConfig::default().validate().is_ok());
        assert!(RetryConfig { max_attempts: 0, ..Default::default() }.validate().is_err());
        assert!(RetryConfig::default().with_exponential_base(1.0).validate().is_err());
        assert!(RetryConfig {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(1),
            ..Default::default()
        }
        .validate()
        .is_err());
    }

    #[tokio::test]
    async fn retries_transient_errors_and_surfaces_the_last_one() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(fast(3));

        let result: Result<(), Failure> = policy
            .run("flaky", |e| matches!(e, Failure::Transient(_)), || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Err(Failure::Transient(n)) }
            })
            .await;

        assert_eq!(result, Err(Failure::Transient(3)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_propagate_immediately() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(fast(5));

        let result: Result<(), Failure> = policy
            .run("strict", |e| matches!(e, Failure::Transient(_)), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Failure::Permanent) }
            })
            .await;

        assert_eq!(result, Err(Failure::Permanent));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_once_the_operation_recovers() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(fast(4));

        let result = policy
            .run("recovering", |_: &Failure| true, || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 { Err(Failure::Transient(n)) } else { Ok(n) }
                }
            })
            .await;

        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn observer_sees_each_retry_with_its_delay() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let policy = RetryPolicy::new(fast(3)).with_observer(move |a| {
            sink.lock().unwrap().push((a.attempt, a.error.to_string(), a.delay));
        });

        let _: Result<(), Failure> = policy
            .run("observed", |_| true, || async { Err(Failure::Transient(0)) })
            .await;

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (2, "transient #0".to_string(), Duration::from_millis(1)),
                (3, "transient #0".to_string(), Duration::from_millis(2)),
            ]
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: a jittered delay stays within [0.5, 1.0] of the
        /// un-jittered formula value.
        #[test]
        fn jittered_delay_within_bounds(
            attempt in 2u32..20,
            base_ms in 1u64..1_000,
            max_ms in 1_000u64..60_000,
            exp_base in 1.1f64..4.0,
        ) {
            let config = RetryConfig {
                max_attempts: 20,
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(max_ms),
                exponential_base: exp_base,
                jitter: true,
            };
            let nominal = config.base_delay_for_attempt(attempt);
            let expected = (base_ms as f64 / 1000.0 * exp_base.powi(attempt as i32 - 2))
                .min(max_ms as f64 / 1000.0);
            prop_assert!((nominal.as_secs_f64() - expected).abs() < 1e-6);

            let jittered = config.delay_for_attempt(attempt);
            prop_assert!(jittered <= nominal);
            prop_assert!(jittered.as_secs_f64() >= nominal.as_secs_f64() * 0.5 - 1e-9);
        }
    }
}
