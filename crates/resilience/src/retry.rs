//! Bounded retries with optional exponential backoff
//!
//! [`RetryExecutor`] runs an operation until it succeeds, fails with an
//! error the policy's [`FailureClassifier`] deems permanent, or uses up
//! `max_attempts`. Backoff sleeps race the caller's cancellation token, and
//! every attempt runs inside a [`TimeoutGuard`] so panics never escape.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::classifier::FailureClassifier;
use crate::error::{ConfigError, ConfigResult, ResilienceError, ResilienceResult};
use crate::observability::{noop_sink, ResilienceEvent, SharedSink};
use crate::timeout::TimeoutGuard;

/// Immutable retry policy
///
/// Construct through [`RetryPolicy::builder`]; `max_attempts` and
/// `base_delay` have no defaults.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use bulwark_resilience::{FailureClassifier, RetryPolicy};
///
/// let policy = RetryPolicy::builder(3, Duration::from_millis(50))
///     .exponential_backoff(Duration::from_secs(1))
///     .classifier(FailureClassifier::database_defaults())
///     .build()
///     .unwrap();
///
/// assert_eq!(policy.delay_for(0), Duration::from_millis(50));
/// assert_eq!(policy.delay_for(1), Duration::from_millis(100));
/// assert_eq!(policy.delay_for(10), Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    use_backoff: bool,
    max_delay: Option<Duration>,
    classifier: FailureClassifier,
    attempt_timeout: Option<Duration>,
}

impl RetryPolicy {
    /// Start building a policy
    pub fn builder(max_attempts: u32, base_delay: Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(max_attempts, base_delay)
    }

    /// Policy that runs the operation exactly once
    pub fn single_attempt(classifier: FailureClassifier) -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            use_backoff: false,
            max_delay: None,
            classifier,
            attempt_timeout: None,
        }
    }

    /// Total attempts, including the first
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the first retry
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Whether delays double on each retry
    pub fn use_backoff(&self) -> bool {
        self.use_backoff
    }

    /// Upper bound on a single backoff delay
    pub fn max_delay(&self) -> Option<Duration> {
        self.max_delay
    }

    /// Classifier deciding which errors are retried
    pub fn classifier(&self) -> &FailureClassifier {
        &self.classifier
    }

    /// Deadline applied to each attempt
    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout
    }

    /// Delay after the failed attempt with zero-based index `attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = if self.use_backoff {
            2u32.checked_pow(attempt)
                .and_then(|factor| self.base_delay.checked_mul(factor))
                .unwrap_or(Duration::MAX)
        } else {
            self.base_delay
        };
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts must be at least 1"));
        }
        if let Some(cap) = self.max_delay {
            if cap < self.base_delay {
                return Err(ConfigError::invalid("max_delay must not be less than base_delay"));
            }
        }
        if self.attempt_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::invalid("attempt_timeout must be greater than zero"));
        }
        Ok(())
    }
}

/// Builder for [`RetryPolicy`]
#[derive(Debug)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            policy: RetryPolicy {
                max_attempts,
                base_delay,
                use_backoff: false,
                max_delay: None,
                classifier: FailureClassifier::none(),
                attempt_timeout: None,
            },
        }
    }

    /// Double the delay after every failed attempt, up to `max_delay`
    pub fn exponential_backoff(mut self, max_delay: Duration) -> Self {
        self.policy.use_backoff = true;
        self.policy.max_delay = Some(max_delay);
        self
    }

    /// Toggle doubling without changing the cap
    pub fn use_backoff(mut self, enabled: bool) -> Self {
        self.policy.use_backoff = enabled;
        self
    }

    /// Cap every delay at `max_delay`
    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.policy.max_delay = Some(max_delay);
        self
    }

    pub fn classifier(mut self, classifier: FailureClassifier) -> Self {
        self.policy.classifier = classifier;
        self
    }

    /// Bound every attempt with its own deadline
    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.policy.attempt_timeout = Some(timeout);
        self
    }

    /// Validate and build
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when `max_attempts` is zero, the cap
    /// is below the base delay, or the attempt timeout is zero.
    pub fn build(self) -> ConfigResult<RetryPolicy> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}

/// Outcome of a retry execution including summary statistics
#[derive(Debug)]
pub struct RetryOutcome<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub result: ResilienceResult<T, E>,
    /// Attempts actually made
    pub attempts: u32,
    /// Time spent sleeping between attempts
    pub total_delay: Duration,
}

impl<T, E> RetryOutcome<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Consume the outcome and return only the result
    pub fn into_result(self) -> ResilienceResult<T, E> {
        self.result
    }

    /// Average sleep between attempts
    pub fn average_delay(&self) -> Duration {
        if self.attempts <= 1 {
            return Duration::ZERO;
        }
        self.total_delay / (self.attempts - 1)
    }
}

/// Runs operations under a [`RetryPolicy`]
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    guard: TimeoutGuard,
    sink: SharedSink,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(noop_sink())
    }
}

impl RetryExecutor {
    /// Create an executor reporting to `sink`
    pub fn new(sink: SharedSink) -> Self {
        Self { guard: TimeoutGuard::new(sink.clone()), sink }
    }

    /// Execute `op` with retries
    ///
    /// # Errors
    ///
    /// - the classified error, unchanged, when it is not retryable or the
    ///   policy allows a single attempt
    /// - [`ResilienceError::RetriesExhausted`] carrying the last error when
    ///   every attempt failed transiently
    /// - [`ResilienceError::Cancelled`] when `ctx` fires
    #[instrument(skip_all, fields(max_attempts = policy.max_attempts()))]
    pub async fn execute<F, Fut, T, E>(
        &self,
        ctx: &CancellationToken,
        op: F,
        policy: &RetryPolicy,
    ) -> ResilienceResult<T, E>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.execute_with_outcome(ctx, op, policy).await.into_result()
    }

    /// Execute `op` with retries and return outcome statistics
    pub async fn execute_with_outcome<F, Fut, T, E>(
        &self,
        ctx: &CancellationToken,
        mut op: F,
        policy: &RetryPolicy,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let classifier = policy.classifier();
        let mut attempts = 0u32;
        let mut total_delay = Duration::ZERO;

        loop {
            let max_attempts = policy.max_attempts();
            debug!(attempt = attempts + 1, max_attempts, "executing attempt");

            let result = {
                let op = &mut op;
                let attempt = move |token: CancellationToken| {
                    let fut = op(token);
                    async move { fut.await.map_err(|e| classifier.classify(e)) }
                };
                match policy.attempt_timeout() {
                    Some(timeout) => self.guard.with_timeout(ctx, timeout, attempt).await,
                    None => self.guard.contain(ctx, attempt).await,
                }
            };
            attempts += 1;

            let error = match result {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(attempts, "operation succeeded after retries");
                    }
                    return RetryOutcome { result: Ok(value), attempts, total_delay };
                }
                Err(error) => error,
            };

            if !error.is_transient() {
                debug!(attempts, error = %error, "not retrying");
                return RetryOutcome { result: Err(error), attempts, total_delay };
            }

            if attempts >= policy.max_attempts() {
                if attempts == 1 {
                    return RetryOutcome { result: Err(error), attempts, total_delay };
                }
                warn!(attempts, error = %error, "retry attempts exhausted");
                let last = Box::new(error);
                let result = Err(ResilienceError::RetriesExhausted { attempts, last });
                return RetryOutcome { result, attempts, total_delay };
            }

            let delay = policy.delay_for(attempts - 1);
            self.sink.record(&ResilienceEvent::RetryAttempted {
                attempt: attempts,
                delay,
                error: error.to_string(),
            });

            tokio::select! {
                biased;
                () = ctx.cancelled() => {
                    let result = Err(ResilienceError::Cancelled);
                    return RetryOutcome { result, attempts, total_delay };
                }
                () = tokio::time::sleep(delay) => {}
            }
            total_delay += delay;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use tokio::time::Instant;

    use super::*;
    use crate::error::ErrorKind;
    use crate::observability::events::tests::RecordingSink;

    fn driver_bug() -> Result<(), io::Error> {
        panic!("driver bug")
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::builder(max_attempts, Duration::from_millis(100))
            .classifier(FailureClassifier::database_defaults())
            .build()
            .unwrap()
    }

    #[test]
    fn test_zero_attempts_is_rejected() {
        let err = RetryPolicy::builder(0, Duration::ZERO).build().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_cap_below_base_is_rejected() {
        let err = RetryPolicy::builder(3, Duration::from_secs(2))
            .max_delay(Duration::from_secs(1))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("max_delay"));
    }

    #[test]
    fn test_fixed_delay_without_backoff() {
        let policy = policy(5);
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(4), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_saturates() {
        let policy =
            RetryPolicy::builder(3, Duration::from_millis(10)).use_backoff(true).build().unwrap();
        assert_eq!(policy.delay_for(3), Duration::from_millis(80));
        assert_eq!(policy.delay_for(40), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_error_uses_every_attempt() {
        let sink = Arc::new(RecordingSink::default());
        let executor = RetryExecutor::new(sink.clone());
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let counter = Arc::clone(&calls);
        let outcome = executor
            .execute_with_outcome(
                &CancellationToken::new(),
                |_token| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(io::Error::other("connection refused"))
                    }
                },
                &policy(3),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.total_delay, Duration::from_millis(200));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(outcome.average_delay(), Duration::from_millis(100));
        assert_eq!(sink.count("retry_attempted"), 2);

        match outcome.into_result() {
            Err(ResilienceError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, ResilienceError::RetryableDependency { .. }));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_runs_once() {
        let executor = RetryExecutor::default();
        let calls = AtomicU32::new(0);

        let result: ResilienceResult<(), io::Error> = executor
            .execute(
                &CancellationToken::new(),
                |_token| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(io::Error::other("permission denied for relation users")) }
                },
                &policy(5),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(ResilienceError::NonRetryableDependency { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_on_second_attempt() {
        let executor = RetryExecutor::default();
        let calls = AtomicU32::new(0);

        let result = executor
            .execute(
                &CancellationToken::new(),
                |_token| {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n == 0 {
                            Err(io::Error::other("deadlock detected"))
                        } else {
                            Ok("row")
                        }
                    }
                },
                &policy(3),
            )
            .await;

        assert_eq!(result.unwrap(), "row");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_passes_error_through() {
        let executor = RetryExecutor::default();
        let single = RetryPolicy::single_attempt(FailureClassifier::database_defaults());

        let result: ResilienceResult<(), io::Error> = executor
            .execute(
                &CancellationToken::new(),
                |_token| async { Err(io::Error::other("connection reset by peer")) },
                &single,
            )
            .await;

        assert!(matches!(result, Err(ResilienceError::RetryableDependency { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeouts_are_retried() {
        let executor = RetryExecutor::default();
        let policy = RetryPolicy::builder(2, Duration::from_millis(10))
            .attempt_timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let calls = AtomicU32::new(0);

        let result: ResilienceResult<(), io::Error> = executor
            .execute(
                &CancellationToken::new(),
                |_token| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        Ok(())
                    }
                },
                &policy,
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RetriesExhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_backoff() {
        let executor = RetryExecutor::default();
        let ctx = CancellationToken::new();
        let policy = RetryPolicy::builder(5, Duration::from_secs(60))
            .classifier(FailureClassifier::database_defaults())
            .build()
            .unwrap();

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let outcome = executor
            .execute_with_outcome(
                &ctx,
                |_token| async { Err::<(), _>(io::Error::other("connection refused")) },
                &policy,
            )
            .await;

        assert_eq!(outcome.attempts, 1);
        assert!(matches!(outcome.result, Err(ResilienceError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_panicking_attempt_is_not_retried() {
        let executor = RetryExecutor::default();
        let calls = AtomicU32::new(0);

        let result: ResilienceResult<(), io::Error> = executor
            .execute(
                &CancellationToken::new(),
                |_token| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { driver_bug() }
                },
                &policy(3),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Panicked);
    }
}
