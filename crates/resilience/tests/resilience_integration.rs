//! Integration tests for the individual resilience layers
//!
//! Exercises the breaker, retry, bulkhead, timeout and stale cache through
//! the public API only.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bulwark_resilience::{
    Bulkhead, BulkheadConfig, CircuitBreaker, CircuitBreakerConfig, CircuitState, ErrorKind,
    FailureClassifier, MockClock, Origin, ResilienceError, ResilienceResult, RetryExecutor,
    RetryPolicy, StaleCache, TimeoutGuard,
};
use tokio_util::sync::CancellationToken;

/// Custom error type for testing
#[derive(Debug, Clone)]
struct TestError {
    message: String,
}

impl TestError {
    fn new(message: &str) -> Self {
        Self { message: message.to_string() }
    }
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TestError {}

type TestResult<T> = ResilienceResult<T, TestError>;

fn dependency_failure() -> TestResult<()> {
    Err(ResilienceError::NonRetryableDependency { source: TestError::new("connection refused") })
}

fn breaker(clock: &MockClock, failure_threshold: u64) -> CircuitBreaker<MockClock> {
    let config = CircuitBreakerConfig {
        failure_threshold,
        reset_timeout: Duration::from_secs(5),
        half_open_success_threshold: 2,
        max_sample_size: 10,
    };
    CircuitBreaker::with_clock("integration-db", config, clock.clone()).expect("valid config")
}

/// Validates that an open breaker never invokes the operation before its
/// reset timeout.
///
/// # Test Steps
/// 1. Trip a breaker with `failure_threshold` consecutive failures
/// 2. Issue calls just before `reset_timeout` elapses
/// 3. Verify every call is rejected with `CircuitOpen` and the op never runs
/// 4. Advance past `reset_timeout` and verify the op runs again
#[tokio::test]
async fn test_open_breaker_does_not_invoke_operation() {
    let clock = MockClock::new();
    let breaker = breaker(&clock, 3);
    let invoked = AtomicU32::new(0);

    for _ in 0..3 {
        let _ = breaker.execute(|| async { dependency_failure() }).await;
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    clock.advance(Duration::from_millis(4_900));
    for _ in 0..5 {
        let result = breaker
            .execute(|| {
                invoked.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, ResilienceError<TestError>>(()) }
            })
            .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::CircuitOpen);
    }
    assert_eq!(invoked.load(Ordering::SeqCst), 0);

    clock.advance(Duration::from_millis(100));
    let result = breaker
        .execute(|| {
            invoked.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, ResilienceError<TestError>>(()) }
        })
        .await;
    assert!(result.is_ok());
    assert_eq!(invoked.load(Ordering::SeqCst), 1);
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
}

/// Validates half-open strictness: one failure reopens the circuit even
/// after trial successes.
///
/// # Test Steps
/// 1. Trip the breaker and wait out the reset timeout
/// 2. Succeed once in HalfOpen (threshold is 2, so it stays HalfOpen)
/// 3. Fail once and verify the breaker is Open again
#[tokio::test]
async fn test_half_open_failure_reopens() {
    let clock = MockClock::new();
    let breaker = breaker(&clock, 2);

    for _ in 0..2 {
        let _ = breaker.execute(|| async { dependency_failure() }).await;
    }
    clock.advance_secs(5);

    let ok: TestResult<()> = breaker.execute(|| async { Ok(()) }).await;
    assert!(ok.is_ok());
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    let _ = breaker.execute(|| async { dependency_failure() }).await;
    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(breaker.metrics().total_calls, 4);
}

/// Validates isolated failures decay instead of accumulating forever.
///
/// # Test Steps
/// 1. Alternate one failure and one success many times
/// 2. Verify the breaker never opens with a threshold of 2
#[tokio::test]
async fn test_isolated_failures_self_heal() {
    let clock = MockClock::new();
    let breaker = breaker(&clock, 2);

    for _ in 0..10 {
        let _ = breaker.execute(|| async { dependency_failure() }).await;
        let _: TestResult<()> = breaker.execute(|| async { Ok(()) }).await;
    }

    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.metrics().failure_count, 0);
}

/// Validates the retry bound for retryable and non-retryable errors.
///
/// # Test Steps
/// 1. Run an always-failing transient operation with `max_attempts = 4`
/// 2. Verify exactly 4 invocations and `RetriesExhausted` with the last error
/// 3. Run a non-retryable failure and verify exactly 1 invocation
#[tokio::test(start_paused = true)]
async fn test_retry_attempt_bound() {
    let policy = RetryPolicy::builder(4, Duration::from_millis(5))
        .exponential_backoff(Duration::from_millis(50))
        .classifier(FailureClassifier::database_defaults())
        .build()
        .expect("valid policy");
    let executor = RetryExecutor::default();
    let ctx = CancellationToken::new();

    let attempts = AtomicU32::new(0);
    let err = executor
        .execute(
            &ctx,
            |_token| {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Err::<(), _>(TestError::new(&format!("deadlock detected #{n}"))) }
            },
            &policy,
        )
        .await
        .unwrap_err();

    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    match &err {
        ResilienceError::RetriesExhausted { attempts, .. } => assert_eq!(*attempts, 4),
        other => panic!("expected exhaustion, got {other:?}"),
    }
    let last = err.dependency_error().map(ToString::to_string);
    assert_eq!(last.as_deref(), Some("deadlock detected #4"));

    let attempts = AtomicU32::new(0);
    let err = executor
        .execute(
            &ctx,
            |_token| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(TestError::new("violates foreign key constraint")) }
            },
            &policy,
        )
        .await
        .unwrap_err();

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(matches!(err, ResilienceError::NonRetryableDependency { .. }));
}

/// Validates bulkhead capacity, queueing and immediate rejection.
///
/// # Test Steps
/// 1. Start `max_concurrent + max_waiting` slow calls on a 2 + 3 bulkhead
/// 2. Verify 2 are in flight and 3 are queued
/// 3. Verify one more call is rejected without blocking
/// 4. Let everything finish and verify concurrency never exceeded 2
#[tokio::test(start_paused = true)]
async fn test_bulkhead_capacity_under_load() {
    let bulkhead = Arc::new(
        Bulkhead::new(BulkheadConfig { name: "reports".into(), max_concurrent: 2, max_waiting: 3 })
            .expect("valid config"),
    );
    let ctx = CancellationToken::new();
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..5 {
        let bulkhead = Arc::clone(&bulkhead);
        let ctx = ctx.clone();
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        handles.push(tokio::spawn(async move {
            bulkhead
                .execute(&ctx, move || async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, ResilienceError<TestError>>(())
                })
                .await
        }));
    }

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(bulkhead.in_flight(), 2);
    assert_eq!(bulkhead.waiting(), 3);

    let rejected: TestResult<()> = bulkhead.execute(&ctx, || async { Ok(()) }).await;
    assert_eq!(rejected.unwrap_err().kind(), ErrorKind::BulkheadRejected);

    for handle in handles {
        handle.await.expect("task completes").expect("admitted call succeeds");
    }
    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert_eq!(bulkhead.metrics().rejected_operations, 1);
    assert_eq!(bulkhead.in_flight(), 0);
}

/// Validates that failing calls release their slots.
///
/// # Test Steps
/// 1. Issue `max_concurrent` failing calls one after another
/// 2. Verify none hangs and a following call is admitted
#[tokio::test]
async fn test_bulkhead_releases_after_failures() {
    let bulkhead =
        Bulkhead::new(BulkheadConfig { name: "writes".into(), max_concurrent: 3, max_waiting: 0 })
            .expect("valid config");
    let ctx = CancellationToken::new();

    for _ in 0..3 {
        let result = bulkhead.execute(&ctx, || async { dependency_failure() }).await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Dependency);
    }

    let result: TestResult<&str> = bulkhead.execute(&ctx, || async { Ok("admitted") }).await;
    assert_eq!(result.expect("slot available"), "admitted");
}

/// Validates that the timeout fires at the deadline even for operations
/// that ignore cancellation.
///
/// # Test Steps
/// 1. Run an operation that sleeps 10s without watching its token
/// 2. Use a 250ms deadline
/// 3. Verify `Timeout` is returned at ~250ms and the token was cancelled
#[tokio::test(start_paused = true)]
async fn test_timeout_ignores_stubborn_operation() {
    let guard = TimeoutGuard::default();
    let ctx = CancellationToken::new();
    let seen = Arc::new(parking_lot::Mutex::new(None::<CancellationToken>));
    let seen_in_op = Arc::clone(&seen);

    let started = tokio::time::Instant::now();
    let result: TestResult<()> = guard
        .with_timeout(&ctx, Duration::from_millis(250), move |token| async move {
            *seen_in_op.lock() = Some(token);
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;

    assert!(matches!(
        result,
        Err(ResilienceError::Timeout { timeout }) if timeout == Duration::from_millis(250)
    ));
    assert!(started.elapsed() < Duration::from_secs(1));
    let token = seen.lock().take().expect("operation started");
    assert!(token.is_cancelled());
    assert!(!ctx.is_cancelled());
}

/// Validates the stale window boundaries.
///
/// # Test Steps
/// 1. Populate "v1" at t0 with ttl 1s and stale ttl 60s
/// 2. At t0+2s a failed fetch returns "v1"
/// 3. In a second cache populated the same way, at t0+61s a failed fetch
///    returns the fetch error
#[tokio::test]
async fn test_stale_window_boundaries() {
    let (ttl, stale_ttl) = (Duration::from_secs(1), Duration::from_secs(60));
    let ctx = CancellationToken::new();

    for (offset, expect_stale) in [(2, true), (61, false)] {
        let clock = MockClock::new();
        let cache: StaleCache<String, MockClock> = StaleCache::with_clock(clock.clone());
        let first: TestResult<String> =
            cache.get_or_set(&ctx, "k", ttl, stale_ttl, || async { Ok("v1".to_string()) }).await;
        assert_eq!(first.expect("populated"), "v1");

        clock.advance_secs(offset);
        let result = cache
            .get_or_fetch(&ctx, "k", ttl, stale_ttl, || async {
                Err(ResilienceError::RetryableDependency { source: TestError::new("timed out") })
            })
            .await;

        if expect_stale {
            let cached = result.expect("stale value served");
            assert_eq!(cached.value, "v1");
            assert_eq!(cached.origin, Origin::Stale);
        } else {
            let err = result.unwrap_err();
            assert_eq!(err.to_string(), "transient dependency failure: timed out");
        }
    }
}

/// Validates repeated refreshes return the same value and move `stored_at`
/// forward.
///
/// # Test Steps
/// 1. Fetch the same value twice with an expired ttl in between
/// 2. Verify both calls return the value and the entry's age resets
#[tokio::test]
async fn test_refresh_is_idempotent_and_monotonic() {
    let clock = MockClock::new();
    let cache: StaleCache<u64, MockClock> = StaleCache::with_clock(clock.clone());
    let ctx = CancellationToken::new();
    let (ttl, stale_ttl) = (Duration::from_secs(1), Duration::from_secs(10));

    let first: TestResult<u64> =
        cache.get_or_set(&ctx, "n", ttl, stale_ttl, || async { Ok(42) }).await;
    clock.advance_secs(3);
    assert_eq!(cache.peek("n").expect("entry present").age, Duration::from_secs(3));

    let second: TestResult<u64> =
        cache.get_or_set(&ctx, "n", ttl, stale_ttl, || async { Ok(42) }).await;
    assert_eq!(first.expect("first fetch"), second.expect("second fetch"));
    assert_eq!(cache.peek("n").expect("entry present").age, Duration::ZERO);
    assert_eq!(cache.stats().inserts, 2);
}
