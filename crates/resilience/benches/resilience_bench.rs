//! Resilience layer benchmarks
//!
//! Hot-path costs of the breaker, classifier, bulkhead, stale cache and the
//! composed client.
//!
//! Run with: `cargo bench --bench resilience_bench -p bulwark-resilience`

use std::io;
use std::time::Duration;

use bulwark_resilience::{
    Bulkhead, BulkheadConfig, CircuitBreaker, CircuitBreakerConfig, FailureClassifier, MockClock,
    ResilienceConfig, ResilienceError, ResilientClient, RetryPolicy, StaleCache,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tokio::runtime::Builder as RuntimeBuilder;
use tokio_util::sync::CancellationToken;

type BenchResult<T> = Result<T, ResilienceError<io::Error>>;

fn build_runtime() -> tokio::runtime::Runtime {
    RuntimeBuilder::new_current_thread()
        .enable_all()
        .build()
        .expect("tokio runtime should build for benchmarks")
}

fn breaker_config(failure_threshold: u64) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold,
        reset_timeout: Duration::from_secs(60),
        half_open_success_threshold: 1,
        max_sample_size: failure_threshold,
    }
}

// ============================================================================
// Circuit Breaker Benchmarks
// ============================================================================

fn bench_circuit_breaker(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker");
    let runtime = build_runtime();

    group.bench_function("closed_success", |b| {
        let breaker = CircuitBreaker::new("bench", breaker_config(5)).expect("valid config");
        let breaker = &breaker;
        b.to_async(&runtime).iter(move || async move {
            let result: BenchResult<()> = breaker.execute(|| async { Ok(()) }).await;
            black_box(result)
        });
    });

    group.bench_function("open_short_circuit", |b| {
        let breaker = CircuitBreaker::with_clock("bench", breaker_config(1), MockClock::new())
            .expect("valid config");
        breaker.record_failure();
        let breaker = &breaker;
        b.to_async(&runtime).iter(move || async move {
            let result: BenchResult<()> = breaker.execute(|| async { Ok(()) }).await;
            black_box(result)
        });
    });

    group.finish();
}

// ============================================================================
// Classification and Backoff Benchmarks
// ============================================================================

fn bench_classifier(c: &mut Criterion) {
    let mut group = c.benchmark_group("classifier");
    let substrings = FailureClassifier::database_defaults();
    let with_regexes = FailureClassifier::database_defaults()
        .with_regexes([r"(?i)lock wait timeout", r"SQLSTATE 40[0-9]{3}"])
        .expect("valid patterns");

    for message in ["ERROR: deadlock detected", "duplicate key value violates unique constraint"] {
        group.bench_with_input(BenchmarkId::new("substrings", message), message, |b, msg| {
            b.iter(|| black_box(substrings.matches_message(msg)));
        });
        group.bench_with_input(BenchmarkId::new("regexes", message), message, |b, msg| {
            b.iter(|| black_box(with_regexes.matches_message(msg)));
        });
    }

    group.finish();
}

fn bench_backoff(c: &mut Criterion) {
    let policy = RetryPolicy::builder(10, Duration::from_millis(50))
        .exponential_backoff(Duration::from_secs(5))
        .build()
        .expect("valid policy");

    c.bench_function("retry_delay_for", |b| {
        b.iter(|| {
            for attempt in [0u32, 1, 5, 40] {
                black_box(policy.delay_for(attempt));
            }
        });
    });
}

// ============================================================================
// Bulkhead and Cache Benchmarks
// ============================================================================

fn bench_bulkhead(c: &mut Criterion) {
    let runtime = build_runtime();
    let bulkhead =
        Bulkhead::new(BulkheadConfig { name: "bench".into(), max_concurrent: 64, max_waiting: 64 })
            .expect("valid config");
    let (bulkhead, ctx) = (&bulkhead, &CancellationToken::new());

    c.bench_function("bulkhead_uncontended", |b| {
        b.to_async(&runtime).iter(move || async move {
            let result: BenchResult<()> = bulkhead.execute(ctx, || async { Ok(()) }).await;
            black_box(result)
        });
    });
}

fn bench_stale_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("stale_cache");
    let runtime = build_runtime();
    let ctx = &CancellationToken::new();
    let (ttl, stale_ttl) = (Duration::from_secs(60), Duration::from_secs(600));

    group.bench_function("fresh_hit", |b| {
        let cache: StaleCache<u64> = StaleCache::new();
        cache.insert("k", 7, ttl, stale_ttl);
        let cache = &cache;
        b.to_async(&runtime).iter(move || async move {
            let result: BenchResult<u64> =
                cache.get_or_set(ctx, "k", ttl, stale_ttl, || async { Ok(0) }).await;
            black_box(result)
        });
    });

    group.bench_function("stale_fallback", |b| {
        let cache: StaleCache<u64> = StaleCache::new();
        cache.insert("k", 7, Duration::ZERO, stale_ttl);
        let cache = &cache;
        b.to_async(&runtime).iter(move || async move {
            let result: BenchResult<u64> = cache
                .get_or_set(ctx, "k", Duration::ZERO, stale_ttl, || async {
                    Err(ResilienceError::NonRetryableDependency {
                        source: io::Error::other("connection refused"),
                    })
                })
                .await;
            black_box(result)
        });
    });

    group.finish();
}

// ============================================================================
// Client Benchmarks
// ============================================================================

fn bench_client(c: &mut Criterion) {
    let runtime = build_runtime();
    let client: ResilientClient<u64> =
        ResilientClient::from_config(ResilienceConfig::default()).expect("valid presets");
    let (client, ctx) = (&client, &CancellationToken::new());

    c.bench_function("client_write_success", |b| {
        b.to_async(&runtime).iter(move || async move {
            black_box(client.write(ctx, |_token| async { Ok::<_, io::Error>(1u64) }).await)
        });
    });
}

criterion_group!(
    benches,
    bench_circuit_breaker,
    bench_classifier,
    bench_backoff,
    bench_bulkhead,
    bench_stale_cache,
    bench_client
);
criterion_main!(benches);
