//! Resilient client façade
//!
//! [`ResilientClient`] composes every layer for one protected dependency and
//! exposes three operation classes:
//!
//! - `read`: fresh cache → bulkhead(read) → breaker → retry (timeout per
//!   attempt) → stale fallback on terminal failure
//! - `write`: bulkhead(write) → breaker → retry (timeout per attempt), no
//!   cache
//! - `report`: fresh cache → bulkhead(report) → breaker → single attempt
//!   under the longest timeout → stale fallback
//!
//! Each class has its own bulkhead so a burst of reports cannot starve
//! interactive reads. All classes share the dependency's circuit breaker.
//!
//! # Examples
//!
//! ```
//! use bulwark_resilience::config::ResilienceConfig;
//! use bulwark_resilience::ResilientClient;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ResilienceConfig::default();
//! let client: ResilientClient<String> = ResilientClient::from_config(config)?;
//! let ctx = CancellationToken::new();
//!
//! let name = client
//!     .read(&ctx, "user:42:name", |_token| async { Ok::<_, std::io::Error>("alice".to_string()) })
//!     .await?;
//! assert_eq!(name.value, "alice");
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::bulkhead::{Bulkhead, BulkheadMetrics};
use crate::cache::{CacheStats, Cached, StaleCache};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerMetrics, CircuitState};
use crate::clock::{Clock, SystemClock};
use crate::config::{ClassConfig, OperationClass, ResilienceConfig, TimeoutMode};
use crate::error::{ConfigResult, ResilienceError, ResilienceResult};
use crate::observability::{FanoutSink, MetricsRecorder, MetricsSnapshot, SharedSink, TracingSink};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::timeout::TimeoutGuard;

/// Per-class wiring: tuning, retry policy and bulkhead
struct Lane {
    class: OperationClass,
    config: ClassConfig,
    policy: RetryPolicy,
    bulkhead: Bulkhead,
}

impl Lane {
    fn new(class: OperationClass, config: &ClassConfig, sink: &SharedSink) -> ConfigResult<Self> {
        config.validate(class)?;
        Ok(Self {
            class,
            config: config.clone(),
            policy: config.retry_policy()?,
            bulkhead: Bulkhead::new(config.bulkhead_config(class))?.with_sink(sink.clone()),
        })
    }
}

/// Builder for [`ResilientClient`]
#[derive(Debug)]
pub struct ResilientClientBuilder<C: Clock = SystemClock> {
    config: ResilienceConfig,
    clock: C,
    sink: SharedSink,
}

impl ResilientClientBuilder<SystemClock> {
    /// Start from `config` with the system clock, logging events through
    /// `tracing`
    pub fn new(config: ResilienceConfig) -> Self {
        Self { config, clock: SystemClock, sink: Arc::new(TracingSink) }
    }
}

impl<C: Clock + Clone> ResilientClientBuilder<C> {
    /// Drive the breaker and the cache from `clock`
    pub fn clock<C2: Clock + Clone>(self, clock: C2) -> ResilientClientBuilder<C2> {
        ResilientClientBuilder { config: self.config, clock, sink: self.sink }
    }

    /// Forward resilience events to `sink` instead of `tracing`
    ///
    /// The built-in metrics recorder always receives them as well.
    #[must_use]
    pub fn sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    /// Validate the configuration and wire every layer
    ///
    /// # Errors
    ///
    /// Returns a [`crate::ConfigError`] if any section is invalid.
    pub fn build<V>(self) -> ConfigResult<ResilientClient<V, C>>
    where
        V: Clone + Send + Sync + 'static,
    {
        let Self { config, clock, sink } = self;
        config.validate()?;

        let metrics = Arc::new(MetricsRecorder::new(config.latency_window));
        let sink: SharedSink = Arc::new(FanoutSink::new().with(sink).with(metrics.clone()));

        let breaker = CircuitBreaker::with_clock(
            config.dependency.name.clone(),
            config.dependency.breaker_config(),
            clock.clone(),
        )?
        .with_sink(sink.clone());

        let cache = StaleCache::with_clock(clock)
            .with_coalescing(config.dependency.coalesce_misses)
            .with_sink(sink.clone());

        let client = ResilientClient {
            read: Lane::new(OperationClass::Read, &config.read, &sink)?,
            write: Lane::new(OperationClass::Write, &config.write, &sink)?,
            report: Lane::new(OperationClass::Report, &config.report, &sink)?,
            breaker,
            retry: RetryExecutor::new(sink.clone()),
            guard: TimeoutGuard::new(sink),
            cache,
            metrics,
        };

        debug!(dependency = %client.name(), "Resilient client ready");
        Ok(client)
    }
}

/// Resilient access to one unreliable dependency
///
/// `V` is the type of values cached by `read` and `report`.
pub struct ResilientClient<V, C: Clock = SystemClock> {
    read: Lane,
    write: Lane,
    report: Lane,
    breaker: CircuitBreaker<C>,
    retry: RetryExecutor,
    guard: TimeoutGuard,
    cache: StaleCache<V, C>,
    metrics: Arc<MetricsRecorder>,
}

impl<V> ResilientClient<V, SystemClock>
where
    V: Clone + Send + Sync + 'static,
{
    /// Build a client on the system clock, logging events through `tracing`
    ///
    /// # Errors
    ///
    /// Returns a [`crate::ConfigError`] if `config` is invalid.
    pub fn from_config(config: ResilienceConfig) -> ConfigResult<Self> {
        ResilientClientBuilder::new(config).build()
    }
}

impl<V, C> ResilientClient<V, C>
where
    V: Clone + Send + Sync + 'static,
    C: Clock,
{
    /// Read through the cache
    ///
    /// A fresh cached value is returned without touching the dependency.
    /// Otherwise `op` runs under the read bulkhead, the breaker and the read
    /// retry policy; if that fails and a value within its stale window
    /// exists, the stale value is returned instead.
    ///
    /// # Errors
    ///
    /// The tagged [`ResilienceError`] of the layer that gave up, when no
    /// stale value is available.
    #[instrument(skip_all, fields(dependency = %self.name(), class = "read", key = %key))]
    pub async fn read<F, Fut, E>(
        &self,
        ctx: &CancellationToken,
        key: &str,
        op: F,
    ) -> ResilienceResult<Cached<V>, E>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cached_call(&self.read, ctx, key, op).await
    }

    /// Run a write
    ///
    /// # Errors
    ///
    /// The tagged [`ResilienceError`] of the layer that gave up.
    #[instrument(skip_all, fields(dependency = %self.name(), class = "write"))]
    pub async fn write<F, Fut, T, E>(
        &self,
        ctx: &CancellationToken,
        op: F,
    ) -> ResilienceResult<T, E>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let started = Instant::now();
        let result = self.guarded(&self.write, ctx, op).await;
        self.observe(started, result.as_ref().err());
        result
    }

    /// Run a write and drop the named cache keys once it succeeds
    ///
    /// # Errors
    ///
    /// Same as [`ResilientClient::write`]; nothing is invalidated on error.
    pub async fn write_and_invalidate<I, K, F, Fut, T, E>(
        &self,
        ctx: &CancellationToken,
        keys: I,
        op: F,
    ) -> ResilienceResult<T, E>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let value = self.write(ctx, op).await?;
        let removed = keys.into_iter().filter(|key| self.cache.invalidate(key.as_ref())).count();
        debug!(removed, "Invalidated cache keys after write");
        Ok(value)
    }

    /// Run a heavy report query through the cache
    ///
    /// Same shape as [`ResilientClient::read`] with the report bulkhead,
    /// timeout and retry policy (a single attempt with the presets).
    ///
    /// # Errors
    ///
    /// The tagged [`ResilienceError`] of the layer that gave up, when no
    /// stale value is available.
    #[instrument(skip_all, fields(dependency = %self.name(), class = "report", key = %key))]
    pub async fn report<F, Fut, E>(
        &self,
        ctx: &CancellationToken,
        key: &str,
        op: F,
    ) -> ResilienceResult<Cached<V>, E>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cached_call(&self.report, ctx, key, op).await
    }

    async fn cached_call<F, Fut, E>(
        &self,
        lane: &Lane,
        ctx: &CancellationToken,
        key: &str,
        op: F,
    ) -> ResilienceResult<Cached<V>, E>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let started = Instant::now();
        let result = self
            .cache
            .get_or_fetch(ctx, key, lane.config.cache_ttl, lane.config.stale_ttl, || {
                self.guarded(lane, ctx, op)
            })
            .await;
        self.observe(started, result.as_ref().err());
        result
    }

    /// Bulkhead, then breaker, then retries under the class's timeout mode
    async fn guarded<F, Fut, T, E>(
        &self,
        lane: &Lane,
        ctx: &CancellationToken,
        op: F,
    ) -> ResilienceResult<T, E>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        lane.bulkhead
            .execute(ctx, move || {
                self.breaker.execute(move || async move {
                    match lane.config.timeout_mode {
                        TimeoutMode::PerAttempt => self.retry.execute(ctx, op, &lane.policy).await,
                        TimeoutMode::Cumulative => {
                            self.guard
                                .with_timeout(ctx, lane.config.timeout, |token| async move {
                                    self.retry.execute(&token, op, &lane.policy).await
                                })
                                .await
                        }
                    }
                })
            })
            .await
    }

    fn observe<E>(&self, started: Instant, error: Option<&ResilienceError<E>>)
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.metrics.record_call(started.elapsed(), error.map(ResilienceError::kind));
    }

    /// Dependency name
    pub fn name(&self) -> &str {
        self.breaker.name()
    }

    /// Current breaker state
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Breaker counters
    pub fn circuit_metrics(&self) -> CircuitBreakerMetrics {
        self.breaker.metrics()
    }

    /// Force the breaker closed
    pub fn reset_circuit(&self) {
        self.breaker.reset();
    }

    /// Bulkhead counters for one class
    pub fn bulkhead_metrics(&self, class: OperationClass) -> BulkheadMetrics {
        self.lane(class).bulkhead.metrics()
    }

    /// Call counters, event counters and latency percentiles
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Cache counters
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// The shared cache, for direct inspection or invalidation
    pub fn cache(&self) -> &StaleCache<V, C> {
        &self.cache
    }

    fn lane(&self, class: OperationClass) -> &Lane {
        match class {
            OperationClass::Read => &self.read,
            OperationClass::Write => &self.write,
            OperationClass::Report => &self.report,
        }
    }
}

impl<V, C: Clock> fmt::Debug for ResilientClient<V, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientClient")
            .field("dependency", &self.breaker.name())
            .field("circuit", &self.breaker.state())
            .field("read", &self.read.bulkhead)
            .field("write", &self.write.bulkhead)
            .field("report", &self.report.bulkhead)
            .field("cached_entries", &self.cache.len())
            .finish()
    }
}

impl fmt::Debug for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lane")
            .field("class", &self.class)
            .field("bulkhead", &self.bulkhead)
            .finish()
    }
}
