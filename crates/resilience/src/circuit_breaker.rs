//! Circuit breaker for a named dependency
//!
//! The breaker counts failures reported by the layers beneath it. Once
//! `failure_threshold` is reached it opens and short-circuits every call
//! until `reset_timeout` has passed since the last failure. The next call
//! then runs as a trial in the half-open state: `half_open_success_threshold`
//! consecutive successes close the circuit, any failure reopens it.
//!
//! In the closed state a success decays the failure count by one instead of
//! clearing it, so a dependency failing every other call still trips the
//! breaker eventually.

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, ConfigResult, ResilienceError, ResilienceResult};
use crate::observability::{noop_sink, ResilienceEvent, SharedSink};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow through and failures are counted
    Closed,
    /// Calls are rejected without reaching the dependency
    Open,
    /// Trial calls are let through to test recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Failures (net of decay) that open the circuit
    pub failure_threshold: u64,
    /// Time after the last failure before a trial call is allowed
    pub reset_timeout: Duration,
    /// Consecutive trial successes needed to close the circuit
    pub half_open_success_threshold: u64,
    /// Ceiling on the retained failure count
    pub max_sample_size: u64,
}

impl CircuitBreakerConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a threshold is zero or
    /// `max_sample_size` is below `failure_threshold` (the circuit could
    /// never open).
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold must be greater than 0"));
        }
        if self.half_open_success_threshold == 0 {
            return Err(ConfigError::invalid("half_open_success_threshold must be greater than 0"));
        }
        if self.max_sample_size < self.failure_threshold {
            return Err(ConfigError::invalid(
                "max_sample_size must be at least failure_threshold",
            ));
        }
        Ok(())
    }
}

/// Circuit breaker metrics for monitoring
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub failure_count: u64,
    pub success_count: u64,
    pub total_calls: u64,
    pub rejected_calls: u64,
    pub last_failure_time: Option<Instant>,
    pub state_change_time: Instant,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u64,
    success_count: u64,
    total_calls: u64,
    rejected_calls: u64,
    last_failure_time: Option<Instant>,
    state_change_time: Instant,
}

impl BreakerState {
    fn transition(&mut self, to: CircuitState, now: Instant) {
        self.state = to;
        self.state_change_time = now;
        self.success_count = 0;
        if to == CircuitState::Closed {
            self.failure_count = 0;
        }
    }
}

/// Circuit breaker guarding one logical dependency
///
/// All state lives behind a single mutex that is never held across the
/// wrapped operation.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use bulwark_resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
///
/// let breaker = CircuitBreaker::new(
///     "orders-db",
///     CircuitBreakerConfig {
///         failure_threshold: 2,
///         reset_timeout: Duration::from_secs(5),
///         half_open_success_threshold: 1,
///         max_sample_size: 10,
///     },
/// )
/// .unwrap();
///
/// breaker.record_failure();
/// breaker.record_failure();
/// assert_eq!(breaker.state(), CircuitState::Open);
/// assert!(breaker.try_acquire().is_err());
/// ```
pub struct CircuitBreaker<C: Clock = SystemClock> {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    clock: C,
    sink: SharedSink,
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &inner.state)
            .field("failure_count", &inner.failure_count)
            .field("success_count", &inner.success_count)
            .finish()
    }
}

impl CircuitBreaker<SystemClock> {
    /// Create a breaker on the system clock
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the configuration is invalid.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(name, config, SystemClock)
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a breaker with a custom clock (useful for testing)
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the configuration is invalid.
    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: C,
    ) -> ConfigResult<Self> {
        config.validate()?;
        let now = clock.now();
        Ok(Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                total_calls: 0,
                rejected_calls: 0,
                last_failure_time: None,
                state_change_time: now,
            }),
            clock,
            sink: noop_sink(),
        })
    }

    /// Report transitions to `sink`
    #[must_use]
    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    /// Dependency name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Active configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `op` if the circuit admits it and record the outcome
    ///
    /// Errors that say nothing about the dependency's health (cancellation,
    /// upstream rejections) are recorded as neither success nor failure.
    ///
    /// # Errors
    ///
    /// Returns [`ResilienceError::CircuitOpen`] without invoking `op` while
    /// open, otherwise whatever `op` returns.
    #[instrument(skip_all, fields(circuit = %self.name))]
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ResilienceResult<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        if let Err(retry_after) = self.try_acquire() {
            debug!(retry_after_ms = retry_after.as_millis() as u64, "circuit rejecting call");
            return Err(ResilienceError::CircuitOpen { name: self.name.clone(), retry_after });
        }

        let result = op().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(error) if error.counts_as_failure() => self.record_failure(),
            Err(error) => debug!(error = %error, "outcome not recorded"),
        }
        result
    }

    /// Ask for admission, moving Open to HalfOpen once the reset timeout
    /// has elapsed
    ///
    /// # Errors
    ///
    /// Returns the time remaining until a trial call will be admitted.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.total_calls += 1;

        if inner.state != CircuitState::Open {
            return Ok(());
        }

        let since = inner.last_failure_time.unwrap_or(inner.state_change_time);
        let elapsed = now.saturating_duration_since(since);
        if elapsed < self.config.reset_timeout {
            inner.rejected_calls += 1;
            return Err(self.config.reset_timeout - elapsed);
        }

        inner.transition(CircuitState::HalfOpen, now);
        drop(inner);

        info!(circuit = %self.name, "circuit half-open, admitting trial call");
        self.sink.record(&ResilienceEvent::CircuitHalfOpened { name: self.name.clone() });
        Ok(())
    }

    /// Record a successful operation
    pub fn record_success(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = inner.failure_count.saturating_sub(1);
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                let successes = inner.success_count;
                if successes >= self.config.half_open_success_threshold {
                    inner.transition(CircuitState::Closed, now);
                    drop(inner);

                    info!(circuit = %self.name, successes, "circuit closed");
                    self.sink.record(&ResilienceEvent::CircuitClosed { name: self.name.clone() });
                }
            }
            CircuitState::Open => {
                debug!(circuit = %self.name, "success from a call admitted before opening");
            }
        }
    }

    /// Record a failed operation
    pub fn record_failure(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.last_failure_time = Some(now);

        let opened = match inner.state {
            CircuitState::Closed => {
                inner.failure_count = (inner.failure_count + 1).min(self.config.max_sample_size);
                if inner.failure_count >= self.config.failure_threshold {
                    inner.transition(CircuitState::Open, now);
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                inner.transition(CircuitState::Open, now);
                true
            }
            CircuitState::Open => false,
        };

        if opened {
            let failures = inner.failure_count;
            drop(inner);

            warn!(circuit = %self.name, failures, "circuit opened");
            self.sink.record(&ResilienceEvent::CircuitOpened { name: self.name.clone(), failures });
        }
    }

    /// Get the current state of the circuit breaker
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Get current metrics snapshot
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        CircuitBreakerMetrics {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_calls: inner.total_calls,
            rejected_calls: inner.rejected_calls,
            last_failure_time: inner.last_failure_time,
            state_change_time: inner.state_change_time,
        }
    }

    /// Force the circuit closed (operator action)
    pub fn reset(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let previous = inner.state;
        inner.transition(CircuitState::Closed, now);
        inner.last_failure_time = None;
        drop(inner);

        info!(circuit = %self.name, %previous, "circuit breaker manually reset to closed state");
        if previous != CircuitState::Closed {
            self.sink.record(&ResilienceEvent::CircuitClosed { name: self.name.clone() });
        }
    }
}
