//! Structured resilience events and the sinks that receive them
//!
//! Every layer reports what it did through an [`EventSink`]. The core
//! behaves identically with [`NoopSink`]; sinks exist purely for logging
//! and metrics.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

/// Something noteworthy a resilience layer did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResilienceEvent {
    /// A failed attempt will be retried after `delay`
    RetryAttempted { attempt: u32, delay: Duration, error: String },
    /// The breaker tripped
    CircuitOpened { name: String, failures: u64 },
    /// The breaker let a trial call through
    CircuitHalfOpened { name: String },
    /// The breaker recovered
    CircuitClosed { name: String },
    /// A caller was turned away by a bulkhead
    BulkheadRejected { name: String, in_flight: usize, waiting: usize },
    /// A cached value past its fresh TTL was served after a failed fetch
    StaleServed { key: String, age: Duration },
    /// A deadline fired before the operation finished
    TimeoutExceeded { timeout: Duration },
    /// A fresh cached value was served without a fetch
    CacheHit { key: String },
    /// No fresh cached value was available
    CacheMiss { key: String },
}

impl ResilienceEvent {
    /// Stable event name
    pub const fn name(&self) -> &'static str {
        match self {
            Self::RetryAttempted { .. } => "retry_attempted",
            Self::CircuitOpened { .. } => "circuit_opened",
            Self::CircuitHalfOpened { .. } => "circuit_half_opened",
            Self::CircuitClosed { .. } => "circuit_closed",
            Self::BulkheadRejected { .. } => "bulkhead_rejected",
            Self::StaleServed { .. } => "stale_served",
            Self::TimeoutExceeded { .. } => "timeout_exceeded",
            Self::CacheHit { .. } => "cache_hit",
            Self::CacheMiss { .. } => "cache_miss",
        }
    }
}

impl fmt::Display for ResilienceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Receiver of resilience events
///
/// Implementations must be cheap and must never block: they are called
/// inline on the request path.
pub trait EventSink: Send + Sync + fmt::Debug {
    /// Handle one event
    fn record(&self, event: &ResilienceEvent);
}

/// Shared, type-erased sink handle
pub type SharedSink = Arc<dyn EventSink>;

impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    fn record(&self, event: &ResilienceEvent) {
        (**self).record(event);
    }
}

/// Sink that drops every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn record(&self, _event: &ResilienceEvent) {}
}

/// Convenience constructor for a shared [`NoopSink`]
pub fn noop_sink() -> SharedSink {
    Arc::new(NoopSink)
}

/// Sink that writes each event as a structured `tracing` record
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: &ResilienceEvent) {
        let name = event.name();
        match event {
            ResilienceEvent::RetryAttempted { attempt, delay, error } => {
                let delay_ms = delay.as_millis() as u64;
                warn!(event = name, attempt, delay_ms, %error, "retrying operation");
            }
            ResilienceEvent::CircuitOpened { name: circuit, failures } => {
                warn!(event = name, circuit = %circuit, failures, "circuit opened");
            }
            ResilienceEvent::CircuitHalfOpened { name: circuit } => {
                info!(event = name, circuit = %circuit, "circuit half-open");
            }
            ResilienceEvent::CircuitClosed { name: circuit } => {
                info!(event = name, circuit = %circuit, "circuit closed");
            }
            ResilienceEvent::BulkheadRejected { name: bulkhead, in_flight, waiting } => {
                warn!(event = name, %bulkhead, in_flight, waiting, "bulkhead rejected call");
            }
            ResilienceEvent::StaleServed { key, age } => {
                let age_ms = age.as_millis() as u64;
                warn!(event = name, %key, age_ms, "serving stale value");
            }
            ResilienceEvent::TimeoutExceeded { timeout } => {
                warn!(event = name, timeout_ms = timeout.as_millis() as u64, "deadline exceeded");
            }
            ResilienceEvent::CacheHit { key } | ResilienceEvent::CacheMiss { key } => {
                debug!(event = name, key = %key);
            }
        }
    }
}

/// Sink that forwards to several sinks in order
#[derive(Debug, Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<SharedSink>,
}

impl FanoutSink {
    /// Create an empty fan-out
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a downstream sink
    #[must_use]
    pub fn with(mut self, sink: SharedSink) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn record(&self, event: &ResilienceEvent) {
        for sink in &self.sinks {
            sink.record(event);
        }
    }
}

/// Sink that increments `bulwark_events_total{event=...}` on the global
/// `metrics` recorder
#[cfg(feature = "metrics")]
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsFacadeSink;

#[cfg(feature = "metrics")]
impl EventSink for MetricsFacadeSink {
    fn record(&self, event: &ResilienceEvent) {
        metrics::counter!("bulwark_events_total", "event" => event.name()).increment(1);
        if let ResilienceEvent::StaleServed { age, .. } = event {
            metrics::histogram!("bulwark_stale_age_seconds").record(age.as_secs_f64());
        }
    }
}
