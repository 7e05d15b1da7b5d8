//! Lock-free counters and a rolling latency window
//!
//! [`MetricsRecorder`] is written once per call by the façade and once per
//! event by the layers. Writers only touch atomics, so observing the
//! metrics never slows down the request path.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use super::events::{EventSink, ResilienceEvent};
use crate::error::ErrorKind;

/// Fixed-size ring of the most recent latency samples
///
/// Recording is a single `fetch_add` plus a store; when the ring is full the
/// oldest sample is overwritten.
#[derive(Debug)]
pub struct LatencyWindow {
    samples: Box<[AtomicU64]>,
    cursor: AtomicUsize,
    recorded: AtomicU64,
}

impl LatencyWindow {
    /// Create a window holding up to `capacity` samples (at least one)
    pub fn new(capacity: usize) -> Self {
        let samples = (0..capacity.max(1)).map(|_| AtomicU64::new(0)).collect();
        Self { samples, cursor: AtomicUsize::new(0), recorded: AtomicU64::new(0) }
    }

    /// Maximum number of retained samples
    pub fn capacity(&self) -> usize {
        self.samples.len()
    }

    /// Record one latency sample
    pub fn record(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        let slot = self.cursor.fetch_add(1, Ordering::Relaxed) % self.samples.len();
        self.samples[slot].store(micros, Ordering::Relaxed);
        self.recorded.fetch_add(1, Ordering::Relaxed);
    }

    /// Summarize the retained samples
    pub fn summary(&self) -> LatencySummary {
        let recorded = self.recorded.load(Ordering::Relaxed);
        let filled = usize::try_from(recorded).unwrap_or(usize::MAX).min(self.samples.len());
        if filled == 0 {
            return LatencySummary::default();
        }

        let mut values: Vec<u64> =
            self.samples[..filled].iter().map(|s| s.load(Ordering::Relaxed)).collect();
        values.sort_unstable();

        let percentile = |pct: usize| -> Duration {
            // nearest-rank
            let rank = (pct * filled).div_ceil(100).clamp(1, filled);
            Duration::from_micros(values[rank - 1])
        };

        LatencySummary {
            samples: filled,
            p50: percentile(50),
            p95: percentile(95),
            p99: percentile(99),
            max: Duration::from_micros(values[filled - 1]),
        }
    }
}

/// Percentiles over the latency window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencySummary {
    /// Number of samples summarized
    pub samples: usize,
    /// Median latency
    pub p50: Duration,
    /// 95th percentile
    pub p95: Duration,
    /// 99th percentile
    pub p99: Duration,
    /// Slowest retained sample
    pub max: Duration,
}

/// Point-in-time view of a [`MetricsRecorder`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub circuit_trips: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub stale_served: u64,
    pub bulkhead_rejections: u64,
    pub circuit_rejections: u64,
    pub latency: LatencySummary,
}

impl MetricsSnapshot {
    /// Fraction of calls that succeeded (0.0 when there were no calls)
    pub fn success_rate(&self) -> f64 {
        if self.calls == 0 {
            return 0.0;
        }
        self.successes as f64 / self.calls as f64
    }

    /// Fraction of cache lookups that were fresh hits
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / total as f64
    }
}

/// Counters plus latency window, fed by events and per-call outcomes
#[derive(Debug)]
pub struct MetricsRecorder {
    calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
    circuit_trips: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    stale_served: AtomicU64,
    bulkhead_rejections: AtomicU64,
    circuit_rejections: AtomicU64,
    latency: LatencyWindow,
}

impl MetricsRecorder {
    /// Create a recorder with a latency window of `window` samples
    pub fn new(window: usize) -> Self {
        Self {
            calls: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            circuit_trips: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            stale_served: AtomicU64::new(0),
            bulkhead_rejections: AtomicU64::new(0),
            circuit_rejections: AtomicU64::new(0),
            latency: LatencyWindow::new(window),
        }
    }

    /// Record the outcome of one façade call
    ///
    /// `failure` is `None` for a success (including a stale fallback).
    pub fn record_call(&self, latency: Duration, failure: Option<ErrorKind>) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.latency.record(latency);
        match failure {
            None => {
                self.successes.fetch_add(1, Ordering::Relaxed);
            }
            Some(kind) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                if kind == ErrorKind::CircuitOpen {
                    self.circuit_rejections.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Current values
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            circuit_trips: self.circuit_trips.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            stale_served: self.stale_served.load(Ordering::Relaxed),
            bulkhead_rejections: self.bulkhead_rejections.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            latency: self.latency.summary(),
        }
    }
}

impl EventSink for MetricsRecorder {
    fn record(&self, event: &ResilienceEvent) {
        let counter = match event {
            ResilienceEvent::RetryAttempted { .. } => &self.retries,
            ResilienceEvent::CircuitOpened { .. } => &self.circuit_trips,
            ResilienceEvent::BulkheadRejected { .. } => &self.bulkhead_rejections,
            ResilienceEvent::StaleServed { .. } => &self.stale_served,
            ResilienceEvent::TimeoutExceeded { .. } => &self.timeouts,
            ResilienceEvent::CacheHit { .. } => &self.cache_hits,
            ResilienceEvent::CacheMiss { .. } => &self.cache_misses,
            ResilienceEvent::CircuitHalfOpened { .. } | ResilienceEvent::CircuitClosed { .. } => {
                return;
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
