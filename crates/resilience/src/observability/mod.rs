//! Observability for the resilience layers
//!
//! - [`events`]: the structured event vocabulary and the sinks that consume
//!   it (no-op, `tracing`, fan-out, optional `metrics` facade)
//! - [`metrics`]: atomic counters and a rolling latency window used by the
//!   façade's metrics snapshot

pub mod events;
pub mod metrics;

#[cfg(feature = "metrics")]
pub use events::MetricsFacadeSink;
pub use events::{
    noop_sink, EventSink, FanoutSink, NoopSink, ResilienceEvent, SharedSink, TracingSink,
};
pub use metrics::{LatencySummary, LatencyWindow, MetricsRecorder, MetricsSnapshot};
