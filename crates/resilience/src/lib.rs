//! Resilient-operation layer for a shared, unreliable remote dependency
//!
//! The crate wraps any fallible, latency-bearing call (a SQL query, an HTTP
//! request) in a fixed set of fault-tolerance layers:
//! - **Failure classification**: decides which errors are transient
//! - **Retry**: bounded attempts with optional exponential backoff
//! - **Circuit breaker**: fails fast while the dependency is unhealthy
//! - **Bulkhead**: bounds in-flight calls per operation class, FIFO queueing
//! - **Timeout**: hard deadlines that cancel the wrapped operation
//! - **Stale cache**: serves a recent value when the live call fails
//!
//! [`ResilientClient`] composes them into `read`, `write` and `report`
//! operation classes. Every layer is also usable on its own.
//!
//! ## Operations
//!
//! An operation is any `FnMut(CancellationToken) -> impl Future<Output =
//! Result<T, E>>`. The token is cancelled when the caller gives up or a
//! deadline fires; well-behaved operations should watch it.
//!
//! ## Errors
//!
//! Every layer returns [`ResilienceError`], tagged by the layer that gave up
//! ([`ResilienceError::kind`]). The original dependency error stays
//! reachable through `source()`.
//!
//! ## Feature Flags
//! - `config` (default): TOML configuration files
//! - `metrics`: forward events to the `metrics` facade via
//!   [`observability::MetricsFacadeSink`]
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//!
//! use bulwark_resilience::{FailureClassifier, RetryExecutor, RetryPolicy};
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = RetryPolicy::builder(3, Duration::from_millis(1))
//!     .classifier(FailureClassifier::database_defaults())
//!     .build()?;
//!
//! let rows = RetryExecutor::default()
//!     .execute(&CancellationToken::new(), |_token| async { Ok::<_, std::io::Error>(7) }, &policy)
//!     .await?;
//! assert_eq!(rows, 7);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod bulkhead;
pub mod cache;
pub mod circuit_breaker;
pub mod classifier;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod observability;
pub mod retry;
pub mod timeout;

// Re-export commonly used types
pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadMetrics, BulkheadPermit};
pub use cache::{CacheStats, Cached, Origin, StaleCache};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState,
};
pub use classifier::{FailureClassifier, DATABASE_TRANSIENT_PATTERNS};
pub use client::{ResilientClient, ResilientClientBuilder};
pub use clock::{Clock, MockClock, SystemClock};
pub use config::{OperationClass, ResilienceConfig, TimeoutMode};
pub use error::{ConfigError, ConfigResult, ErrorKind, ResilienceError, ResilienceResult};
pub use observability::{EventSink, MetricsSnapshot, ResilienceEvent, SharedSink};
pub use retry::{RetryExecutor, RetryOutcome, RetryPolicy, RetryPolicyBuilder};
pub use timeout::TimeoutGuard;
