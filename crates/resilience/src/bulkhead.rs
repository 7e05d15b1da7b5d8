//! Bulkhead pattern for limiting concurrent operations
//!
//! Each operation class gets its own bulkhead so a flood of slow reports
//! cannot starve reads and writes. A caller that finds every slot busy joins
//! a bounded FIFO queue; once the queue is full, further callers are
//! rejected immediately instead of piling up.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::error::{ConfigError, ConfigResult, ResilienceError, ResilienceResult};
use crate::observability::{noop_sink, ResilienceEvent, SharedSink};

/// Configuration for bulkhead behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkheadConfig {
    /// Name used in errors, logs and events
    pub name: String,
    /// Maximum number of concurrent operations allowed
    pub max_concurrent: usize,
    /// Maximum number of operations waiting for a slot
    pub max_waiting: usize,
}

impl BulkheadConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when `max_concurrent` is zero or too
    /// large for the underlying semaphore.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::invalid(format!(
                "bulkhead `{}`: max_concurrent must be greater than 0",
                self.name
            )));
        }
        if self.max_concurrent > Semaphore::MAX_PERMITS {
            return Err(ConfigError::invalid(format!(
                "bulkhead `{}`: max_concurrent exceeds {}",
                self.name,
                Semaphore::MAX_PERMITS
            )));
        }
        Ok(())
    }
}

/// Metrics for bulkhead monitoring
#[derive(Debug, Clone)]
pub struct BulkheadMetrics {
    /// Total number of operations admitted
    pub total_operations: u64,
    /// Total number of operations rejected (queue full)
    pub rejected_operations: u64,
    /// Waits abandoned because the caller cancelled
    pub cancelled_waits: u64,
    /// Current number of concurrent operations
    pub current_concurrent: usize,
    /// Current number of operations waiting in queue
    pub current_queued: usize,
    /// Maximum concurrent operations allowed
    pub max_concurrent: usize,
}

impl BulkheadMetrics {
    /// Calculate the current utilization as a percentage (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        self.current_concurrent as f64 / self.max_concurrent as f64
    }

    /// Calculate the rejection rate as a percentage (0.0 to 1.0)
    pub fn rejection_rate(&self) -> f64 {
        let total = self.total_operations + self.rejected_operations;
        if total == 0 {
            return 0.0;
        }
        self.rejected_operations as f64 / total as f64
    }

    /// Check if the bulkhead is at capacity
    pub fn is_at_capacity(&self) -> bool {
        self.current_concurrent >= self.max_concurrent
    }
}

/// Slot held for the duration of one operation
///
/// Dropping the permit frees the slot, handing it to the oldest waiter.
#[derive(Debug)]
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
}

/// Decrements the waiting count on every exit path of a queued acquire
struct QueuePosition<'a>(&'a AtomicUsize);

impl Drop for QueuePosition<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Bulkhead for limiting concurrent operations
///
/// # Examples
///
/// ```rust
/// use bulwark_resilience::{Bulkhead, BulkheadConfig, ResilienceResult};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bulkhead = Bulkhead::new(BulkheadConfig {
///     name: "read".into(),
///     max_concurrent: 5,
///     max_waiting: 10,
/// })?;
///
/// let result: ResilienceResult<_, std::io::Error> = bulkhead
///     .execute(&CancellationToken::new(), || async { Ok("row") })
///     .await;
/// assert_eq!(result?, "row");
/// # Ok(())
/// # }
/// ```
pub struct Bulkhead {
    config: BulkheadConfig,
    semaphore: Arc<Semaphore>,
    waiting: AtomicUsize,
    total_operations: AtomicU64,
    rejected_operations: AtomicU64,
    cancelled_waits: AtomicU64,
    sink: SharedSink,
}

impl Bulkhead {
    /// Create a new bulkhead with the given configuration
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the configuration is invalid.
    pub fn new(config: BulkheadConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            waiting: AtomicUsize::new(0),
            total_operations: AtomicU64::new(0),
            rejected_operations: AtomicU64::new(0),
            cancelled_waits: AtomicU64::new(0),
            sink: noop_sink(),
            config,
        })
    }

    /// Report rejections to `sink`
    #[must_use]
    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    /// Bulkhead name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Operations currently holding a slot
    pub fn in_flight(&self) -> usize {
        self.config.max_concurrent.saturating_sub(self.semaphore.available_permits())
    }

    /// Callers currently queued for a slot
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    /// Acquire a slot, queueing if every slot is busy
    ///
    /// # Errors
    ///
    /// - [`ResilienceError::BulkheadRejected`] when the queue is full
    /// - [`ResilienceError::Cancelled`] when `ctx` fires while queued; the
    ///   caller leaves the queue and no slot is consumed
    pub async fn acquire<E>(&self, ctx: &CancellationToken) -> ResilienceResult<BulkheadPermit, E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if ctx.is_cancelled() {
            return Err(ResilienceError::Cancelled);
        }

        if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            self.total_operations.fetch_add(1, Ordering::Relaxed);
            return Ok(BulkheadPermit { _permit: permit });
        }

        let max_waiting = self.config.max_waiting;
        let joined = self
            .waiting
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max_waiting).then_some(n + 1)
            })
            .is_ok();
        if !joined {
            return Err(self.reject());
        }
        let _position = QueuePosition(&self.waiting);

        tokio::select! {
            biased;
            () = ctx.cancelled() => {
                self.cancelled_waits.fetch_add(1, Ordering::Relaxed);
                debug!(bulkhead = %self.config.name, "caller cancelled while queued");
                Err(ResilienceError::Cancelled)
            }
            acquired = Arc::clone(&self.semaphore).acquire_owned() => match acquired {
                Ok(permit) => {
                    self.total_operations.fetch_add(1, Ordering::Relaxed);
                    Ok(BulkheadPermit { _permit: permit })
                }
                // the semaphore is never closed
                Err(_closed) => Err(self.reject()),
            },
        }
    }

    /// Execute an operation with bulkhead protection
    ///
    /// The slot is released when `op` finishes, fails, panics, or is
    /// dropped.
    ///
    /// # Errors
    ///
    /// Same as [`Bulkhead::acquire`], otherwise whatever `op` returns.
    #[instrument(skip_all, fields(bulkhead = %self.config.name, in_flight = self.in_flight()))]
    pub async fn execute<F, Fut, T, E>(
        &self,
        ctx: &CancellationToken,
        op: F,
    ) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ResilienceResult<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let _permit = self.acquire::<E>(ctx).await?;
        op().await
    }

    /// Get current metrics snapshot
    pub fn metrics(&self) -> BulkheadMetrics {
        BulkheadMetrics {
            total_operations: self.total_operations.load(Ordering::Relaxed),
            rejected_operations: self.rejected_operations.load(Ordering::Relaxed),
            cancelled_waits: self.cancelled_waits.load(Ordering::Relaxed),
            current_concurrent: self.in_flight(),
            current_queued: self.waiting(),
            max_concurrent: self.config.max_concurrent,
        }
    }

    fn reject<E>(&self) -> ResilienceError<E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.rejected_operations.fetch_add(1, Ordering::Relaxed);
        let (in_flight, waiting) = (self.in_flight(), self.waiting());
        debug!(bulkhead = %self.config.name, in_flight, waiting, "bulkhead full, rejecting");
        self.sink.record(&ResilienceEvent::BulkheadRejected {
            name: self.config.name.clone(),
            in_flight,
            waiting,
        });
        ResilienceError::BulkheadRejected {
            name: self.config.name.clone(),
            max_concurrent: self.config.max_concurrent,
            max_waiting: self.config.max_waiting,
        }
    }
}

impl fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bulkhead")
            .field("config", &self.config)
            .field("in_flight", &self.in_flight())
            .field("waiting", &self.waiting())
            .finish()
    }
}
