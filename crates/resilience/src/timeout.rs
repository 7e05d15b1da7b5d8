//! Deadline enforcement with cooperative cancellation
//!
//! [`TimeoutGuard`] races an operation against a deadline. When the deadline
//! wins, the operation's cancellation token is cancelled and its future is
//! dropped, so nothing keeps running in the background. Panics raised by the
//! operation are contained here and surface as
//! [`ResilienceError::Panicked`].

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ResilienceError, ResilienceResult};
use crate::observability::{noop_sink, ResilienceEvent, SharedSink};

/// Deadline and panic boundary around a single operation
#[derive(Debug, Clone)]
pub struct TimeoutGuard {
    sink: SharedSink,
}

impl Default for TimeoutGuard {
    fn default() -> Self {
        Self::new(noop_sink())
    }
}

impl TimeoutGuard {
    /// Create a guard reporting to `sink`
    pub fn new(sink: SharedSink) -> Self {
        Self { sink }
    }

    /// Run `op` with a hard deadline
    ///
    /// `op` receives a child of `ctx`; it is cancelled when the deadline
    /// fires, when `ctx` is cancelled, and when the call returns.
    ///
    /// # Errors
    ///
    /// - [`ResilienceError::Timeout`] if `timeout` elapses first
    /// - [`ResilienceError::Cancelled`] if `ctx` is cancelled first
    /// - [`ResilienceError::Panicked`] if the operation panics
    /// - whatever error the operation itself returns
    pub async fn with_timeout<F, Fut, T, E>(
        &self,
        ctx: &CancellationToken,
        timeout: Duration,
        op: F,
    ) -> ResilienceResult<T, E>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ResilienceResult<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        if ctx.is_cancelled() {
            return Err(ResilienceError::Cancelled);
        }

        let child = ctx.child_token();
        let _cancel_on_exit = child.clone().drop_guard();
        let operation = contain_panics(async move { op(child).await });

        tokio::select! {
            biased;
            () = ctx.cancelled() => Err(ResilienceError::Cancelled),
            outcome = tokio::time::timeout(timeout, operation) => match outcome {
                Ok(result) => result,
                Err(_elapsed) => {
                    debug!(timeout_ms = timeout.as_millis() as u64, "operation deadline exceeded");
                    self.sink.record(&ResilienceEvent::TimeoutExceeded { timeout });
                    Err(ResilienceError::Timeout { timeout })
                }
            },
        }
    }

    /// Run `op` without a deadline, still honoring `ctx` and containing
    /// panics
    ///
    /// # Errors
    ///
    /// Same as [`TimeoutGuard::with_timeout`] minus the timeout case.
    pub async fn contain<F, Fut, T, E>(
        &self,
        ctx: &CancellationToken,
        op: F,
    ) -> ResilienceResult<T, E>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ResilienceResult<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        if ctx.is_cancelled() {
            return Err(ResilienceError::Cancelled);
        }

        let child = ctx.child_token();
        let _cancel_on_exit = child.clone().drop_guard();
        let operation = contain_panics(async move { op(child).await });

        tokio::select! {
            biased;
            () = ctx.cancelled() => Err(ResilienceError::Cancelled),
            result = operation => result,
        }
    }
}

/// Convert a panic inside `future` into [`ResilienceError::Panicked`]
pub(crate) async fn contain_panics<Fut, T, E>(future: Fut) -> ResilienceResult<T, E>
where
    Fut: Future<Output = ResilienceResult<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(ResilienceError::Panicked { message: panic_message(payload.as_ref()) }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
