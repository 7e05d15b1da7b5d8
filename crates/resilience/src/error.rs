//! Error taxonomy for resilient operations
//!
//! Every layer returns [`ResilienceError`], generic over the wrapped
//! operation's own error type `E`. Layers either pass an error through
//! unchanged or wrap it with more context; the original dependency error is
//! always reachable through [`std::error::Error::source`] or
//! [`ResilienceError::dependency_error`].
//!
//! | Variant | Operation invoked? | Tag |
//! |---------|--------------------|-----|
//! | `BulkheadRejected` | no | `bulkhead_rejected` |
//! | `CircuitOpen` | no | `circuit_open` |
//! | `Timeout` | yes, deadline fired | `timeout` |
//! | `RetriesExhausted` | yes, `attempts` times | `retries_exhausted` |
//! | `RetryableDependency` / `NonRetryableDependency` | yes | `dependency` |
//! | `Cancelled` | maybe | `cancelled` |
//! | `Panicked` | yes, it panicked | `panicked` |

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors produced by the resilience layers
///
/// `Display` and `Error` are written by hand because `RetriesExhausted` nests
/// the enum inside itself.
#[derive(Debug)]
pub enum ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// The dependency failed with an error the classifier deems transient
    RetryableDependency {
        /// Original dependency error
        source: E,
    },

    /// The dependency failed with an error that must not be retried
    NonRetryableDependency {
        /// Original dependency error
        source: E,
    },

    /// The circuit breaker is open; the operation was not invoked
    CircuitOpen {
        /// Breaker name
        name: String,
        /// Time until the next trial call is admitted
        retry_after: Duration,
    },

    /// The bulkhead is saturated; the operation was not invoked
    BulkheadRejected {
        /// Bulkhead name
        name: String,
        /// Concurrency limit
        max_concurrent: usize,
        /// Queue bound
        max_waiting: usize,
    },

    /// The deadline fired before the operation completed
    Timeout {
        /// The deadline that fired
        timeout: Duration,
    },

    /// Every permitted attempt failed with a transient error
    RetriesExhausted {
        /// Attempts made
        attempts: u32,
        /// Error of the final attempt
        last: Box<ResilienceError<E>>,
    },

    /// The caller's cancellation token fired
    Cancelled,

    /// The wrapped operation panicked; the panic was contained
    Panicked {
        /// Panic payload, when it was a string
        message: String,
    },
}

impl<E> fmt::Display for ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RetryableDependency { source } => {
                write!(f, "transient dependency failure: {source}")
            }
            Self::NonRetryableDependency { source } => write!(f, "dependency failure: {source}"),
            Self::CircuitOpen { name, retry_after } => {
                write!(f, "circuit `{name}` is open, next trial in {retry_after:?}")
            }
            Self::BulkheadRejected { name, max_concurrent, max_waiting } => write!(
                f,
                "bulkhead `{name}` rejected call: {max_concurrent} in flight \
                 and {max_waiting} waiting"
            ),
            Self::Timeout { timeout } => write!(f, "operation timed out after {timeout:?}"),
            Self::RetriesExhausted { attempts, last } => {
                write!(f, "retries exhausted after {attempts} attempts: {last}")
            }
            Self::Cancelled => f.write_str("operation cancelled by caller"),
            Self::Panicked { message } => write!(f, "operation panicked: {message}"),
        }
    }
}

impl<E> std::error::Error for ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::RetryableDependency { source } | Self::NonRetryableDependency { source } => {
                Some(source)
            }
            Self::RetriesExhausted { last, .. } => Some(last.as_ref()),
            _ => None,
        }
    }
}

/// Result type for resilient operations
pub type ResilienceResult<T, E> = Result<T, ResilienceError<E>>;

/// Stable category of a [`ResilienceError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Rejected by a bulkhead before the operation ran
    BulkheadRejected,
    /// Rejected by an open circuit before the operation ran
    CircuitOpen,
    /// Deadline exceeded mid-flight
    Timeout,
    /// Transient failures used up the retry budget
    RetriesExhausted,
    /// The dependency returned an error
    Dependency,
    /// The caller gave up
    Cancelled,
    /// The operation panicked
    Panicked,
}

impl ErrorKind {
    /// Label suitable for logs and metric dimensions
    pub const fn label(self) -> &'static str {
        match self {
            Self::BulkheadRejected => "bulkhead_rejected",
            Self::CircuitOpen => "circuit_open",
            Self::Timeout => "timeout",
            Self::RetriesExhausted => "retries_exhausted",
            Self::Dependency => "dependency",
            Self::Cancelled => "cancelled",
            Self::Panicked => "panicked",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl<E> ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Category of this error
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::RetryableDependency { .. } | Self::NonRetryableDependency { .. } => {
                ErrorKind::Dependency
            }
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::BulkheadRejected { .. } => ErrorKind::BulkheadRejected,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Panicked { .. } => ErrorKind::Panicked,
        }
    }

    /// The call was turned away without touching the dependency
    ///
    /// Callers typically map this to "service temporarily unavailable".
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. } | Self::BulkheadRejected { .. })
    }

    /// Another attempt may succeed
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::RetryableDependency { .. } | Self::Timeout { .. })
    }

    /// Whether this outcome says something about the dependency's health
    ///
    /// Caller cancellation and local rejections are neither successes nor
    /// failures from the circuit breaker's point of view.
    pub const fn counts_as_failure(&self) -> bool {
        !matches!(self, Self::Cancelled | Self::CircuitOpen { .. } | Self::BulkheadRejected { .. })
    }

    /// The underlying dependency error, looking through retry exhaustion
    pub fn dependency_error(&self) -> Option<&E> {
        match self {
            Self::RetryableDependency { source } | Self::NonRetryableDependency { source } => {
                Some(source)
            }
            Self::RetriesExhausted { last, .. } => last.dependency_error(),
            _ => None,
        }
    }

    /// Consume the error and return the underlying dependency error
    pub fn into_dependency_error(self) -> Option<E> {
        match self {
            Self::RetryableDependency { source } | Self::NonRetryableDependency { source } => {
                Some(source)
            }
            Self::RetriesExhausted { last, .. } => last.into_dependency_error(),
            _ => None,
        }
    }
}

/// Configuration and construction errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value failed validation
    #[error("invalid configuration: {message}")]
    Invalid { message: String },

    /// A retryable-error regular expression did not compile
    #[error("invalid retryable error pattern: {source}")]
    InvalidPattern {
        #[source]
        source: regex::Error,
    },

    /// An environment override could not be parsed
    #[error("invalid value {value:?} for environment variable {name}")]
    InvalidEnv { name: String, value: String },

    /// The configuration file could not be read
    #[error("failed to read configuration file {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for this schema
    #[cfg(feature = "config")]
    #[error("failed to parse configuration: {source}")]
    Parse {
        #[source]
        source: toml::de::Error,
    },

    /// The configuration could not be rendered as TOML
    #[cfg(feature = "config")]
    #[error("failed to serialize configuration: {source}")]
    Serialize {
        #[source]
        source: toml::ser::Error,
    },
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid { message: message.into() }
    }
}

/// Result type for configuration and construction
pub type ConfigResult<T> = Result<T, ConfigError>;
