//! Transient-failure classification
//!
//! A [`FailureClassifier`] decides whether a dependency error is worth
//! retrying by matching its message against configured substrings and
//! regular expressions. Anything that matches nothing is treated as a real
//! failure and surfaces immediately.

use std::error::Error as StdError;
use std::fmt;

use regex::RegexSet;

use crate::error::{ConfigError, ConfigResult, ResilienceError};

/// Message fragments that indicate a transient datastore failure
pub const DATABASE_TRANSIENT_PATTERNS: &[&str] = &[
    "connection refused",
    "connection reset",
    "timeout",
    "timed out",
    "deadlock detected",
    "too many connections",
    "could not serialize access",
    "server closed the connection",
    "broken pipe",
];

/// Pattern-based transient error detector
///
/// Substrings match case-insensitively. Regular expressions are used as
/// given, so add `(?i)` for case-insensitive matching. The error's whole
/// `source()` chain is inspected.
///
/// # Examples
///
/// ```
/// use bulwark_resilience::FailureClassifier;
///
/// let classifier = FailureClassifier::from_patterns(["deadlock detected"]);
/// let err = std::io::Error::other("ERROR: deadlock detected");
/// assert!(classifier.is_retryable(&err));
///
/// let err = std::io::Error::other("duplicate key value violates unique constraint");
/// assert!(!classifier.is_retryable(&err));
/// ```
#[derive(Clone, Default)]
pub struct FailureClassifier {
    substrings: Vec<String>,
    regexes: Option<RegexSet>,
}

impl FailureClassifier {
    /// Classifier that retries nothing
    pub fn none() -> Self {
        Self::default()
    }

    /// Classifier built from case-insensitive substrings
    pub fn from_patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let substrings = patterns
            .into_iter()
            .map(|p| p.as_ref().trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        Self { substrings, regexes: None }
    }

    /// Add regular-expression matchers
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPattern`] if any expression fails to
    /// compile.
    pub fn with_regexes<I, S>(mut self, expressions: I) -> ConfigResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let expressions: Vec<String> =
            expressions.into_iter().map(|e| e.as_ref().to_string()).collect();
        if expressions.is_empty() {
            return Ok(self);
        }
        let set =
            RegexSet::new(&expressions).map_err(|source| ConfigError::InvalidPattern { source })?;
        self.regexes = Some(set);
        Ok(self)
    }

    /// Classifier preloaded with [`DATABASE_TRANSIENT_PATTERNS`]
    pub fn database_defaults() -> Self {
        Self::from_patterns(DATABASE_TRANSIENT_PATTERNS.iter().copied())
    }

    /// True when no pattern is configured
    pub fn is_empty(&self) -> bool {
        self.substrings.is_empty() && self.regexes.as_ref().map_or(true, RegexSet::is_empty)
    }

    /// Whether a single message matches any pattern
    pub fn matches_message(&self, message: &str) -> bool {
        if !self.substrings.is_empty() {
            let lowered = message.to_lowercase();
            if self.substrings.iter().any(|p| lowered.contains(p.as_str())) {
                return true;
            }
        }
        self.regexes.as_ref().is_some_and(|set| set.is_match(message))
    }

    /// Whether `error` (or any of its causes) is transient
    pub fn is_retryable(&self, error: &(dyn StdError + 'static)) -> bool {
        if self.is_empty() {
            return false;
        }
        let mut current = Some(error);
        while let Some(err) = current {
            if self.matches_message(&err.to_string()) {
                return true;
            }
            current = err.source();
        }
        false
    }

    /// Lift a raw dependency error into the resilience taxonomy
    pub fn classify<E>(&self, error: E) -> ResilienceError<E>
    where
        E: StdError + Send + Sync + 'static,
    {
        if self.is_retryable(&error) {
            ResilienceError::RetryableDependency { source: error }
        } else {
            ResilienceError::NonRetryableDependency { source: error }
        }
    }
}

impl fmt::Debug for FailureClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureClassifier")
            .field("substrings", &self.substrings)
            .field("regexes", &self.regexes.as_ref().map(|set| set.patterns().to_vec()))
            .finish()
    }
}
