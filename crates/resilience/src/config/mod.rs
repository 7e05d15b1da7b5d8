//! Configuration for the resilient client
//!
//! Component constructors take every tuning value explicitly. The values a
//! deployment actually runs with live here: [`ResilienceConfig::default`]
//! carries the presets for a relational datastore, a TOML file (feature
//! `config`) can override any subset of them, and `BULWARK_*` environment
//! variables override the result.
//!
//! ## Presets
//!
//! | Class | Attempts | Timeout | Concurrency | Cache TTL / stale TTL |
//! |-------|----------|---------|-------------|-----------------------|
//! | read | 3, backoff from 100 ms | 2 s per attempt | 32 (+64 queued) | 30 s / 5 min |
//! | write | 2, backoff from 200 ms | 5 s per attempt | 16 (+32 queued) | not cached |
//! | report | 1 | 30 s | 4 (+8 queued) | 5 min / 1 h |
//!
//! The dependency's circuit opens after 5 failures and lets trial calls
//! through again after 30 s; 2 trial successes close it.

mod durations;
mod env;
#[cfg(feature = "config")]
mod loader;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use self::durations::duration_millis;
use crate::bulkhead::BulkheadConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::classifier::{FailureClassifier, DATABASE_TRANSIENT_PATTERNS};
use crate::error::{ConfigError, ConfigResult};
use crate::retry::RetryPolicy;

/// Prefix of every environment override
pub const ENV_PREFIX: &str = "BULWARK_";

/// The three operation classes exposed by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationClass {
    Read,
    Write,
    Report,
}

impl OperationClass {
    /// All classes, in configuration order
    pub const ALL: [Self; 3] = [Self::Read, Self::Write, Self::Report];

    /// Lowercase label used in logs, bulkhead names and config tables
    pub const fn label(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Report => "report",
        }
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How an operation class's timeout is scoped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutMode {
    /// Every attempt gets the full timeout
    PerAttempt,
    /// One budget covers all attempts and the sleeps between them
    Cumulative,
}

impl FromStr for TimeoutMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per_attempt" | "per-attempt" => Ok(Self::PerAttempt),
            "cumulative" => Ok(Self::Cumulative),
            other => Err(ConfigError::invalid(format!("unknown timeout mode `{other}`"))),
        }
    }
}

/// Tuning for one operation class
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassConfig {
    pub max_attempts: u32,
    #[serde(rename = "base_delay_ms", with = "duration_millis")]
    pub base_delay: Duration,
    pub use_backoff: bool,
    #[serde(rename = "max_delay_ms", with = "duration_millis")]
    pub max_delay: Duration,
    /// Case-insensitive substrings marking an error as transient
    pub retryable_patterns: Vec<String>,
    /// Regular expressions marking an error as transient
    pub retryable_regexes: Vec<String>,
    pub max_concurrent: usize,
    pub max_waiting: usize,
    #[serde(rename = "timeout_ms", with = "duration_millis")]
    pub timeout: Duration,
    pub timeout_mode: TimeoutMode,
    #[serde(rename = "cache_ttl_ms", with = "duration_millis")]
    pub cache_ttl: Duration,
    #[serde(rename = "stale_ttl_ms", with = "duration_millis")]
    pub stale_ttl: Duration,
}

fn database_patterns() -> Vec<String> {
    DATABASE_TRANSIENT_PATTERNS.iter().map(|p| (*p).to_string()).collect()
}

impl ClassConfig {
    /// Reads: more retries, short timeout, widest bulkhead
    pub fn read_preset() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            use_backoff: true,
            max_delay: Duration::from_secs(2),
            retryable_patterns: database_patterns(),
            retryable_regexes: Vec::new(),
            max_concurrent: 32,
            max_waiting: 64,
            timeout: Duration::from_secs(2),
            timeout_mode: TimeoutMode::PerAttempt,
            cache_ttl: Duration::from_secs(30),
            stale_ttl: Duration::from_secs(300),
        }
    }

    /// Writes: fewer retries, longer timeout, no caching
    pub fn write_preset() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(200),
            use_backoff: true,
            max_delay: Duration::from_secs(2),
            retryable_patterns: database_patterns(),
            retryable_regexes: Vec::new(),
            max_concurrent: 16,
            max_waiting: 32,
            timeout: Duration::from_secs(5),
            timeout_mode: TimeoutMode::PerAttempt,
            cache_ttl: Duration::ZERO,
            stale_ttl: Duration::ZERO,
        }
    }

    /// Reports: single attempt, longest timeout, smallest bulkhead
    pub fn report_preset() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            use_backoff: false,
            max_delay: Duration::ZERO,
            retryable_patterns: database_patterns(),
            retryable_regexes: Vec::new(),
            max_concurrent: 4,
            max_waiting: 8,
            timeout: Duration::from_secs(30),
            timeout_mode: TimeoutMode::PerAttempt,
            cache_ttl: Duration::from_secs(300),
            stale_ttl: Duration::from_secs(3600),
        }
    }

    /// Preset for `class`
    pub fn preset(class: OperationClass) -> Self {
        match class {
            OperationClass::Read => Self::read_preset(),
            OperationClass::Write => Self::write_preset(),
            OperationClass::Report => Self::report_preset(),
        }
    }

    /// Validate the configuration for `class`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending field, or
    /// [`ConfigError::InvalidPattern`] for a regular expression that does
    /// not compile.
    pub fn validate(&self, class: OperationClass) -> ConfigResult<()> {
        let invalid = |message: &str| Err(ConfigError::invalid(format!("[{class}] {message}")));

        if self.max_attempts == 0 {
            return invalid("max_attempts must be at least 1");
        }
        if self.max_concurrent == 0 {
            return invalid("max_concurrent must be greater than 0");
        }
        if self.timeout.is_zero() {
            return invalid("timeout_ms must be greater than 0");
        }
        if self.max_delay < self.base_delay {
            return invalid("max_delay_ms must not be less than base_delay_ms");
        }
        if self.stale_ttl < self.cache_ttl {
            return invalid("stale_ttl_ms must not be less than cache_ttl_ms");
        }
        self.classifier().map(drop)
    }

    /// Classifier built from the configured patterns
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPattern`] if a regex does not compile.
    pub fn classifier(&self) -> ConfigResult<FailureClassifier> {
        FailureClassifier::from_patterns(&self.retryable_patterns)
            .with_regexes(&self.retryable_regexes)
    }

    /// Retry policy for this class
    ///
    /// In [`TimeoutMode::PerAttempt`] the timeout becomes the policy's
    /// attempt timeout; in cumulative mode the caller wraps the whole retry
    /// sequence instead.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the values do not form a valid policy.
    pub fn retry_policy(&self) -> ConfigResult<RetryPolicy> {
        let builder = RetryPolicy::builder(self.max_attempts, self.base_delay)
            .use_backoff(self.use_backoff)
            .max_delay(self.max_delay)
            .classifier(self.classifier()?);
        let builder = match self.timeout_mode {
            TimeoutMode::PerAttempt => builder.attempt_timeout(self.timeout),
            TimeoutMode::Cumulative => builder,
        };
        builder.build()
    }

    /// Bulkhead settings for this class
    pub fn bulkhead_config(&self, class: OperationClass) -> BulkheadConfig {
        BulkheadConfig {
            name: class.label().to_string(),
            max_concurrent: self.max_concurrent,
            max_waiting: self.max_waiting,
        }
    }
}

/// Settings for the protected dependency as a whole
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyConfig {
    /// Logical dependency name, used for the circuit breaker
    pub name: String,
    pub failure_threshold: u64,
    #[serde(rename = "reset_timeout_ms", with = "duration_millis")]
    pub reset_timeout: Duration,
    pub half_open_success_threshold: u64,
    pub max_sample_size: u64,
    /// Collapse concurrent cache misses for one key into a single fetch
    pub coalesce_misses: bool,
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            name: "primary-db".to_string(),
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_success_threshold: 2,
            max_sample_size: 20,
            coalesce_misses: false,
        }
    }
}

impl DependencyConfig {
    /// Circuit breaker settings
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            reset_timeout: self.reset_timeout,
            half_open_success_threshold: self.half_open_success_threshold,
            max_sample_size: self.max_sample_size,
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an empty name or invalid
    /// breaker thresholds.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid("[dependency] name must not be empty"));
        }
        self.breaker_config().validate()
    }
}

/// Complete client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResilienceConfig {
    /// Samples kept for latency percentiles
    pub latency_window: usize,
    pub dependency: DependencyConfig,
    pub read: ClassConfig,
    pub write: ClassConfig,
    pub report: ClassConfig,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            latency_window: 1024,
            dependency: DependencyConfig::default(),
            read: ClassConfig::read_preset(),
            write: ClassConfig::write_preset(),
            report: ClassConfig::report_preset(),
        }
    }
}

impl ResilienceConfig {
    /// Settings for one operation class
    pub fn class(&self, class: OperationClass) -> &ClassConfig {
        match class {
            OperationClass::Read => &self.read,
            OperationClass::Write => &self.write,
            OperationClass::Report => &self.report,
        }
    }

    /// Mutable settings for one operation class
    pub fn class_mut(&mut self, class: OperationClass) -> &mut ClassConfig {
        match class {
            OperationClass::Read => &mut self.read,
            OperationClass::Write => &mut self.write,
            OperationClass::Report => &mut self.report,
        }
    }

    /// Validate every section
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> ConfigResult<()> {
        self.dependency.validate()?;
        for class in OperationClass::ALL {
            self.class(class).validate(class)?;
        }
        if self.latency_window == 0 {
            return Err(ConfigError::invalid("latency_window must be greater than 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid() {
        let config = ResilienceConfig::default();
        config.validate().unwrap();

        assert!(config.read.max_attempts > config.write.max_attempts);
        assert_eq!(config.report.max_attempts, 1);
        assert!(config.report.timeout > config.write.timeout);
        assert!(config.write.timeout > config.read.timeout);
        assert!(config.report.max_concurrent < config.write.max_concurrent);
        assert!(!config.dependency.coalesce_misses);
    }

    #[test]
    fn test_per_attempt_mode_sets_attempt_timeout() {
        let read = ClassConfig::read_preset();
        let policy = read.retry_policy().unwrap();
        assert_eq!(policy.attempt_timeout(), Some(Duration::from_secs(2)));
        assert_eq!(policy.max_attempts(), 3);
        assert!(policy.classifier().matches_message("deadlock detected"));

        let cumulative = ClassConfig { timeout_mode: TimeoutMode::Cumulative, ..read };
        assert_eq!(cumulative.retry_policy().unwrap().attempt_timeout(), None);
    }

    #[test]
    fn test_validation_names_class_and_field() {
        let mut config = ResilienceConfig::default();
        config.report.max_concurrent = 0;
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid configuration: [report] max_concurrent must be greater than 0"
        );

        let mut config = ResilienceConfig::default();
        config.read.stale_ttl = Duration::from_secs(1);
        assert!(config.validate().unwrap_err().to_string().contains("stale_ttl_ms"));
    }

    #[test]
    fn test_bad_regex_fails_validation() {
        let mut config = ResilienceConfig::default();
        config.write.retryable_regexes = vec!["[unterminated".into()];
        assert!(matches!(config.validate(), Err(ConfigError::InvalidPattern { .. })));
    }

    #[test]
    fn test_timeout_mode_parsing() {
        assert_eq!("per_attempt".parse::<TimeoutMode>().unwrap(), TimeoutMode::PerAttempt);
        assert_eq!(" Cumulative ".parse::<TimeoutMode>().unwrap(), TimeoutMode::Cumulative);
        assert!("sometimes".parse::<TimeoutMode>().is_err());
    }

    #[test]
    fn test_bulkhead_names_follow_class() {
        let config = ResilienceConfig::default();
        let bulkhead = config.report.bulkhead_config(OperationClass::Report);
        assert_eq!(bulkhead.name, "report");
        assert_eq!(bulkhead.max_concurrent, 4);
    }
}
