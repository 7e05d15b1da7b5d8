//! Environment variable overrides
//!
//! ## Variables
//! - `BULWARK_LATENCY_WINDOW`: latency samples kept for percentiles
//! - `BULWARK_DEPENDENCY_{FIELD}`: `NAME`, `FAILURE_THRESHOLD`,
//!   `RESET_TIMEOUT_MS`, `HALF_OPEN_SUCCESS_THRESHOLD`, `MAX_SAMPLE_SIZE`,
//!   `COALESCE_MISSES`
//! - `BULWARK_{READ|WRITE|REPORT}_{FIELD}`: `MAX_ATTEMPTS`, `BASE_DELAY_MS`,
//!   `USE_BACKOFF`, `MAX_DELAY_MS`, `RETRYABLE_PATTERNS`,
//!   `RETRYABLE_REGEXES`, `MAX_CONCURRENT`, `MAX_WAITING`, `TIMEOUT_MS`,
//!   `TIMEOUT_MODE`, `CACHE_TTL_MS`, `STALE_TTL_MS`
//!
//! Pattern lists are comma separated. Booleans accept `1`/`0`,
//! `true`/`false`, `yes`/`no` and `on`/`off` (case-insensitive).

use std::str::FromStr;
use std::time::Duration;

use super::{ClassConfig, DependencyConfig, OperationClass, ResilienceConfig, ENV_PREFIX};
use crate::error::{ConfigError, ConfigResult};

impl ResilienceConfig {
    /// Apply every `BULWARK_*` variable from the process environment
    ///
    /// Returns the number of overrides applied.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEnv`] for a value that does not parse.
    pub fn apply_env_overrides(&mut self) -> ConfigResult<usize> {
        self.apply_overrides(std::env::vars())
    }

    /// Apply overrides from `(name, value)` pairs
    ///
    /// Names without the `BULWARK_` prefix are skipped silently; prefixed
    /// names that match no setting are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEnv`] for a value that does not parse.
    pub fn apply_overrides<I, K, V>(&mut self, vars: I) -> ConfigResult<usize>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut applied = 0;
        for (name, value) in vars {
            let (name, value) = (name.as_ref(), value.as_ref());
            let Some(key) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };

            let matched = if key == "LATENCY_WINDOW" {
                self.latency_window = parse(name, value)?;
                true
            } else if let Some(field) = key.strip_prefix("DEPENDENCY_") {
                apply_dependency(&mut self.dependency, field, name, value)?
            } else {
                match split_class(key) {
                    Some((class, field)) => apply_class(self.class_mut(class), field, name, value)?,
                    None => false,
                }
            };

            if matched {
                tracing::debug!(variable = name, "Applied environment override");
                applied += 1;
            } else {
                tracing::warn!(variable = name, "Ignoring unknown configuration variable");
            }
        }
        Ok(applied)
    }
}

fn split_class(key: &str) -> Option<(OperationClass, &str)> {
    OperationClass::ALL.into_iter().find_map(|class| {
        let label = class.label().to_ascii_uppercase();
        key.strip_prefix(label.as_str())
            .and_then(|rest| rest.strip_prefix('_'))
            .map(|field| (class, field))
    })
}

fn apply_dependency(
    config: &mut DependencyConfig,
    field: &str,
    name: &str,
    value: &str,
) -> ConfigResult<bool> {
    match field {
        "NAME" => config.name = value.trim().to_string(),
        "FAILURE_THRESHOLD" => config.failure_threshold = parse(name, value)?,
        "RESET_TIMEOUT_MS" => config.reset_timeout = parse_millis(name, value)?,
        "HALF_OPEN_SUCCESS_THRESHOLD" => config.half_open_success_threshold = parse(name, value)?,
        "MAX_SAMPLE_SIZE" => config.max_sample_size = parse(name, value)?,
        "COALESCE_MISSES" => config.coalesce_misses = parse_bool(name, value)?,
        _ => return Ok(false),
    }
    Ok(true)
}

fn apply_class(
    config: &mut ClassConfig,
    field: &str,
    name: &str,
    value: &str,
) -> ConfigResult<bool> {
    match field {
        "MAX_ATTEMPTS" => config.max_attempts = parse(name, value)?,
        "BASE_DELAY_MS" => config.base_delay = parse_millis(name, value)?,
        "USE_BACKOFF" => config.use_backoff = parse_bool(name, value)?,
        "MAX_DELAY_MS" => config.max_delay = parse_millis(name, value)?,
        "RETRYABLE_PATTERNS" => config.retryable_patterns = parse_list(value),
        "RETRYABLE_REGEXES" => config.retryable_regexes = parse_list(value),
        "MAX_CONCURRENT" => config.max_concurrent = parse(name, value)?,
        "MAX_WAITING" => config.max_waiting = parse(name, value)?,
        "TIMEOUT_MS" => config.timeout = parse_millis(name, value)?,
        "TIMEOUT_MODE" => config.timeout_mode = parse(name, value)?,
        "CACHE_TTL_MS" => config.cache_ttl = parse_millis(name, value)?,
        "STALE_TTL_MS" => config.stale_ttl = parse_millis(name, value)?,
        _ => return Ok(false),
    }
    Ok(true)
}

fn invalid_env(name: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnv { name: name.to_string(), value: value.to_string() }
}

fn parse<T: FromStr>(name: &str, value: &str) -> ConfigResult<T> {
    value.trim().parse().map_err(|_| invalid_env(name, value))
}

fn parse_millis(name: &str, value: &str) -> ConfigResult<Duration> {
    parse::<u64>(name, value).map(Duration::from_millis)
}

fn parse_bool(name: &str, value: &str) -> ConfigResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid_env(name, value)),
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value.split(',').map(str::trim).filter(|p| !p.is_empty()).map(str::to_string).collect()
}
