//! TOML configuration files
//!
//! A file only names the values it changes; everything else keeps its
//! preset. Durations are whole milliseconds:
//!
//! ```toml
//! latency_window = 2048
//!
//! [dependency]
//! name = "orders-db"
//! failure_threshold = 3
//!
//! [read]
//! timeout_ms = 1500
//! retryable_patterns = ["deadlock", "lock wait timeout"]
//!
//! [report]
//! timeout_mode = "cumulative"
//! ```
//!
//! ## Loading order
//! 1. Presets ([`ResilienceConfig::default`])
//! 2. The given file, or `./bulwark.toml` when it exists
//! 3. `BULWARK_*` environment variables
//! 4. Validation

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::{
    duration_millis, ClassConfig, DependencyConfig, OperationClass, ResilienceConfig, TimeoutMode,
};
use crate::error::{ConfigError, ConfigResult};

/// File looked up by [`ResilienceConfig::load`] when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "bulwark.toml";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigPatch {
    latency_window: Option<usize>,
    dependency: Option<DependencyPatch>,
    read: Option<ClassPatch>,
    write: Option<ClassPatch>,
    report: Option<ClassPatch>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DependencyPatch {
    name: Option<String>,
    failure_threshold: Option<u64>,
    #[serde(
        default,
        rename = "reset_timeout_ms",
        deserialize_with = "duration_millis::option::deserialize"
    )]
    reset_timeout: Option<Duration>,
    half_open_success_threshold: Option<u64>,
    max_sample_size: Option<u64>,
    coalesce_misses: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ClassPatch {
    max_attempts: Option<u32>,
    #[serde(
        default,
        rename = "base_delay_ms",
        deserialize_with = "duration_millis::option::deserialize"
    )]
    base_delay: Option<Duration>,
    use_backoff: Option<bool>,
    #[serde(
        default,
        rename = "max_delay_ms",
        deserialize_with = "duration_millis::option::deserialize"
    )]
    max_delay: Option<Duration>,
    retryable_patterns: Option<Vec<String>>,
    retryable_regexes: Option<Vec<String>>,
    max_concurrent: Option<usize>,
    max_waiting: Option<usize>,
    #[serde(
        default,
        rename = "timeout_ms",
        deserialize_with = "duration_millis::option::deserialize"
    )]
    timeout: Option<Duration>,
    timeout_mode: Option<TimeoutMode>,
    #[serde(
        default,
        rename = "cache_ttl_ms",
        deserialize_with = "duration_millis::option::deserialize"
    )]
    cache_ttl: Option<Duration>,
    #[serde(
        default,
        rename = "stale_ttl_ms",
        deserialize_with = "duration_millis::option::deserialize"
    )]
    stale_ttl: Option<Duration>,
}

fn set<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

impl DependencyPatch {
    fn apply(self, config: &mut DependencyConfig) {
        set(&mut config.name, self.name);
        set(&mut config.failure_threshold, self.failure_threshold);
        set(&mut config.reset_timeout, self.reset_timeout);
        set(&mut config.half_open_success_threshold, self.half_open_success_threshold);
        set(&mut config.max_sample_size, self.max_sample_size);
        set(&mut config.coalesce_misses, self.coalesce_misses);
    }
}

impl ClassPatch {
    fn apply(self, config: &mut ClassConfig) {
        set(&mut config.max_attempts, self.max_attempts);
        set(&mut config.base_delay, self.base_delay);
        set(&mut config.use_backoff, self.use_backoff);
        set(&mut config.max_delay, self.max_delay);
        set(&mut config.retryable_patterns, self.retryable_patterns);
        set(&mut config.retryable_regexes, self.retryable_regexes);
        set(&mut config.max_concurrent, self.max_concurrent);
        set(&mut config.max_waiting, self.max_waiting);
        set(&mut config.timeout, self.timeout);
        set(&mut config.timeout_mode, self.timeout_mode);
        set(&mut config.cache_ttl, self.cache_ttl);
        set(&mut config.stale_ttl, self.stale_ttl);
    }
}

impl ConfigPatch {
    fn apply(self, config: &mut ResilienceConfig) {
        set(&mut config.latency_window, self.latency_window);
        if let Some(dependency) = self.dependency {
            dependency.apply(&mut config.dependency);
        }
        for (class, patch) in [
            (OperationClass::Read, self.read),
            (OperationClass::Write, self.write),
            (OperationClass::Report, self.report),
        ] {
            if let Some(patch) = patch {
                patch.apply(config.class_mut(class));
            }
        }
    }
}

impl ResilienceConfig {
    /// Parse a TOML document over the presets and validate the result
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML or unknown keys,
    /// and a validation error if the merged configuration is invalid.
    pub fn from_toml_str(contents: &str) -> ConfigResult<Self> {
        let mut config = Self::default();
        config.merge_toml_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay a TOML document onto this configuration without validating
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML or unknown keys.
    pub fn merge_toml_str(&mut self, contents: &str) -> ConfigResult<()> {
        let patch: ConfigPatch =
            toml::from_str(contents).map_err(|source| ConfigError::Parse { source })?;
        patch.apply(self);
        Ok(())
    }

    /// Load presets overlaid with a TOML file
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise
    /// the same errors as [`ResilienceConfig::from_toml_str`].
    pub fn load_from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let mut config = Self::default();
        config.merge_file(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    /// Full loading sequence: presets, file, environment, validation
    ///
    /// With `path` unset, `./bulwark.toml` is used if it exists and the
    /// presets are used as-is otherwise.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] from any stage.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = Self::default();

        match path.map(Path::to_path_buf).or_else(find_config_path) {
            Some(path) => config.merge_file(&path)?,
            None => tracing::debug!("No configuration file, using presets"),
        }

        let overrides = config.apply_env_overrides()?;
        config.validate()?;

        tracing::info!(
            dependency = %config.dependency.name,
            overrides,
            "Resilience configuration loaded"
        );
        Ok(config)
    }

    /// Render the configuration as TOML
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Serialize`] if rendering fails.
    pub fn to_toml_string(&self) -> ConfigResult<String> {
        toml::to_string(self).map_err(|source| ConfigError::Serialize { source })
    }

    fn merge_file(&mut self, path: &Path) -> ConfigResult<()> {
        tracing::info!(path = %path.display(), "Loading configuration from file");

        let contents = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        self.merge_toml_str(&contents)
    }
}

fn find_config_path() -> Option<PathBuf> {
    let candidate = std::env::current_dir().ok()?.join(DEFAULT_CONFIG_FILE);
    candidate.exists().then_some(candidate)
}
