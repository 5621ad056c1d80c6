//! Configuration management for ratewarden.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{RatewardenError, Result};
use crate::ratelimit::{LimitRule, DEFAULT_POLL_INTERVAL};

/// Prefix of environment variables overriding file settings, e.g.
/// `RATEWARDEN__LOGGING__LEVEL=debug`.
pub const ENV_PREFIX: &str = "RATEWARDEN";

/// Main configuration for ratewarden.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RatewardenConfig {
    /// Limiter defaults
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Static limits a registry starts from before the server advertises its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Application-wide windows
    #[serde(default = "default_application_limits")]
    pub application: Vec<LimitRule>,

    /// Pre-seeded windows per operation name
    #[serde(default)]
    pub operations: HashMap<String, Vec<LimitRule>>,

    /// Window given to an operation the registry has never seen
    #[serde(default = "default_unknown_operation")]
    pub unknown_operation: LimitRule,

    /// How often parked reservations re-check capacity, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            application: default_application_limits(),
            operations: HashMap::new(),
            unknown_operation: default_unknown_operation(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_application_limits() -> Vec<LimitRule> {
    vec![LimitRule::new(20, 1), LimitRule::new(100, 120)]
}

fn default_unknown_operation() -> LimitRule {
    LimitRule::new(20000, 10)
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL.as_millis() as u64
}

impl LimiterConfig {
    /// Admission re-check interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Check every configured rule.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(RatewardenError::Config(
                "limiter.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        self.unknown_operation.validate()?;
        for rule in &self.application {
            rule.validate()?;
        }
        for rules in self.operations.values() {
            for rule in rules {
                rule.validate()?;
            }
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl RatewardenConfig {
    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RatewardenConfig = serde_yaml::from_str(yaml)
            .map_err(|e| RatewardenError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.limiter.validate()?;
        Ok(config)
    }

    /// Load defaults, then the optional YAML file, then `RATEWARDEN__*`
    /// environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        let env = config::Config::builder()
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        config.apply_overrides(&env)?;
        Ok(config)
    }

    /// Apply scalar overrides from a layered source.
    ///
    /// Only scalar settings can be overridden; limit tables come from the file.
    pub fn apply_overrides(&mut self, source: &config::Config) -> Result<()> {
        override_with(source, "limiter.poll_interval_ms", &mut self.limiter.poll_interval_ms)?;
        override_with(source, "logging.level", &mut self.logging.level)?;
        override_with(source, "logging.json", &mut self.logging.json)?;
        self.limiter.validate()
    }
}

fn override_with<T: DeserializeOwned>(
    source: &config::Config,
    key: &str,
    target: &mut T,
) -> Result<()> {
    match source.get::<T>(key) {
        Ok(value) => {
            *target = value;
            Ok(())
        }
        Err(config::ConfigError::NotFound(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
