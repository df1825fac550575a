//! Configuration management for Ratewarden.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{RateWardenError, Result};
use crate::ratelimit::{PolicyConfig, RateLimitConfig};

/// Prefix for environment overrides, e.g. `RATEWARDEN_LOGGING__LEVEL=debug`.
pub const ENV_PREFIX: &str = "RATEWARDEN";

/// Main configuration for the Ratewarden service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitingConfig {
    /// Path to a separate policy file, appended after the inline policies
    pub config_path: Option<String>,

    /// Policies declared inline
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
}

impl RateLimitingConfig {
    /// Merge inline and file policies into one validated configuration.
    pub fn resolve(&self) -> Result<RateLimitConfig> {
        let mut config = RateLimitConfig {
            policies: self.policies.clone(),
        };
        if let Some(path) = &self.config_path {
            config.policies.extend(RateLimitConfig::from_file(path)?.policies);
        }
        config.validate()?;
        Ok(config)
    }
}

impl ServiceConfig {
    /// Load configuration from a YAML file only.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ServiceConfig = serde_yaml::from_str(&contents)
            .map_err(|e| RateWardenError::Config(e.to_string()))?;
        Ok(config)
    }

    /// Load layered configuration: defaults, then the optional YAML file,
    /// then `RATEWARDEN_*` environment variables (`__` separates nested keys).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__"),
        );

        let config: ServiceConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }
}
