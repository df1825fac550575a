//! Named rate limit policies and their configuration format.
//!
//! Each protected route (signup, login, password reset, ...) gets a policy:
//! a name plus the windows enforced for it. Policies are written in YAML:
//!
//! ```yaml
//! policies:
//!   - name: signup
//!     limits:
//!       - requests_per_unit: 6
//!         unit: hour
//!       - requests_per_unit: 20
//!         unit: day
//!   - name: login
//!     limits:
//!       - requests_per_unit: 10
//!         window_secs: 900
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

use super::window::{TimeUnit, WindowConfig};
use crate::error::{RateWardenError, Result};

/// A complete rate limit configuration containing multiple policies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
}

/// Limits applied to one protected route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    /// The policy name callers check against
    pub name: String,
    /// Windows enforced together; empty means unlimited
    #[serde(default)]
    pub limits: Vec<RateLimitRule>,
}

/// One window of a policy.
///
/// The span is either a named `unit` or an explicit `window_secs`, not both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitRule {
    /// Number of requests allowed per span
    pub requests_per_unit: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<TimeUnit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_secs: Option<u64>,
}

impl RateLimitRule {
    /// Span of this rule in seconds.
    pub fn window_secs(&self) -> Result<u64> {
        match (self.unit, self.window_secs) {
            (Some(unit), None) => Ok(unit.as_secs()),
            (None, Some(secs)) => Ok(secs),
            (Some(_), Some(_)) => Err(RateWardenError::Config(
                "rate limit rule sets both `unit` and `window_secs`".to_string(),
            )),
            (None, None) => Err(RateWardenError::Config(
                "rate limit rule needs `unit` or `window_secs`".to_string(),
            )),
        }
    }
}

impl PolicyConfig {
    /// Validate the rules and turn them into a window configuration.
    pub fn window_config(&self) -> Result<WindowConfig> {
        let mut pairs = Vec::with_capacity(self.limits.len());
        for rule in &self.limits {
            pairs.push((rule.window_secs()?, rule.requests_per_unit));
        }
        WindowConfig::new(pairs)
    }
}

impl RateLimitConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    ///
    /// Accepts either a single policy document or a `policies` list. A
    /// document with a top-level `policies` key is read as a list, anything
    /// else as one policy; unknown keys are rejected in both shapes.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let document: serde_yaml::Value = serde_yaml::from_str(yaml).map_err(|e| {
            RateWardenError::Config(format!("Failed to parse rate limit config: {}", e))
        })?;

        let config = if document.get("policies").is_some() {
            serde_yaml::from_value::<RateLimitConfig>(document).map_err(|e| {
                RateWardenError::Config(format!("Failed to parse rate limit config: {}", e))
            })?
        } else {
            let policy = serde_yaml::from_value::<PolicyConfig>(document).map_err(|e| {
                RateWardenError::Config(format!("Failed to parse rate limit policy: {}", e))
            })?;
            RateLimitConfig {
                policies: vec![policy],
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Check policy names are unique and every rule is well formed.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for policy in &self.policies {
            if !seen.insert(policy.name.as_str()) {
                return Err(RateWardenError::DuplicatePolicy(policy.name.clone()));
            }
            policy.window_config()?;
        }
        Ok(())
    }

    /// Get the configuration for a specific policy.
    pub fn get_policy(&self, name: &str) -> Option<&PolicyConfig> {
        self.policies.iter().find(|p| p.name == name)
    }
}
