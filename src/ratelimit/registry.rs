//! One limiter per named policy.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

use super::clock::{Clock, SystemClock};
use super::limiter::{Limiter, LimiterStats};
use super::policy::RateLimitConfig;
use super::reaper::ReaperHandle;
use crate::error::{RateWardenError, Result};

/// Independent limiters keyed by policy name.
///
/// Each policy keeps its own keys and timers, so traffic on `login` never
/// counts against `signup` even when callers use the same key.
#[derive(Debug)]
pub struct LimiterRegistry {
    limiters: HashMap<String, Arc<Limiter>>,
}

impl LimiterRegistry {
    /// Build limiters for every policy, reading the wall clock.
    pub fn from_config(config: &RateLimitConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Build limiters for every policy, all reading `clock`.
    pub fn with_clock(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let mut limiters = HashMap::with_capacity(config.policies.len());
        for policy in &config.policies {
            let windows = policy.window_config()?;
            debug!(policy = %policy.name, windows = %windows, "Creating policy limiter");
            let limiter = Limiter::with_config(windows, Arc::clone(&clock));
            limiters.insert(policy.name.clone(), Arc::new(limiter));
        }

        info!(policies = limiters.len(), "Limiter registry initialized");
        Ok(Self { limiters })
    }

    /// The limiter for `policy`, if configured.
    pub fn get(&self, policy: &str) -> Option<Arc<Limiter>> {
        self.limiters.get(policy).cloned()
    }

    /// Admission check for `key` under `policy`.
    pub fn check(&self, policy: &str, key: &str) -> Result<bool> {
        let limiter = self
            .limiters
            .get(policy)
            .ok_or_else(|| RateWardenError::UnknownPolicy(policy.to_string()))?;
        Ok(limiter.try_add_request_if_within_limits(key))
    }

    /// Configured policy names, sorted.
    pub fn policies(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.limiters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Start one eviction reaper per policy.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn_reapers(&self) -> Vec<ReaperHandle> {
        self.limiters.values().map(Limiter::spawn_reaper).collect()
    }

    /// Per-policy limiter snapshots, keyed by policy name.
    pub fn stats(&self) -> BTreeMap<String, LimiterStats> {
        self.limiters
            .iter()
            .map(|(name, limiter)| (name.clone(), limiter.stats()))
            .collect()
    }
}
