//! Window definitions: how many requests are allowed per span of time.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{RateWardenError, Result};

/// Added to every entry's expiry instant.
pub const GRACE_MS: u64 = 1;

/// Named time units accepted in rate limit rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Length of this unit in seconds.
    pub fn as_secs(&self) -> u64 {
        match self {
            TimeUnit::Second => 1,
            TimeUnit::Minute => 60,
            TimeUnit::Hour => 3600,
            TimeUnit::Day => 86400,
        }
    }

    /// Get the duration of this unit.
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.as_secs())
    }
}

/// At most `limit` admitted requests per `duration_secs` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
    /// Span of the window in seconds
    pub duration_secs: u64,
    /// Maximum requests admitted within the span
    pub limit: u64,
}

impl Window {
    /// Create a window, rejecting zero durations and zero limits.
    pub fn new(duration_secs: u64, limit: u64) -> Result<Self> {
        if duration_secs == 0 || limit == 0 {
            return Err(RateWardenError::InvalidWindow {
                duration_secs,
                limit,
            });
        }
        Ok(Self {
            duration_secs,
            limit,
        })
    }

    /// Span of the window in milliseconds.
    pub fn duration_millis(&self) -> u64 {
        self.duration_secs.saturating_mul(1000)
    }

    /// Instant at which an entry recorded at `timestamp` stops counting.
    pub fn expiry(&self, timestamp: u64) -> u64 {
        timestamp
            .saturating_add(self.duration_millis())
            .saturating_add(GRACE_MS)
    }

    /// Whether an entry recorded at `timestamp` has expired at `now`.
    pub fn is_expired(&self, timestamp: u64, now: u64) -> bool {
        now >= self.expiry(timestamp)
    }
}

/// An immutable set of windows with unique durations, shortest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowConfig {
    windows: Vec<Window>,
}

impl WindowConfig {
    /// Build a configuration from `(duration_secs, limit)` pairs.
    ///
    /// Fails on any non-positive value or repeated duration.
    pub fn new<I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (u64, u64)>,
    {
        let mut by_duration = BTreeMap::new();
        for (duration_secs, limit) in pairs {
            let window = Window::new(duration_secs, limit)?;
            if by_duration.insert(duration_secs, window).is_some() {
                return Err(RateWardenError::DuplicateWindow(duration_secs));
            }
        }

        Ok(Self {
            windows: by_duration.into_values().collect(),
        })
    }

    /// A configuration with no windows; every request is admitted.
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn windows(&self) -> &[Window] {
        &self.windows
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Position of the window with the given duration.
    pub fn position(&self, duration_secs: u64) -> Option<usize> {
        self.windows
            .iter()
            .position(|w| w.duration_secs == duration_secs)
    }
}

impl std::fmt::Display for WindowConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.windows.is_empty() {
            return write!(f, "unlimited");
        }
        let parts: Vec<String> = self
            .windows
            .iter()
            .map(|w| format!("{}/{}s", w.limit, w.duration_secs))
            .collect();
        write!(f, "{}", parts.join(", "))
    }
}
