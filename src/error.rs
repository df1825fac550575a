//! Error types for the Ratewarden crate.

use thiserror::Error;

/// Main error type for Ratewarden operations.
///
/// Rejecting a request is not an error: admission checks answer with a
/// plain `bool`. These variants cover configuration and lookup failures.
#[derive(Error, Debug)]
pub enum RateWardenError {
    /// A window with a zero duration or a zero limit
    #[error("Invalid window: duration {duration_secs}s, limit {limit} (both must be positive)")]
    InvalidWindow { duration_secs: u64, limit: u64 },

    /// The same window duration configured twice
    #[error("Duplicate window duration: {0}s")]
    DuplicateWindow(u64),

    /// A policy name that is not configured
    #[error("Unknown rate limit policy: {0}")]
    UnknownPolicy(String),

    /// The same policy name configured twice
    #[error("Duplicate rate limit policy: {0}")]
    DuplicatePolicy(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors raised while assembling layered configuration
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Ratewarden operations.
pub type Result<T> = std::result::Result<T, RateWardenError>;
