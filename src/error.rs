//! Error types for ratewarden.

use thiserror::Error;

/// Main error type for ratewarden operations.
///
/// The limiter core never produces these: reservations are only ever delayed.
/// They surface from configuration loading and from the response header
/// parsers, whose callers fold them into "no limits available".
#[derive(Error, Debug)]
pub enum RatewardenError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A `limit:seconds` entry that could not be parsed or is out of range
    #[error("Invalid rate limit: {0}")]
    InvalidLimit(String),

    /// A `Date` header that is not an RFC 7231 IMF-fixdate
    #[error("Invalid date header: {0}")]
    InvalidDate(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for RatewardenError {
    fn from(err: config::ConfigError) -> Self {
        RatewardenError::Config(err.to_string())
    }
}

/// Result type alias for ratewarden operations.
pub type Result<T> = std::result::Result<T, RatewardenError>;
