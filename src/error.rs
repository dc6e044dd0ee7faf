//! Error types for query operations.

use std::fmt;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by fetches, descriptors and configuration.
///
/// Fetch failures (`NetworkError`, `DecodeError`) end up inside a failed
/// [`CacheEntry`](crate::entry::CacheEntry); the cache itself treats them as opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Transport failure or non-success response status.
    NetworkError(String),

    /// Response body was not in the expected shape.
    DecodeError(String),

    /// A descriptor or builder was given invalid input.
    ValidationError(String),

    /// Invalid configuration value.
    ConfigError(String),

    /// The fetch panicked or its task was cancelled before producing an outcome.
    FetchAborted(String),
}

impl Error {
    /// True for transport-level failures.
    pub fn is_network(&self) -> bool {
        matches!(self, Error::NetworkError(_))
    }

    /// True when the body could not be decoded.
    pub fn is_decode(&self) -> bool {
        matches!(self, Error::DecodeError(_))
    }

    /// True when the fetch never produced an outcome of its own.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::FetchAborted(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NetworkError(msg) => write!(f, "network error: {}", msg),
            Error::DecodeError(msg) => write!(f, "decode error: {}", msg),
            Error::ValidationError(msg) => write!(f, "validation error: {}", msg),
            Error::ConfigError(msg) => write!(f, "config error: {}", msg),
            Error::FetchAborted(msg) => write!(f, "fetch aborted: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::DecodeError(e.to_string())
    }
}
