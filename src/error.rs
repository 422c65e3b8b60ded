//! Error types for the Naginata library.
//!
//! All errors are represented by the [`NaginataError`] enum, which provides
//! detailed information about what went wrong.
//!
//! # Examples
//!
//! ```
//! use naginata::error::{NaginataError, Result};
//!
//! fn example_operation() -> Result<()> {
//!     Err(NaginataError::invalid_state("log already capped"))
//! }
//!
//! assert!(example_operation().is_err());
//! ```

use std::io;

use thiserror::Error;

/// The main error type for Naginata operations.
///
/// This enum represents all possible errors that can occur in the library.
/// It uses the `thiserror` crate for automatic `Error` trait implementation
/// and provides convenient constructor methods for the string-payload
/// variants.
#[derive(Error, Debug)]
pub enum NaginataError {
    /// I/O errors (file operations, append/flush failures, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration errors (bad paths, conflicting directories).
    #[error("Config error: {0}")]
    Config(String),

    /// Storage-related errors (log directory, file lifecycle).
    #[error("Storage error: {0}")]
    Storage(String),

    /// Index-related errors from the index-writer boundary.
    #[error("Index error: {0}")]
    Index(String),

    /// A log record that could not be decoded.
    #[error("Corrupt log record: {0}")]
    CorruptLog(String),

    /// An operation observed state that violates an internal invariant.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Back-pressure from a downstream component; callers may retry.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Unexpected internal failures (unknown op codes and the like).
    #[error("Server error: {0}")]
    Server(String),

    /// JSON serialization/deserialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic anyhow error.
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),

    /// Generic error for other cases.
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias for operations that may fail with [`NaginataError`].
pub type Result<T> = std::result::Result<T, NaginataError>;

impl NaginataError {
    /// Create a new config error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        NaginataError::Config(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        NaginataError::Storage(msg.into())
    }

    /// Create a new index error.
    pub fn index<S: Into<String>>(msg: S) -> Self {
        NaginataError::Index(msg.into())
    }

    /// Create a new corrupt-log error.
    pub fn corrupt_log<S: Into<String>>(msg: S) -> Self {
        NaginataError::CorruptLog(msg.into())
    }

    /// Create a new invalid-state error.
    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        NaginataError::InvalidState(msg.into())
    }

    /// Create a new service-unavailable error.
    pub fn service_unavailable<S: Into<String>>(msg: S) -> Self {
        NaginataError::ServiceUnavailable(msg.into())
    }

    /// Create a new server error.
    pub fn server<S: Into<String>>(msg: S) -> Self {
        NaginataError::Server(msg.into())
    }

    /// Create a generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        NaginataError::Other(msg.into())
    }

    /// Whether this error signals downstream back-pressure.
    ///
    /// Replay latches on this condition and aborts instead of counting the
    /// error and continuing.
    pub fn is_service_unavailable(&self) -> bool {
        matches!(self, NaginataError::ServiceUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NaginataError::config("dir escapes instance dir");
        assert_eq!(err.to_string(), "Config error: dir escapes instance dir");

        let err = NaginataError::corrupt_log("short frame");
        assert_eq!(err.to_string(), "Corrupt log record: short frame");

        let err = NaginataError::invalid_state("not an ADD");
        assert_eq!(err.to_string(), "Invalid state: not an ADD");
    }

    #[test]
    fn test_service_unavailable_detection() {
        assert!(NaginataError::service_unavailable("busy").is_service_unavailable());
        assert!(!NaginataError::server("boom").is_service_unavailable());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "missing");
        let err: NaginataError = io_err.into();
        assert!(matches!(err, NaginataError::Io(_)));
    }
}
