//! Error types for stratadb
//!
//! Provides a unified error type for the table build and read paths.
//!
//! Variants carry owned strings rather than source errors so that the
//! builder's sticky first-error status can be cloned and handed back from
//! every subsequent call.

use thiserror::Error;

/// Result type alias using StrataError
pub type Result<T> = std::result::Result<T, StrataError>;

/// Unified error type for stratadb operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StrataError {
    /// File create/write/sync/close failures
    #[error("io error: {0}")]
    Io(String),

    /// Malformed keys, failed checksums, undecodable blocks
    #[error("corruption: {0}")]
    Corruption(String),

    /// The upstream key/value iterator reported a failure
    #[error("iteration error: {0}")]
    Iteration(String),

    /// Internal state machine violation; the build is abandoned
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Requested feature is not available (e.g. unknown codec)
    #[error("not supported: {0}")]
    NotSupported(String),
}

impl From<std::io::Error> for StrataError {
    fn from(err: std::io::Error) -> Self {
        StrataError::Io(err.to_string())
    }
}
