//! Common error types for the SFU signaling crates.

use thiserror::Error;

/// Errors raised while parsing shared wire types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommonError {
    /// Media kind was neither `audio` nor `video`
    #[error("Invalid media kind: {0}")]
    InvalidMediaKind(String),

    /// Transport direction was neither `send` nor `recv`
    #[error("Invalid transport direction: {0}")]
    InvalidDirection(String),

    /// Identifier was not a valid UUID
    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    /// Log format was neither `text` nor `json`
    #[error("Invalid log format: {0}")]
    InvalidLogFormat(String),
}

/// Result type alias using `CommonError`
pub type Result<T> = std::result::Result<T, CommonError>;
