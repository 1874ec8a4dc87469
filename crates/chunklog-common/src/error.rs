//! Error types for chunklog
//!
//! Only contract violations on the write path and unknown logs surface to
//! callers. Storage failures on the read path are absorbed by the engine.

use crate::types::LogId;
use thiserror::Error;

/// Common result type for chunklog operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for chunklog
#[derive(Debug, Error)]
pub enum Error {
    #[error("log not found: {0}")]
    LogNotFound(LogId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("metadata store error: {0}")]
    Metadata(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a metadata store error
    pub fn metadata(msg: impl Into<String>) -> Self {
        Self::Metadata(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Contract violations are rejected synchronously and never retried
    #[must_use]
    pub const fn is_contract_violation(&self) -> bool {
        matches!(self, Self::InvalidArgument(_) | Self::Configuration(_))
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::LogNotFound(_))
    }
}
