//! Error types for TraceBlock

use thiserror::Error;

/// Result type alias for TraceBlock operations
pub type Result<T> = std::result::Result<T, BlockError>;

/// TraceBlock error types
#[derive(Error, Debug)]
pub enum BlockError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Missing or malformed argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A previous write or complete failed; the block must be discarded
    #[error("Block is poisoned by an earlier failure")]
    Poisoned,

    /// Operation not allowed in the block's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Metadata (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BlockError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, BlockError::Io(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            BlockError::InvalidFormat(_) | BlockError::ChecksumMismatch { .. }
        )
    }
}
