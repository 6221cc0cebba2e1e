//! Write batch error types

use thiserror::Error;

/// Errors raised while building, decoding or applying a write batch
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    /// Malformed record, unknown tag or a header that lies about its content
    #[error("Corruption: {0}")]
    Corruption(String),

    /// Unknown column family (when not tolerated) or unimplemented handler hook
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not available for this table format or engine configuration
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Savepoint stack empty, or point lookup miss
    #[error("Not found: {0}")]
    NotFound(String),

    /// Append would grow the batch past its configured limit
    #[error("Memory limit reached: batch would be {size} bytes (max {max})")]
    MemoryLimit { size: usize, max: usize },

    /// Merge operator could not combine the operands
    #[error("Merge failed: {0}")]
    MergeFailed(String),
}

impl BatchError {
    pub(crate) fn corruption(msg: &str) -> Self {
        Self::Corruption(msg.to_string())
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption(_))
    }

    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }
}

/// Result type for write batch operations
pub type BatchResult<T> = Result<T, BatchError>;
