//! Error types for the document store abstraction

use std::fmt;
use thiserror::Error;

use crate::error::{ErrorCode, SchemaFlowError};

/// Result type for store operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Store error types
#[derive(Error, Debug)]
pub enum StorageError {
    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Item not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// A write group precondition did not hold (concurrent modification)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A write group carried more mutations than the store accepts atomically
    #[error("Write group of {size} mutations exceeds the limit of {limit}")]
    CapacityExceeded { size: usize, limit: usize },

    /// Store backend unavailable
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// A commit failed without being applied
    #[error("Commit failed: {0}")]
    CommitFailed(String),

    /// Invalid query or mutation
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Timeout occurred
    #[error("Timeout: operation took longer than {0:?}")]
    Timeout(std::time::Duration),
}

impl StorageError {
    /// Create a serialization error
    pub fn serialization<E: fmt::Display>(err: E) -> Self {
        Self::Serialization(err.to_string())
    }

    /// Create a not found error
    pub fn not_found<E: fmt::Display>(item: E) -> Self {
        Self::NotFound(item.to_string())
    }

    /// Create a conflict error
    pub fn conflict<E: fmt::Display>(msg: E) -> Self {
        Self::Conflict(msg.to_string())
    }

    /// Create an unavailable error
    pub fn unavailable<E: fmt::Display>(msg: E) -> Self {
        Self::Unavailable(msg.to_string())
    }

    /// Create an invalid request error
    pub fn invalid<E: fmt::Display>(msg: E) -> Self {
        Self::InvalidRequest(msg.to_string())
    }

    /// Check if this is a retryable error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::CommitFailed(_) | Self::Timeout(_)
        )
    }

    /// Check if this is a conflict error
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}

/// Convert StorageError to SchemaFlowError
impl From<StorageError> for SchemaFlowError {
    fn from(err: StorageError) -> Self {
        let code = match &err {
            StorageError::Serialization(_) => ErrorCode::STORAGE_SERIALIZATION_ERROR,
            StorageError::NotFound(_) => ErrorCode::STORAGE_NOT_FOUND,
            StorageError::Conflict(_) => ErrorCode::STORAGE_CONFLICT,
            StorageError::CapacityExceeded { .. } => ErrorCode::STORAGE_CAPACITY,
            StorageError::Unavailable(_) => ErrorCode::STORAGE_UNAVAILABLE,
            StorageError::CommitFailed(_) | StorageError::Timeout(_) => {
                ErrorCode::STORAGE_TEMPORARY
            }
            StorageError::InvalidRequest(_) => ErrorCode::STORAGE_GENERIC,
        };
        let retryable = err.is_retryable();

        SchemaFlowError::storage_with_code(code, err.to_string(), retryable).with_source(err)
    }
}
