//! Storage error types.

use std::io;
use thiserror::Error;

/// Record store operation errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error during a store operation
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Record could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Store is not reachable (startup connection test failed)
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Store backend rejected the write
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StorageError>;

impl StorageError {
    /// Get the error type as a string for metrics labeling.
    pub fn error_type(&self) -> &'static str {
        match self {
            StorageError::Io(_) => "io",
            StorageError::Serialization(_) => "serialization",
            StorageError::Unavailable(_) => "unavailable",
            StorageError::Backend(_) => "backend",
        }
    }
}
