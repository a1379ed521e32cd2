//! Hub-specific error types.

use thiserror::Error;

/// Errors that can occur inside the hub and its collaborators.
#[derive(Error, Debug)]
pub enum HubError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Storage error: {0}")]
    Storage(#[from] statshub_storage::StorageError),
}

impl HubError {
    /// Get the error type as a string for metrics labeling.
    pub fn error_type(&self) -> &'static str {
        match self {
            HubError::Io(_) => "io",
            HubError::Json(_) => "json",
            HubError::Transport(_) => "transport",
            HubError::Config(_) => "config",
            HubError::Auth(_) => "auth",
            HubError::Schema(_) => "schema",
            HubError::Storage(_) => "storage",
        }
    }
}

pub type Result<T> = std::result::Result<T, HubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HubError::Schema("root must be an object".to_string());
        assert_eq!(err.to_string(), "Schema error: root must be an object");
        assert_eq!(err.error_type(), "schema");
    }
}
