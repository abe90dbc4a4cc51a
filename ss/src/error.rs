//! Store error types

use thiserror::Error;

/// Errors that can occur talking to the shared store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid stream id: {0}")]
    InvalidStreamId(String),

    #[error("Invalid subscription pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_pattern_message() {
        let err = StoreError::InvalidPattern {
            pattern: "agent:[".to_string(),
            message: "unterminated".to_string(),
        };

        let msg = err.to_string();
        assert!(msg.contains("agent:["));
        assert!(msg.contains("unterminated"));
    }

    #[test]
    fn test_invalid_stream_id_message() {
        let err = StoreError::InvalidStreamId("abc".to_string());
        assert!(err.to_string().contains("abc"));
    }
}
