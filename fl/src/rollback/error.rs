//! Journal error types

use sharedstore::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("No snapshot of {path} in {scope}")]
    SnapshotNotFound { scope: String, path: String },

    #[error("Cannot capture {path} in {scope}: already rolled back")]
    AlreadyRolledBack { scope: String, path: String },

    #[error("Cannot snapshot {0} for deletion: file does not exist")]
    MissingFile(String),

    #[error("Corrupt rollback record {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
