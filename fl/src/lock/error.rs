//! Lock error types

use std::time::Duration;

use sharedstore::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock {0} is held by another owner")]
    NotAcquired(String),

    #[error("Timed out after {waited:?} waiting for lock {key}")]
    Timeout { key: String, waited: Duration },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
