//! Bus error types

use std::time::Duration;

use sharedstore::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Request {request_id} timed out after {after:?}")]
    Timeout { request_id: String, after: Duration },

    #[error("Message {0} has no target")]
    MissingTarget(String),

    #[error("Request {0} is already awaiting a reply")]
    DuplicateRequest(String),

    #[error("Pending request {0} was dropped before a reply arrived")]
    Abandoned(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
