//! Bus configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Default wait for a reply in seconds
    #[serde(rename = "request-timeout-secs", default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// How long one blocking stream read waits in milliseconds
    #[serde(rename = "block-ms", default = "default_block_ms")]
    pub block_ms: u64,

    /// Entries fetched per read
    #[serde(rename = "read-count", default = "default_read_count")]
    pub read_count: usize,

    /// Streams are trimmed to roughly this many entries
    #[serde(rename = "stream-max-len", default = "default_stream_max_len")]
    pub stream_max_len: usize,

    /// Pause after a store error before reading again in milliseconds
    #[serde(rename = "error-backoff-ms", default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
}

fn default_request_timeout_secs() -> u64 {
    debug!("default_request_timeout_secs: called");
    30
}

fn default_block_ms() -> u64 {
    debug!("default_block_ms: called");
    1000
}

fn default_read_count() -> usize {
    debug!("default_read_count: called");
    10
}

fn default_stream_max_len() -> usize {
    debug!("default_stream_max_len: called");
    10_000
}

fn default_error_backoff_ms() -> u64 {
    debug!("default_error_backoff_ms: called");
    1000
}

impl Default for BusConfig {
    fn default() -> Self {
        debug!("BusConfig::default: called");
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            block_ms: default_block_ms(),
            read_count: default_read_count(),
            stream_max_len: default_stream_max_len(),
            error_backoff_ms: default_error_backoff_ms(),
        }
    }
}

impl BusConfig {
    pub fn request_timeout(&self) -> Duration {
        debug!(request_timeout_secs = %self.request_timeout_secs, "BusConfig::request_timeout: called");
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}
