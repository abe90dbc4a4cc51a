//! Pub/Sub configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubSubConfig {
    /// How long one poll waits for a message before looping
    #[serde(rename = "poll-timeout-ms", default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Pause after a store error before polling again
    #[serde(rename = "error-backoff-ms", default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
}

fn default_poll_timeout_ms() -> u64 {
    debug!("default_poll_timeout_ms: called");
    100
}

fn default_error_backoff_ms() -> u64 {
    debug!("default_error_backoff_ms: called");
    500
}

impl Default for PubSubConfig {
    fn default() -> Self {
        debug!("PubSubConfig::default: called");
        Self {
            poll_timeout_ms: default_poll_timeout_ms(),
            error_backoff_ms: default_error_backoff_ms(),
        }
    }
}

impl PubSubConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}
