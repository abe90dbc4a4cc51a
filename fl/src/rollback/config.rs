//! Rollback journal configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackConfig {
    /// Lifetime of plan and task records in the store, in seconds
    #[serde(rename = "record-ttl-secs", default = "default_record_ttl_secs")]
    pub record_ttl_secs: u64,
}

fn default_record_ttl_secs() -> u64 {
    debug!("default_record_ttl_secs: called");
    7 * 24 * 60 * 60
}

impl Default for RollbackConfig {
    fn default() -> Self {
        debug!("RollbackConfig::default: called");
        Self {
            record_ttl_secs: default_record_ttl_secs(),
        }
    }
}

impl RollbackConfig {
    pub fn record_ttl(&self) -> Duration {
        Duration::from_secs(self.record_ttl_secs)
    }
}
