//! Lock configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Retry policy for one class of locks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockProfile {
    /// Lock lifetime in milliseconds
    #[serde(rename = "ttl-ms")]
    pub ttl_ms: u64,

    /// Pause between acquisition attempts in milliseconds
    #[serde(rename = "retry-interval-ms")]
    pub retry_interval_ms: u64,

    /// Attempts after the first before giving up
    #[serde(rename = "max-retries")]
    pub max_retries: u32,
}

impl LockProfile {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

fn default_profile() -> LockProfile {
    debug!("default_profile: called");
    LockProfile {
        ttl_ms: 30_000,
        retry_interval_ms: 100,
        max_retries: 50,
    }
}

fn default_agent_status_profile() -> LockProfile {
    debug!("default_agent_status_profile: called");
    LockProfile {
        ttl_ms: 5_000,
        retry_interval_ms: 50,
        max_retries: 100,
    }
}

fn default_task_profile() -> LockProfile {
    debug!("default_task_profile: called");
    LockProfile {
        ttl_ms: 300_000,
        retry_interval_ms: 500,
        max_retries: 3,
    }
}

/// Lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Policy for plain `acquire` calls that do not override it
    #[serde(default = "default_profile")]
    pub default: LockProfile,

    /// Per-agent status locks: short-lived, retried quickly and often
    #[serde(rename = "agent-status", default = "default_agent_status_profile")]
    pub agent_status: LockProfile,

    /// Per-task locks: long-lived, few retries so queues fail fast
    #[serde(default = "default_task_profile")]
    pub task: LockProfile,
}

impl Default for LockConfig {
    fn default() -> Self {
        debug!("LockConfig::default: called");
        Self {
            default: default_profile(),
            agent_status: default_agent_status_profile(),
            task: default_task_profile(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LockConfig::default();
        assert_eq!(config.agent_status.ttl(), Duration::from_secs(5));
        assert_eq!(config.agent_status.retry_interval(), Duration::from_millis(50));
        assert_eq!(config.agent_status.max_retries, 100);
        assert_eq!(config.task.ttl(), Duration::from_secs(300));
        assert_eq!(config.task.max_retries, 3);
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = r#"
task:
  ttl-ms: 1000
  retry-interval-ms: 10
  max-retries: 1
"#;
        let config: LockConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.task.ttl_ms, 1000);
        assert_eq!(config.agent_status, default_agent_status_profile());
    }
}
