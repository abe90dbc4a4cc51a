//! Elevation configuration

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::types::PermissionLevel;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElevationConfig {
    /// Largest level increase granted without a supervisor
    #[serde(rename = "max-auto-elevation", default = "default_max_auto_elevation")]
    pub max_auto_elevation: u8,

    /// Auto-approvals allowed per agent type in any rolling hour
    #[serde(rename = "rate-limit-per-hour", default = "default_rate_limit_per_hour")]
    pub rate_limit_per_hour: usize,

    /// Lifetime of a grant in seconds
    #[serde(rename = "elevation-timeout-secs", default = "default_elevation_timeout_secs")]
    pub elevation_timeout_secs: u64,

    /// Highest level any request may ask for
    #[serde(default = "default_ceiling")]
    pub ceiling: PermissionLevel,

    /// Per agent type ceilings overriding `ceiling`
    #[serde(rename = "agent-ceilings", default)]
    pub agent_ceilings: HashMap<String, PermissionLevel>,

    /// Audit entries kept before the oldest half is evicted
    #[serde(rename = "max-history", default = "default_max_history")]
    pub max_history: usize,
}

fn default_max_auto_elevation() -> u8 {
    debug!("default_max_auto_elevation: called");
    1
}

fn default_rate_limit_per_hour() -> usize {
    debug!("default_rate_limit_per_hour: called");
    10
}

fn default_elevation_timeout_secs() -> u64 {
    debug!("default_elevation_timeout_secs: called");
    300
}

fn default_ceiling() -> PermissionLevel {
    debug!("default_ceiling: called");
    PermissionLevel::ADMIN
}

fn default_max_history() -> usize {
    debug!("default_max_history: called");
    1000
}

impl Default for ElevationConfig {
    fn default() -> Self {
        debug!("ElevationConfig::default: called");
        Self {
            max_auto_elevation: default_max_auto_elevation(),
            rate_limit_per_hour: default_rate_limit_per_hour(),
            elevation_timeout_secs: default_elevation_timeout_secs(),
            ceiling: default_ceiling(),
            agent_ceilings: HashMap::new(),
            max_history: default_max_history(),
        }
    }
}

impl ElevationConfig {
    pub fn ceiling_for(&self, agent_type: &str) -> PermissionLevel {
        self.agent_ceilings.get(agent_type).copied().unwrap_or(self.ceiling)
    }

    pub fn grant_lifetime(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.elevation_timeout_secs as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ElevationConfig::default();
        assert_eq!(config.max_auto_elevation, 1);
        assert_eq!(config.rate_limit_per_hour, 10);
        assert_eq!(config.grant_lifetime(), chrono::Duration::seconds(300));
        assert_eq!(config.ceiling, PermissionLevel::ADMIN);
        assert_eq!(config.max_history, 1000);
    }

    #[test]
    fn test_agent_ceiling_override() {
        let yaml = "ceiling: 3\nagent-ceilings:\n  intern: 1\n";
        let config: ElevationConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.ceiling_for("intern"), PermissionLevel::STANDARD);
        assert_eq!(config.ceiling_for("coder"), PermissionLevel::ADMIN);
    }
}
