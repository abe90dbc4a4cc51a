//! Well-known channel names

pub const TASK_REQUESTS: &str = "agent:tasks:requests";
pub const TASK_RESPONSES: &str = "agent:tasks:responses";
pub const AGENT_STATUS: &str = "agent:status";
pub const AGENT_EVENTS: &str = "agent:events";
pub const SYSTEM_ALERTS: &str = "system:alerts";
pub const USER_NOTIFICATIONS: &str = "user:notifications";

/// Matches every per-agent event channel
pub const AGENT_EVENTS_PATTERN: &str = "agent:*:events";
/// Matches every per-task channel
pub const TASK_PATTERN: &str = "task:*";

pub fn agent_events(agent_id: &str) -> String {
    format!("agent:{}:events", agent_id)
}

pub fn task_progress(task_id: &str) -> String {
    format!("task:{}:progress", task_id)
}

pub fn task_control(task_id: &str) -> String {
    format!("task:{}:control", task_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_entity_channels() {
        assert_eq!(agent_events("a1"), "agent:a1:events");
        assert_eq!(task_progress("t1"), "task:t1:progress");
        assert_eq!(task_control("t1"), "task:t1:control");
    }
}
