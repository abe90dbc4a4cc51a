//! Message envelope shared by the bus and pub/sub
//!
//! Every message on the wire is one flat JSON object: the envelope fields
//! plus the fields of its kind, discriminated by `type`.
//!
//! ```json
//! {"id":"...","timestamp":"...","source":"planner","target":"worker",
//!  "type":"task_request","task_type":"edit","payload":{},"priority":5,...}
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;
use uuid::Uuid;

/// Lowest task priority
pub const MIN_PRIORITY: u8 = 1;
/// Highest task priority
pub const MAX_PRIORITY: u8 = 10;

fn default_priority() -> u8 {
    5
}

fn default_timeout_seconds() -> u64 {
    300
}

fn clamp_priority<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = i64::deserialize(deserializer)?;
    Ok(raw.clamp(MIN_PRIORITY as i64, MAX_PRIORITY as i64) as u8)
}

/// Lifecycle status reported for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Availability of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Idle,
    Busy,
    Error,
    Offline,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Error => "error",
            Self::Offline => "offline",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for AgentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "idle" => Ok(Self::Idle),
            "busy" => Ok(Self::Busy),
            "error" => Ok(Self::Error),
            "offline" => Ok(Self::Offline),
            _ => Err(format!("Unknown agent state: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl std::str::FromStr for AlertSeverity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Self::Info),
            "warning" | "warn" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("Unknown severity: {}. Use: info, warning, error, or critical", s)),
        }
    }
}

// === Kinds ===

/// Ask an agent (or any agent) to run a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub target_agent: Option<String>,
    /// 1 (lowest) to 10 (highest); out-of-range values are clamped
    #[serde(default = "default_priority", deserialize_with = "clamp_priority")]
    pub priority: u8,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl TaskRequest {
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            target_agent: None,
            priority: default_priority(),
            timeout_seconds: default_timeout_seconds(),
            user_id: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(MIN_PRIORITY, MAX_PRIORITY);
        self
    }

    pub fn with_target_agent(mut self, agent: impl Into<String>) -> Self {
        self.target_agent = Some(agent.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

impl TaskResponse {
    pub fn completed(task_id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Completed,
            result: Some(result),
            error: None,
            duration_ms: None,
        }
    }

    pub fn failed(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Failed,
            result: None,
            error: Some(error.into()),
            duration_ms: None,
        }
    }

    pub fn cancelled(task_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Cancelled,
            result: None,
            error: Some(reason.into()),
            duration_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub task_id: String,
    /// Percent complete, 0 to 100
    pub percent: u8,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub step: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent_id: String,
    pub status: AgentState,
    #[serde(default)]
    pub current_task: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub agent_id: String,
    pub status: AgentState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub tool_name: String,
    pub success: bool,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemAlert {
    pub severity: AlertSeverity,
    pub title: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserNotification {
    pub user_id: String,
    pub title: String,
    #[serde(default)]
    pub message: String,
}

/// Every message kind the fleet understands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageKind {
    TaskRequest(TaskRequest),
    TaskResponse(TaskResponse),
    TaskProgress(TaskProgress),
    AgentStatus(AgentStatus),
    Heartbeat(Heartbeat),
    ToolCall(ToolCall),
    ToolResult(ToolResult),
    SystemAlert(SystemAlert),
    UserNotification(UserNotification),
}

/// Field-less discriminant of [`MessageKind`], used to key handler registries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskRequest,
    TaskResponse,
    TaskProgress,
    AgentStatus,
    Heartbeat,
    ToolCall,
    ToolResult,
    SystemAlert,
    UserNotification,
}

impl MessageType {
    pub const ALL: [MessageType; 9] = [
        Self::TaskRequest,
        Self::TaskResponse,
        Self::TaskProgress,
        Self::AgentStatus,
        Self::Heartbeat,
        Self::ToolCall,
        Self::ToolResult,
        Self::SystemAlert,
        Self::UserNotification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskRequest => "task_request",
            Self::TaskResponse => "task_response",
            Self::TaskProgress => "task_progress",
            Self::AgentStatus => "agent_status",
            Self::Heartbeat => "heartbeat",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::SystemAlert => "system_alert",
            Self::UserNotification => "user_notification",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Unknown message type: {}", s))
    }
}

impl MessageKind {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::TaskRequest(_) => MessageType::TaskRequest,
            Self::TaskResponse(_) => MessageType::TaskResponse,
            Self::TaskProgress(_) => MessageType::TaskProgress,
            Self::AgentStatus(_) => MessageType::AgentStatus,
            Self::Heartbeat(_) => MessageType::Heartbeat,
            Self::ToolCall(_) => MessageType::ToolCall,
            Self::ToolResult(_) => MessageType::ToolResult,
            Self::SystemAlert(_) => MessageType::SystemAlert,
            Self::UserNotification(_) => MessageType::UserNotification,
        }
    }
}

// === Envelope ===

/// A message with its routing envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Id of the request this message answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Service that sent the message
    pub source: String,
    /// Service the message is addressed to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(flatten)]
    pub kind: MessageKind,
}

impl Message {
    pub fn new(source: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            timestamp: Utc::now(),
            correlation_id: None,
            source: source.into(),
            target: None,
            kind,
        }
    }

    /// Build the reply to `request`
    ///
    /// The reply is addressed back to the request's source, sent from the
    /// request's target, and correlated by the request's id.
    pub fn reply(request: &Message, kind: MessageKind) -> Self {
        debug!(request_id = %request.id, "Message::reply: called");
        Self {
            id: Uuid::now_v7().to_string(),
            timestamp: Utc::now(),
            correlation_id: Some(request.id.clone()),
            source: request.target.clone().unwrap_or_default(),
            target: Some(request.source.clone()),
            kind,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.kind.message_type()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flat_wire_format() {
        let msg = Message::new(
            "planner",
            MessageKind::TaskRequest(TaskRequest::new("edit", json!({"file": "a.txt"}))),
        )
        .with_target("worker");

        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "task_request");
        assert_eq!(value["task_type"], "edit");
        assert_eq!(value["source"], "planner");
        assert_eq!(value["target"], "worker");
        assert!(value.get("correlation_id").is_none());
    }

    #[test]
    fn test_decode_from_json() {
        let raw = r#"{"id":"1","timestamp":"2025-01-01T00:00:00Z","source":"w","type":"task_response",
                      "task_id":"t1","status":"completed","result":{"ok":true}}"#;
        let msg = Message::from_json(raw).unwrap();
        match msg.kind {
            MessageKind::TaskResponse(resp) => {
                assert_eq!(resp.status, TaskStatus::Completed);
                assert_eq!(resp.task_id, "t1");
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let raw = r#"{"id":"1","timestamp":"2025-01-01T00:00:00Z","source":"w","type":"launch_missiles"}"#;
        assert!(Message::from_json(raw).is_err());
    }

    #[test]
    fn test_priority_is_clamped() {
        let raw = r#"{"id":"1","timestamp":"2025-01-01T00:00:00Z","source":"w","type":"task_request",
                      "task_type":"x","priority":42}"#;
        match Message::from_json(raw).unwrap().kind {
            MessageKind::TaskRequest(req) => {
                assert_eq!(req.priority, MAX_PRIORITY);
                assert_eq!(req.timeout_seconds, 300);
            }
            _ => panic!("Wrong variant"),
        }

        let req = TaskRequest::new("x", json!(null)).with_priority(0);
        assert_eq!(req.priority, MIN_PRIORITY);
    }

    #[test]
    fn test_reply_correlates_and_swaps_route() {
        let request = Message::new("planner", MessageKind::TaskRequest(TaskRequest::new("x", json!({}))))
            .with_target("worker");
        let reply = Message::reply(
            &request,
            MessageKind::TaskResponse(TaskResponse::completed("t", json!(1))),
        );

        assert_eq!(reply.correlation_id.as_deref(), Some(request.id.as_str()));
        assert_eq!(reply.source, "worker");
        assert_eq!(reply.target.as_deref(), Some("planner"));
        assert_ne!(reply.id, request.id);
    }

    #[test]
    fn test_message_type_names() {
        for t in MessageType::ALL {
            assert_eq!(t.as_str().parse::<MessageType>().unwrap(), t);
        }
        assert_eq!(
            serde_json::to_string(&MessageType::UserNotification).unwrap(),
            "\"user_notification\""
        );
        assert_eq!(serde_json::to_string(&AgentState::Busy).unwrap(), "\"busy\"");
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }
}
