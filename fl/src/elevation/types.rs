//! Elevation domain types

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ordered permission level; higher is more privileged
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionLevel(pub u8);

impl PermissionLevel {
    pub const READ_ONLY: PermissionLevel = PermissionLevel(0);
    pub const STANDARD: PermissionLevel = PermissionLevel(1);
    pub const ELEVATED: PermissionLevel = PermissionLevel(2);
    pub const ADMIN: PermissionLevel = PermissionLevel(3);
    pub const SYSTEM: PermissionLevel = PermissionLevel(4);

    /// Signed distance from `self` up to `target`
    pub fn delta_to(&self, target: PermissionLevel) -> i16 {
        target.0 as i16 - self.0 as i16
    }

    pub fn name(&self) -> Option<&'static str> {
        match self.0 {
            0 => Some("read_only"),
            1 => Some("standard"),
            2 => Some("elevated"),
            3 => Some("admin"),
            4 => Some("system"),
            _ => None,
        }
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}({})", name, self.0),
            None => write!(f, "level({})", self.0),
        }
    }
}

/// Who is asking, and at what standing level
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentContext {
    pub agent_id: String,
    /// Grants and rate limits are tracked per agent type
    pub agent_type: String,
    pub base_level: PermissionLevel,
}

impl AgentContext {
    pub fn new(agent_id: impl Into<String>, agent_type: impl Into<String>, base_level: PermissionLevel) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            base_level,
        }
    }
}

/// A request waiting for supervisor approval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElevationRequest {
    pub id: String,
    pub agent_type: String,
    pub task_id: Option<String>,
    pub tool_name: String,
    pub current_level: PermissionLevel,
    pub requested_level: PermissionLevel,
    pub reason: String,
    pub justification: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Temporary permission above an agent type's base level
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElevationGrant {
    pub id: String,
    pub request_id: String,
    pub agent_type: String,
    pub granted_level: PermissionLevel,
    pub granted_by: String,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Tool the grant is limited to; `None` covers every tool
    pub scope: Option<String>,
}

impl ElevationGrant {
    pub(crate) fn new(
        request_id: String,
        agent_type: String,
        granted_level: PermissionLevel,
        granted_by: String,
        lifetime: chrono::Duration,
        scope: Option<String>,
    ) -> Self {
        let granted_at = Utc::now();
        Self {
            id: Uuid::now_v7().to_string(),
            request_id,
            agent_type,
            granted_level,
            granted_by,
            granted_at,
            expires_at: granted_at + lifetime,
            scope,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Whether the grant covers `tool`; an unscoped query matches every grant
    pub fn applies_to(&self, tool: Option<&str>) -> bool {
        match (&self.scope, tool) {
            (Some(scope), Some(tool)) => scope == tool,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElevationDecision {
    AutoApproved,
    Approved,
    Denied,
    RateLimited,
    CeilingExceeded,
    Revoked,
}

/// Why a request was refused without reaching a supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    RateLimited,
    CeilingExceeded,
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited => write!(f, "rate limit exceeded"),
            Self::CeilingExceeded => write!(f, "elevation ceiling exceeded"),
        }
    }
}

/// Immutable audit entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElevationRecord {
    pub id: String,
    pub request_id: String,
    pub agent_type: String,
    pub task_id: Option<String>,
    pub tool_name: String,
    pub from_level: PermissionLevel,
    pub to_level: PermissionLevel,
    pub decision: ElevationDecision,
    pub decided_by: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Result of `request_elevation`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElevationOutcome {
    AutoApproved(ElevationGrant),
    /// Waiting for `approve_elevation` or `deny_elevation`
    Pending(ElevationRequest),
    Denied {
        reason: DenialReason,
        record: ElevationRecord,
    },
}

impl ElevationOutcome {
    pub fn is_auto_approved(&self) -> bool {
        matches!(self, Self::AutoApproved(_))
    }

    pub fn grant(&self) -> Option<&ElevationGrant> {
        match self {
            Self::AutoApproved(grant) => Some(grant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElevationStats {
    pub pending: usize,
    pub active_grants: usize,
    pub history: usize,
    pub auto_approved: u64,
    pub approved: u64,
    pub denied: u64,
    pub rate_limited: u64,
    pub ceiling_exceeded: u64,
    pub revoked: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn grant(lifetime_secs: i64, scope: Option<&str>) -> ElevationGrant {
        ElevationGrant::new(
            "r".to_string(),
            "coder".to_string(),
            PermissionLevel::ELEVATED,
            "auto".to_string(),
            chrono::Duration::seconds(lifetime_secs),
            scope.map(String::from),
        )
    }

    #[test]
    fn test_level_ordering_and_delta() {
        assert!(PermissionLevel::ADMIN > PermissionLevel::STANDARD);
        assert_eq!(PermissionLevel::STANDARD.delta_to(PermissionLevel::ADMIN), 2);
        assert_eq!(PermissionLevel::ADMIN.delta_to(PermissionLevel::READ_ONLY), -3);
        assert_eq!(PermissionLevel::SYSTEM.to_string(), "system(4)");
        assert_eq!(PermissionLevel(9).to_string(), "level(9)");
    }

    #[test]
    fn test_scope_matching() {
        let scoped = grant(300, Some("write_file"));
        assert!(scoped.applies_to(Some("write_file")));
        assert!(!scoped.applies_to(Some("run_command")));
        assert!(scoped.applies_to(None));
        assert!(grant(300, None).applies_to(Some("anything")));
    }

    proptest! {
        #[test]
        fn test_grant_valid_iff_before_expiry(lifetime in 1i64..100_000, offset in -200_000i64..200_000) {
            let g = grant(lifetime, None);
            let at = g.granted_at + chrono::Duration::seconds(offset);
            prop_assert_eq!(g.is_valid_at(at), at < g.expires_at);
            prop_assert_eq!(g.expires_at - g.granted_at, chrono::Duration::seconds(lifetime));
        }
    }
}
