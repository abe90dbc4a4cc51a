//! Elevation manager implementation

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::ElevationConfig;
use super::types::{
    AgentContext, DenialReason, ElevationDecision, ElevationGrant, ElevationOutcome, ElevationRecord, ElevationRequest,
    ElevationStats, PermissionLevel,
};

/// Rolling window for auto-approval rate limiting
const RATE_WINDOW: Duration = Duration::from_secs(3600);

/// Actor recorded for decisions the manager makes itself
const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ElevationError {
    #[error("Elevation request not found: {0}")]
    RequestNotFound(String),

    #[error("Elevation grant not found: {0}")]
    GrantNotFound(String),
}

/// Sliding-window counter per agent type
struct RateLimiter {
    windows: HashMap<String, VecDeque<Instant>>,
    limit: usize,
    window: Duration,
}

impl RateLimiter {
    fn new(limit: usize, window: Duration) -> Self {
        Self {
            windows: HashMap::new(),
            limit,
            window,
        }
    }

    fn prune(&mut self, key: &str, now: Instant) -> usize {
        let Some(times) = self.windows.get_mut(key) else {
            return 0;
        };
        while let Some(&t) = times.front() {
            if now.duration_since(t) >= self.window {
                times.pop_front();
            } else {
                break;
            }
        }
        times.len()
    }

    fn allows(&mut self, key: &str) -> bool {
        self.prune(key, Instant::now()) < self.limit
    }

    fn record(&mut self, key: &str) {
        self.windows.entry(key.to_string()).or_default().push_back(Instant::now());
    }

    fn remaining(&mut self, key: &str) -> usize {
        self.limit.saturating_sub(self.prune(key, Instant::now()))
    }
}

struct State {
    pending: HashMap<String, ElevationRequest>,
    /// Grants per agent type
    grants: HashMap<String, Vec<ElevationGrant>>,
    history: Vec<ElevationRecord>,
    limiter: RateLimiter,
    stats: ElevationStats,
}

impl State {
    fn record(&mut self, record: ElevationRecord, max_history: usize) {
        match record.decision {
            ElevationDecision::AutoApproved => self.stats.auto_approved += 1,
            ElevationDecision::Approved => self.stats.approved += 1,
            ElevationDecision::Denied => self.stats.denied += 1,
            ElevationDecision::RateLimited => self.stats.rate_limited += 1,
            ElevationDecision::CeilingExceeded => self.stats.ceiling_exceeded += 1,
            ElevationDecision::Revoked => self.stats.revoked += 1,
        }
        self.history.push(record);
        if self.history.len() > max_history {
            let keep = max_history / 2;
            let evict = self.history.len() - keep;
            self.history.drain(..evict);
            debug!(evict, keep, "Elevation history trimmed");
        }
    }
}

struct Decision<'a> {
    request_id: &'a str,
    agent_type: &'a str,
    task_id: Option<&'a str>,
    tool_name: &'a str,
    from_level: PermissionLevel,
    to_level: PermissionLevel,
    decision: ElevationDecision,
    decided_by: &'a str,
    reason: &'a str,
}

impl Decision<'_> {
    fn into_record(self) -> ElevationRecord {
        ElevationRecord {
            id: Uuid::now_v7().to_string(),
            request_id: self.request_id.to_string(),
            agent_type: self.agent_type.to_string(),
            task_id: self.task_id.map(String::from),
            tool_name: self.tool_name.to_string(),
            from_level: self.from_level,
            to_level: self.to_level,
            decision: self.decision,
            decided_by: self.decided_by.to_string(),
            reason: self.reason.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Gatekeeper for temporary permission increases
///
/// Small increases are granted on the spot, subject to a per agent type
/// hourly budget. Larger ones wait for a supervisor. Nothing here is
/// persisted; grants vanish with the process.
pub struct ElevationManager {
    config: ElevationConfig,
    state: Mutex<State>,
}

impl ElevationManager {
    pub fn new(config: ElevationConfig) -> Self {
        debug!(?config, "ElevationManager::new: called");
        let limiter = RateLimiter::new(config.rate_limit_per_hour, RATE_WINDOW);
        Self {
            config,
            state: Mutex::new(State {
                pending: HashMap::new(),
                grants: HashMap::new(),
                history: Vec::new(),
                limiter,
                stats: ElevationStats::default(),
            }),
        }
    }

    pub fn config(&self) -> &ElevationConfig {
        &self.config
    }

    /// Ask for `target` level to use `tool_name`
    ///
    /// Requests above the agent type's ceiling are always denied. Increases
    /// within `max_auto_elevation` are granted immediately unless the hourly
    /// budget is spent. Anything larger becomes a pending request.
    pub async fn request_elevation(
        &self,
        ctx: &AgentContext,
        target: PermissionLevel,
        tool_name: &str,
        task_id: Option<&str>,
        reason: &str,
        justification: Option<&str>,
    ) -> ElevationOutcome {
        debug!(agent_type = %ctx.agent_type, %target, %tool_name, "ElevationManager::request_elevation: called");
        let mut state = self.state.lock().await;
        let request_id = Uuid::now_v7().to_string();
        let delta = ctx.base_level.delta_to(target);

        let denial = if target > self.config.ceiling_for(&ctx.agent_type) {
            Some(DenialReason::CeilingExceeded)
        } else if delta <= self.config.max_auto_elevation as i16 && !state.limiter.allows(&ctx.agent_type) {
            Some(DenialReason::RateLimited)
        } else {
            None
        };

        if let Some(reason_code) = denial {
            let decision = match reason_code {
                DenialReason::CeilingExceeded => ElevationDecision::CeilingExceeded,
                DenialReason::RateLimited => ElevationDecision::RateLimited,
            };
            let record = Decision {
                request_id: &request_id,
                agent_type: &ctx.agent_type,
                task_id,
                tool_name,
                from_level: ctx.base_level,
                to_level: target,
                decision,
                decided_by: SYSTEM_ACTOR,
                reason: &reason_code.to_string(),
            }
            .into_record();
            state.record(record.clone(), self.config.max_history);
            warn!(agent_type = %ctx.agent_type, %target, %tool_name, reason = %reason_code, "Elevation denied");
            return ElevationOutcome::Denied {
                reason: reason_code,
                record,
            };
        }

        if delta <= self.config.max_auto_elevation as i16 {
            let grant = ElevationGrant::new(
                request_id.clone(),
                ctx.agent_type.clone(),
                target,
                SYSTEM_ACTOR.to_string(),
                self.config.grant_lifetime(),
                Some(tool_name.to_string()),
            );
            state.limiter.record(&ctx.agent_type);
            state
                .grants
                .entry(ctx.agent_type.clone())
                .or_default()
                .push(grant.clone());
            let record = Decision {
                request_id: &request_id,
                agent_type: &ctx.agent_type,
                task_id,
                tool_name,
                from_level: ctx.base_level,
                to_level: target,
                decision: ElevationDecision::AutoApproved,
                decided_by: SYSTEM_ACTOR,
                reason,
            }
            .into_record();
            state.record(record, self.config.max_history);
            info!(agent_type = %ctx.agent_type, %target, %tool_name, grant_id = %grant.id, "Elevation auto-approved");
            return ElevationOutcome::AutoApproved(grant);
        }

        let request = ElevationRequest {
            id: request_id,
            agent_type: ctx.agent_type.clone(),
            task_id: task_id.map(String::from),
            tool_name: tool_name.to_string(),
            current_level: ctx.base_level,
            requested_level: target,
            reason: reason.to_string(),
            justification: justification.map(String::from),
            created_at: Utc::now(),
        };
        state.pending.insert(request.id.clone(), request.clone());
        info!(agent_type = %ctx.agent_type, %target, request_id = %request.id, "Elevation awaiting approval");
        ElevationOutcome::Pending(request)
    }

    /// Grant a pending request at the level it asked for
    ///
    /// `lifetime` overrides the configured grant lifetime.
    pub async fn approve_elevation(
        &self,
        request_id: &str,
        approver: &str,
        lifetime: Option<Duration>,
    ) -> Result<ElevationGrant, ElevationError> {
        debug!(%request_id, %approver, "ElevationManager::approve_elevation: called");
        let mut state = self.state.lock().await;
        let request = state
            .pending
            .remove(request_id)
            .ok_or_else(|| ElevationError::RequestNotFound(request_id.to_string()))?;

        let lifetime = lifetime
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .unwrap_or_else(|| self.config.grant_lifetime());
        let grant = ElevationGrant::new(
            request.id.clone(),
            request.agent_type.clone(),
            request.requested_level,
            approver.to_string(),
            lifetime,
            Some(request.tool_name.clone()),
        );
        state
            .grants
            .entry(request.agent_type.clone())
            .or_default()
            .push(grant.clone());
        let record = Decision {
            request_id: &request.id,
            agent_type: &request.agent_type,
            task_id: request.task_id.as_deref(),
            tool_name: &request.tool_name,
            from_level: request.current_level,
            to_level: request.requested_level,
            decision: ElevationDecision::Approved,
            decided_by: approver,
            reason: &request.reason,
        }
        .into_record();
        state.record(record, self.config.max_history);
        info!(%request_id, %approver, grant_id = %grant.id, "Elevation approved");
        Ok(grant)
    }

    pub async fn deny_elevation(
        &self,
        request_id: &str,
        denier: &str,
        reason: &str,
    ) -> Result<ElevationRecord, ElevationError> {
        debug!(%request_id, %denier, "ElevationManager::deny_elevation: called");
        let mut state = self.state.lock().await;
        let request = state
            .pending
            .remove(request_id)
            .ok_or_else(|| ElevationError::RequestNotFound(request_id.to_string()))?;
        let record = Decision {
            request_id: &request.id,
            agent_type: &request.agent_type,
            task_id: request.task_id.as_deref(),
            tool_name: &request.tool_name,
            from_level: request.current_level,
            to_level: request.requested_level,
            decision: ElevationDecision::Denied,
            decided_by: denier,
            reason,
        }
        .into_record();
        state.record(record.clone(), self.config.max_history);
        info!(%request_id, %denier, "Elevation denied by supervisor");
        Ok(record)
    }

    /// End a grant before it expires
    pub async fn revoke_elevation(&self, grant_id: &str, revoked_by: &str) -> Result<ElevationGrant, ElevationError> {
        debug!(%grant_id, %revoked_by, "ElevationManager::revoke_elevation: called");
        let mut state = self.state.lock().await;
        let grant = state
            .grants
            .values_mut()
            .find_map(|grants| {
                let idx = grants.iter().position(|g| g.id == grant_id)?;
                Some(grants.remove(idx))
            })
            .ok_or_else(|| ElevationError::GrantNotFound(grant_id.to_string()))?;
        let record = Decision {
            request_id: &grant.request_id,
            agent_type: &grant.agent_type,
            task_id: None,
            tool_name: grant.scope.as_deref().unwrap_or_default(),
            from_level: grant.granted_level,
            to_level: grant.granted_level,
            decision: ElevationDecision::Revoked,
            decided_by: revoked_by,
            reason: "revoked",
        }
        .into_record();
        state.record(record, self.config.max_history);
        info!(%grant_id, %revoked_by, "Elevation revoked");
        Ok(grant)
    }

    /// Drop expired grants; returns how many were removed
    pub async fn cleanup_expired(&self) -> usize {
        debug!("ElevationManager::cleanup_expired: called");
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut removed = 0;
        for grants in state.grants.values_mut() {
            let before = grants.len();
            grants.retain(|g| g.is_valid_at(now));
            removed += before - grants.len();
        }
        state.grants.retain(|_, grants| !grants.is_empty());
        if removed > 0 {
            info!(removed, "Expired elevation grants cleaned up");
        }
        removed
    }

    /// Highest level among valid grants covering `tool`, never below the base level
    pub async fn effective_level(&self, ctx: &AgentContext, tool: Option<&str>) -> PermissionLevel {
        let state = self.state.lock().await;
        let now = Utc::now();
        state
            .grants
            .get(&ctx.agent_type)
            .into_iter()
            .flatten()
            .filter(|g| g.is_valid_at(now) && g.applies_to(tool))
            .map(|g| g.granted_level)
            .fold(ctx.base_level, PermissionLevel::max)
    }

    pub async fn has_permission(&self, ctx: &AgentContext, tool: &str, required: PermissionLevel) -> bool {
        let level = self.effective_level(ctx, Some(tool)).await;
        debug!(agent_type = %ctx.agent_type, %tool, %required, %level, "ElevationManager::has_permission: called");
        level >= required
    }

    /// Requests waiting for a supervisor, oldest first
    pub async fn pending_requests(&self) -> Vec<ElevationRequest> {
        let state = self.state.lock().await;
        let mut pending: Vec<ElevationRequest> = state.pending.values().cloned().collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        pending
    }

    /// Valid grants held by an agent type
    pub async fn active_grants(&self, agent_type: &str) -> Vec<ElevationGrant> {
        let state = self.state.lock().await;
        let now = Utc::now();
        state
            .grants
            .get(agent_type)
            .map(|grants| grants.iter().filter(|g| g.is_valid_at(now)).cloned().collect())
            .unwrap_or_default()
    }

    /// The most recent `limit` audit entries, oldest first
    pub async fn history(&self, limit: usize) -> Vec<ElevationRecord> {
        let state = self.state.lock().await;
        let skip = state.history.len().saturating_sub(limit);
        state.history[skip..].to_vec()
    }

    /// Auto-approvals left for `agent_type` in the current window
    pub async fn remaining_auto_elevations(&self, agent_type: &str) -> usize {
        self.state.lock().await.limiter.remaining(agent_type)
    }

    pub async fn stats(&self) -> ElevationStats {
        let state = self.state.lock().await;
        let now = Utc::now();
        ElevationStats {
            pending: state.pending.len(),
            active_grants: state.grants.values().flatten().filter(|g| g.is_valid_at(now)).count(),
            history: state.history.len(),
            ..state.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coder() -> AgentContext {
        AgentContext::new("agent-1", "coder", PermissionLevel::STANDARD)
    }

    fn manager() -> ElevationManager {
        ElevationManager::new(ElevationConfig::default())
    }

    #[tokio::test]
    async fn test_small_delta_auto_approves() {
        let elevation = manager();
        let ctx = coder();
        let outcome = elevation
            .request_elevation(&ctx, PermissionLevel::ELEVATED, "write_file", Some("t1"), "edit", None)
            .await;

        let grant = match outcome {
            ElevationOutcome::AutoApproved(grant) => grant,
            _ => panic!("Wrong variant"),
        };
        assert_eq!(grant.expires_at - grant.granted_at, chrono::Duration::seconds(300));
        assert_eq!(grant.scope.as_deref(), Some("write_file"));
        assert!(grant.is_valid());

        assert_eq!(
            elevation.effective_level(&ctx, Some("write_file")).await,
            PermissionLevel::ELEVATED
        );
        assert_eq!(
            elevation.effective_level(&ctx, Some("run_command")).await,
            PermissionLevel::STANDARD
        );
        assert!(elevation.has_permission(&ctx, "write_file", PermissionLevel::ELEVATED).await);
        assert_eq!(elevation.remaining_auto_elevations("coder").await, 9);
    }

    #[tokio::test]
    async fn test_large_delta_goes_pending_then_approved() {
        let elevation = manager();
        let ctx = coder();
        let outcome = elevation
            .request_elevation(&ctx, PermissionLevel::ADMIN, "deploy", None, "release", Some("hotfix"))
            .await;
        let request = match outcome {
            ElevationOutcome::Pending(request) => request,
            _ => panic!("Wrong variant"),
        };
        assert_eq!(elevation.pending_requests().await.len(), 1);
        assert!(!elevation.has_permission(&ctx, "deploy", PermissionLevel::ADMIN).await);

        let grant = elevation
            .approve_elevation(&request.id, "supervisor", None)
            .await
            .unwrap();
        assert_eq!(grant.granted_level, PermissionLevel::ADMIN);
        assert_eq!(grant.granted_by, "supervisor");
        assert!(elevation.pending_requests().await.is_empty());
        assert!(elevation.has_permission(&ctx, "deploy", PermissionLevel::ADMIN).await);

        // Consumed
        assert_eq!(
            elevation.approve_elevation(&request.id, "supervisor", None).await,
            Err(ElevationError::RequestNotFound(request.id.clone()))
        );
    }

    #[tokio::test]
    async fn test_deny_consumes_request() {
        let elevation = manager();
        let outcome = elevation
            .request_elevation(&coder(), PermissionLevel::ADMIN, "deploy", None, "release", None)
            .await;
        let ElevationOutcome::Pending(request) = outcome else {
            panic!("Wrong variant");
        };

        let record = elevation.deny_elevation(&request.id, "supervisor", "not today").await.unwrap();
        assert_eq!(record.decision, ElevationDecision::Denied);
        assert_eq!(record.reason, "not today");
        assert!(elevation.pending_requests().await.is_empty());
        assert!(elevation.deny_elevation(&request.id, "supervisor", "again").await.is_err());
    }

    #[tokio::test]
    async fn test_ceiling_denies_regardless_of_budget() {
        let config = ElevationConfig {
            ceiling: PermissionLevel::ELEVATED,
            ..Default::default()
        };
        let elevation = ElevationManager::new(config);
        let ctx = AgentContext::new("a", "coder", PermissionLevel::ELEVATED);

        match elevation
            .request_elevation(&ctx, PermissionLevel::ADMIN, "tool", None, "why", None)
            .await
        {
            ElevationOutcome::Denied { reason, record } => {
                assert_eq!(reason, DenialReason::CeilingExceeded);
                assert_eq!(record.decision, ElevationDecision::CeilingExceeded);
            }
            _ => panic!("Wrong variant"),
        }
        // Supervisor path is capped too
        let outcome = elevation
            .request_elevation(&ctx, PermissionLevel::SYSTEM, "tool", None, "why", None)
            .await;
        assert!(matches!(
            outcome,
            ElevationOutcome::Denied {
                reason: DenialReason::CeilingExceeded,
                ..
            }
        ));
        assert_eq!(elevation.remaining_auto_elevations("coder").await, 10);
    }

    #[tokio::test]
    async fn test_rate_limit_after_budget() {
        let elevation = manager();
        let ctx = coder();
        for _ in 0..10 {
            let outcome = elevation
                .request_elevation(&ctx, PermissionLevel::ELEVATED, "write_file", None, "edit", None)
                .await;
            assert!(outcome.is_auto_approved());
        }
        match elevation
            .request_elevation(&ctx, PermissionLevel::ELEVATED, "write_file", None, "edit", None)
            .await
        {
            ElevationOutcome::Denied { reason, .. } => assert_eq!(reason, DenialReason::RateLimited),
            _ => panic!("Wrong variant"),
        }

        // Other agent types have their own budget
        let other = AgentContext::new("b", "reviewer", PermissionLevel::STANDARD);
        assert!(
            elevation
                .request_elevation(&other, PermissionLevel::ELEVATED, "write_file", None, "edit", None)
                .await
                .is_auto_approved()
        );

        let stats = elevation.stats().await;
        assert_eq!(stats.auto_approved, 11);
        assert_eq!(stats.rate_limited, 1);
    }

    #[tokio::test]
    async fn test_revoke_and_cleanup() {
        let elevation = manager();
        let ctx = coder();
        let grant = elevation
            .request_elevation(&ctx, PermissionLevel::ELEVATED, "write_file", None, "edit", None)
            .await
            .grant()
            .cloned()
            .unwrap();

        let revoked = elevation.revoke_elevation(&grant.id, "supervisor").await.unwrap();
        assert_eq!(revoked.id, grant.id);
        assert_eq!(elevation.effective_level(&ctx, None).await, PermissionLevel::STANDARD);
        assert_eq!(
            elevation.revoke_elevation(&grant.id, "supervisor").await,
            Err(ElevationError::GrantNotFound(grant.id.clone()))
        );

        let pending = elevation
            .request_elevation(&ctx, PermissionLevel::ADMIN, "deploy", None, "why", None)
            .await;
        let ElevationOutcome::Pending(request) = pending else {
            panic!("Wrong variant");
        };
        elevation
            .approve_elevation(&request.id, "supervisor", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(elevation.active_grants("coder").await.is_empty());
        assert_eq!(elevation.effective_level(&ctx, Some("deploy")).await, PermissionLevel::STANDARD);
        assert_eq!(elevation.cleanup_expired().await, 1);
    }

    #[tokio::test]
    async fn test_history_evicts_oldest_half() {
        let config = ElevationConfig {
            max_history: 10,
            rate_limit_per_hour: 100,
            ..Default::default()
        };
        let elevation = ElevationManager::new(config);
        let ctx = coder();
        for i in 0..11 {
            elevation
                .request_elevation(&ctx, PermissionLevel::ELEVATED, &format!("tool{}", i), None, "edit", None)
                .await;
        }
        let history = elevation.history(100).await;
        assert_eq!(history.len(), 5);
        assert_eq!(history.last().unwrap().tool_name, "tool10");
        assert_eq!(history.first().unwrap().tool_name, "tool6");
        assert_eq!(elevation.history(2).await.len(), 2);
    }

    #[test]
    fn test_rate_limiter_window_slides() {
        let mut limiter = RateLimiter::new(2, Duration::from_millis(30));
        assert!(limiter.allows("k"));
        limiter.record("k");
        limiter.record("k");
        assert!(!limiter.allows("k"));
        assert_eq!(limiter.remaining("k"), 0);
        std::thread::sleep(Duration::from_millis(40));
        assert!(limiter.allows("k"));
        assert_eq!(limiter.remaining("k"), 2);
    }
}
