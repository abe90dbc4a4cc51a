//! Agent status records
//!
//! Each agent owns the hash `agent:{id}` with `status`, `current_task` and
//! `last_heartbeat`. Writes happen under the per-agent status lock and every
//! status change is announced on `agent:status`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sharedstore::{SharedStore, StoreError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::lock::{LockError, LockManager};
use crate::messages::{AgentState, AgentStatus, Heartbeat, Message, MessageKind};
use crate::pubsub::{PubSubManager, channels};

const FIELD_STATUS: &str = "status";
const FIELD_CURRENT_TASK: &str = "current_task";
const FIELD_LAST_HEARTBEAT: &str = "last_heartbeat";

pub fn agent_key(agent_id: &str) -> String {
    format!("agent:{}", agent_id)
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Corrupt agent record {agent_id}: {reason}")]
    Corrupt { agent_id: String, reason: String },
}

/// Last known state of one agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub status: AgentState,
    pub current_task: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

pub struct AgentTracker {
    store: Arc<dyn SharedStore>,
    locks: LockManager,
    pubsub: Arc<PubSubManager>,
}

impl AgentTracker {
    pub fn new(store: Arc<dyn SharedStore>, locks: LockManager, pubsub: Arc<PubSubManager>) -> Self {
        debug!("AgentTracker::new: called");
        Self { store, locks, pubsub }
    }

    /// Record a status change and announce it; returns the subscriber count reached
    pub async fn update_status(
        &self,
        agent_id: &str,
        status: AgentState,
        current_task: Option<&str>,
        capabilities: Vec<String>,
    ) -> Result<usize, AgentError> {
        debug!(%agent_id, %status, ?current_task, "AgentTracker::update_status: called");
        let key = agent_key(agent_id);
        let guard = self.locks.agent_status_lock(agent_id).await?;
        let written = self.write_status(&key, status, current_task).await;
        guard.release().await?;
        written?;

        let delivered = self
            .pubsub
            .publish_agent_status(AgentStatus {
                agent_id: agent_id.to_string(),
                status,
                current_task: current_task.map(String::from),
                capabilities,
            })
            .await?;
        info!(%agent_id, %status, delivered, "Agent status updated");
        Ok(delivered)
    }

    async fn write_status(&self, key: &str, status: AgentState, current_task: Option<&str>) -> Result<(), StoreError> {
        self.store.hset(key, FIELD_STATUS, &status.to_string()).await?;
        match current_task {
            Some(task) => self.store.hset(key, FIELD_CURRENT_TASK, task).await?,
            None => {
                self.store.hdel(key, FIELD_CURRENT_TASK).await?;
            }
        }
        self.store
            .hset(key, FIELD_LAST_HEARTBEAT, &Utc::now().to_rfc3339())
            .await
    }

    /// Refresh `last_heartbeat` and emit a heartbeat on the agent's event channel
    pub async fn heartbeat(&self, agent_id: &str) -> Result<(), AgentError> {
        debug!(%agent_id, "AgentTracker::heartbeat: called");
        let key = agent_key(agent_id);
        let guard = self.locks.agent_status_lock(agent_id).await?;
        let stamped = self
            .store
            .hset(&key, FIELD_LAST_HEARTBEAT, &Utc::now().to_rfc3339())
            .await;
        guard.release().await?;
        stamped?;

        let status = match self.store.hget(&key, FIELD_STATUS).await? {
            Some(raw) => raw.parse::<AgentState>().unwrap_or_else(|e| {
                warn!(%agent_id, error = %e, "Unreadable agent status, reporting idle");
                AgentState::Idle
            }),
            None => AgentState::Idle,
        };
        let message = Message::new(
            agent_id,
            MessageKind::Heartbeat(Heartbeat {
                agent_id: agent_id.to_string(),
                status,
            }),
        );
        self.pubsub
            .publish(&channels::agent_events(agent_id), &message)
            .await?;
        Ok(())
    }

    /// Current record, `None` for an agent that never reported
    pub async fn get_status(&self, agent_id: &str) -> Result<Option<AgentRecord>, AgentError> {
        debug!(%agent_id, "AgentTracker::get_status: called");
        let fields = self.store.hgetall(&agent_key(agent_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let corrupt = |reason: String| AgentError::Corrupt {
            agent_id: agent_id.to_string(),
            reason,
        };
        let status = fields
            .get(FIELD_STATUS)
            .ok_or_else(|| corrupt("missing status".to_string()))?
            .parse::<AgentState>()
            .map_err(corrupt)?;
        let last_heartbeat = match fields.get(FIELD_LAST_HEARTBEAT) {
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(raw)
                    .map_err(|e| corrupt(e.to_string()))?
                    .with_timezone(&Utc),
            ),
            None => None,
        };
        Ok(Some(AgentRecord {
            agent_id: agent_id.to_string(),
            status,
            current_task: fields.get(FIELD_CURRENT_TASK).cloned(),
            last_heartbeat,
        }))
    }
}
