//! ControlPlane - one service's view of the fleet
//!
//! Built once per process from [`Config`] and handed to whatever needs it.
//! There are no process-wide singletons; tests construct as many isolated
//! planes as they like over a shared [`MemoryStore`](sharedstore::MemoryStore).

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sharedstore::{SharedStore, StoreError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::agents::AgentTracker;
use crate::bus::{BusError, MessageBus};
use crate::config::Config;
use crate::elevation::{AgentContext, DenialReason, ElevationManager, ElevationOutcome, PermissionLevel};
use crate::lock::{LockError, LockManager};
use crate::pubsub::PubSubManager;
use crate::rollback::{ChangeType, FileSystem, JournalError, LocalFileSystem, RollbackJournal};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Failed to apply change to {path}: {source}")]
    Apply {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Where a file change is journaled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum ChangeScope {
    Step { plan_id: String, step_id: String },
    Task { task_id: String },
}

impl ChangeScope {
    fn task_id(&self) -> Option<&str> {
        match self {
            Self::Step { .. } => None,
            Self::Task { task_id } => Some(task_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileChange {
    /// Create or overwrite with this content
    Write(String),
    Delete,
}

/// One privileged file mutation on behalf of an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChangeRequest {
    pub scope: ChangeScope,
    pub path: String,
    pub change: FileChange,
    /// Tool performing the change; elevation grants are scoped to it
    pub tool_name: String,
    pub required_level: PermissionLevel,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChangeOutcome {
    Applied {
        change_type: ChangeType,
        /// False when the path was already journaled earlier in the same scope
        snapshotted: bool,
    },
    /// A supervisor must approve before the change can be retried
    AwaitingApproval { request_id: String },
    Denied { reason: DenialReason },
}

pub struct ControlPlane {
    service: String,
    config: Config,
    store: Arc<dyn SharedStore>,
    fs: Arc<dyn FileSystem>,
    locks: LockManager,
    pubsub: Arc<PubSubManager>,
    bus: MessageBus,
    elevation: ElevationManager,
    journal: RollbackJournal,
    agents: AgentTracker,
}

impl ControlPlane {
    /// Open the configured store and build every component over it
    pub async fn new(config: Config, service: impl Into<String>) -> eyre::Result<Self> {
        let store = config.store.open()?;
        Ok(Self::with_store(config, service, store, Arc::new(LocalFileSystem)).await?)
    }

    /// Build over an existing store and filesystem
    pub async fn with_store(
        config: Config,
        service: impl Into<String>,
        store: Arc<dyn SharedStore>,
        fs: Arc<dyn FileSystem>,
    ) -> Result<Self, StoreError> {
        let service = service.into();
        debug!(%service, "ControlPlane::with_store: called");
        let locks = LockManager::new(store.clone(), config.lock.clone());
        let pubsub = Arc::new(PubSubManager::new(store.clone(), service.clone(), config.pubsub.clone()).await?);
        let bus = MessageBus::new(store.clone(), service.clone(), config.bus.clone());
        let elevation = ElevationManager::new(config.elevation.clone());
        let journal = RollbackJournal::new(store.clone(), fs.clone(), config.rollback.clone());
        let agents = AgentTracker::new(store.clone(), locks.clone(), pubsub.clone());
        Ok(Self {
            service,
            config,
            store,
            fs,
            locks,
            pubsub,
            bus,
            elevation,
            journal,
            agents,
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn pubsub(&self) -> &Arc<PubSubManager> {
        &self.pubsub
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn elevation(&self) -> &ElevationManager {
        &self.elevation
    }

    pub fn journal(&self) -> &RollbackJournal {
        &self.journal
    }

    pub fn agents(&self) -> &AgentTracker {
        &self.agents
    }

    /// Start the bus readers and the pub/sub poll loop
    pub async fn start(&self) -> Result<(), BusError> {
        debug!(service = %self.service, "ControlPlane::start: called");
        self.bus.start().await?;
        self.pubsub.start().await;
        info!(service = %self.service, "Control plane started");
        Ok(())
    }

    pub async fn stop(&self) {
        debug!(service = %self.service, "ControlPlane::stop: called");
        self.bus.stop().await;
        self.pubsub.stop().await;
        info!(service = %self.service, "Control plane stopped");
    }

    /// Perform a journaled file mutation for an agent
    ///
    /// Checks permission (asking for elevation when short), then under the
    /// lock `file:{path}`: snapshot, mutate, capture the after-image. The
    /// lock is released whether or not the mutation succeeds.
    pub async fn apply_file_change(
        &self,
        ctx: &AgentContext,
        request: FileChangeRequest,
    ) -> Result<FileChangeOutcome, ControlError> {
        debug!(agent_id = %ctx.agent_id, path = %request.path, tool = %request.tool_name, "ControlPlane::apply_file_change: called");

        if !self
            .elevation
            .has_permission(ctx, &request.tool_name, request.required_level)
            .await
        {
            let outcome = self
                .elevation
                .request_elevation(
                    ctx,
                    request.required_level,
                    &request.tool_name,
                    request.scope.task_id(),
                    &request.reason,
                    None,
                )
                .await;
            match outcome {
                ElevationOutcome::AutoApproved(_) => {}
                ElevationOutcome::Pending(pending) => {
                    return Ok(FileChangeOutcome::AwaitingApproval { request_id: pending.id });
                }
                ElevationOutcome::Denied { reason, .. } => {
                    return Ok(FileChangeOutcome::Denied { reason });
                }
            }
        }

        let guard = self
            .locks
            .acquire(&format!("file:{}", request.path), self.locks.default_options())
            .await?;
        let applied = self.journaled_change(ctx, &request).await;
        if let Err(e) = guard.release().await {
            warn!(path = %request.path, error = %e, "Failed to release file lock");
        }
        applied
    }

    async fn journaled_change(&self, ctx: &AgentContext, request: &FileChangeRequest) -> Result<FileChangeOutcome, ControlError> {
        let path = request.path.as_str();
        let change_type = match &request.change {
            FileChange::Delete => ChangeType::Delete,
            FileChange::Write(_) => {
                let exists = self
                    .fs
                    .exists(Path::new(path))
                    .await
                    .map_err(|source| ControlError::Apply {
                        path: path.to_string(),
                        source,
                    })?;
                if exists { ChangeType::Modify } else { ChangeType::Create }
            }
        };

        let snapshotted = match &request.scope {
            ChangeScope::Step { plan_id, step_id } => {
                self.journal.start_plan(plan_id, None).await?;
                self.journal.snapshot_file(plan_id, step_id, path, change_type).await?
            }
            ChangeScope::Task { task_id } => {
                self.journal
                    .start_task(task_id, Some(request.reason.as_str()), None, Some(ctx.agent_id.as_str()))
                    .await?;
                self.journal.snapshot_task_file(task_id, path, change_type).await?
            }
        };

        let mutated = match &request.change {
            FileChange::Write(content) => self.fs.write(Path::new(path), content).await,
            FileChange::Delete => self.fs.remove(Path::new(path)).await,
        };
        mutated.map_err(|source| ControlError::Apply {
            path: path.to_string(),
            source,
        })?;

        match &request.scope {
            ChangeScope::Step { plan_id, step_id } => {
                self.journal.capture_after_content(plan_id, step_id, path).await?;
            }
            ChangeScope::Task { task_id } => {
                self.journal.capture_task_after_content(task_id, path).await?;
            }
        }
        info!(agent_id = %ctx.agent_id, %path, %change_type, "File change applied");
        Ok(FileChangeOutcome::Applied {
            change_type,
            snapshotted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreBackend;
    use sharedstore::MemoryStore;
    use tempfile::TempDir;

    async fn plane() -> ControlPlane {
        let mut config = Config::default();
        config.store.backend = StoreBackend::Memory;
        ControlPlane::with_store(config, "svc", Arc::new(MemoryStore::new()), Arc::new(LocalFileSystem))
            .await
            .unwrap()
    }

    fn write_request(path: &str, content: &str, level: PermissionLevel) -> FileChangeRequest {
        FileChangeRequest {
            scope: ChangeScope::Step {
                plan_id: "plan-1".to_string(),
                step_id: "step-1".to_string(),
            },
            path: path.to_string(),
            change: FileChange::Write(content.to_string()),
            tool_name: "write_file".to_string(),
            required_level: level,
            reason: "apply edit".to_string(),
        }
    }

    #[tokio::test]
    async fn test_apply_within_base_level() {
        let plane = plane().await;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt").to_string_lossy().into_owned();
        let ctx = AgentContext::new("agent-1", "coder", PermissionLevel::STANDARD);

        let outcome = plane
            .apply_file_change(&ctx, write_request(&path, "hello", PermissionLevel::STANDARD))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FileChangeOutcome::Applied {
                change_type: ChangeType::Create,
                snapshotted: true
            }
        );
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
        assert!(!plane.locks().is_locked(&format!("file:{}", path)).await.unwrap());

        let result = plane.journal().rollback_plan("plan-1", false).await;
        assert!(result.success);
        assert!(!Path::new(&path).exists());
    }

    #[tokio::test]
    async fn test_small_gap_auto_elevates() {
        let plane = plane().await;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("b.txt").to_string_lossy().into_owned();
        std::fs::write(&path, "old").unwrap();
        let ctx = AgentContext::new("agent-1", "coder", PermissionLevel::STANDARD);

        let outcome = plane
            .apply_file_change(&ctx, write_request(&path, "new", PermissionLevel::ELEVATED))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            FileChangeOutcome::Applied {
                change_type: ChangeType::Modify,
                ..
            }
        ));
        assert_eq!(plane.elevation().active_grants("coder").await.len(), 1);
    }

    #[tokio::test]
    async fn test_large_gap_waits_for_approval() {
        let plane = plane().await;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c.txt").to_string_lossy().into_owned();
        let ctx = AgentContext::new("agent-1", "coder", PermissionLevel::READ_ONLY);

        let outcome = plane
            .apply_file_change(&ctx, write_request(&path, "x", PermissionLevel::ADMIN))
            .await
            .unwrap();
        let request_id = match outcome {
            FileChangeOutcome::AwaitingApproval { request_id } => request_id,
            _ => panic!("Wrong variant"),
        };
        assert!(!Path::new(&path).exists());

        plane
            .elevation()
            .approve_elevation(&request_id, "supervisor", None)
            .await
            .unwrap();
        let outcome = plane
            .apply_file_change(&ctx, write_request(&path, "x", PermissionLevel::ADMIN))
            .await
            .unwrap();
        assert!(matches!(outcome, FileChangeOutcome::Applied { .. }));
    }

    #[tokio::test]
    async fn test_above_ceiling_is_denied() {
        let plane = plane().await;
        let ctx = AgentContext::new("agent-1", "coder", PermissionLevel::ADMIN);
        let outcome = plane
            .apply_file_change(&ctx, write_request("/nonexistent/x", "x", PermissionLevel::SYSTEM))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FileChangeOutcome::Denied {
                reason: DenialReason::CeilingExceeded
            }
        );
    }

    #[tokio::test]
    async fn test_task_scope_delete() {
        let plane = plane().await;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("d.txt").to_string_lossy().into_owned();
        std::fs::write(&path, "keep").unwrap();
        let ctx = AgentContext::new("agent-1", "coder", PermissionLevel::STANDARD);

        let request = FileChangeRequest {
            scope: ChangeScope::Task {
                task_id: "t-1".to_string(),
            },
            path: path.clone(),
            change: FileChange::Delete,
            tool_name: "delete_file".to_string(),
            required_level: PermissionLevel::STANDARD,
            reason: "cleanup".to_string(),
        };
        plane.apply_file_change(&ctx, request).await.unwrap();
        assert!(!Path::new(&path).exists());

        assert!(plane.journal().rollback_task("t-1", false).await.success);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "keep");
    }
}
