//! Rollback journal implementation

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use sharedstore::SharedStore;
use tracing::{debug, info, warn};

use super::config::RollbackConfig;
use super::error::JournalError;
use super::fs::FileSystem;
use super::types::{
    ChangeType, FileAction, FileSnapshot, PlanRollbackData, RollbackInfo, RollbackResult, StepRollbackData,
    TaskRollbackData,
};

pub fn plan_key(plan_id: &str) -> String {
    format!("rollback:{}", plan_id)
}

pub fn task_key(task_id: &str) -> String {
    format!("task_rollback:{}", task_id)
}

fn io_error(path: &str) -> impl FnOnce(std::io::Error) -> JournalError + '_ {
    move |source| JournalError::Io {
        path: path.to_string(),
        source,
    }
}

/// Records which file snapshot to take for a mutation
///
/// The recorded change type follows what is on disk: creating a file that
/// already exists is journaled as a modify, and modifying a missing file as
/// a create.
async fn take_snapshot(fs: &dyn FileSystem, path: &str, change_type: ChangeType) -> Result<FileSnapshot, JournalError> {
    let current = fs.read(Path::new(path)).await.map_err(io_error(path))?;
    let snapshot = match (change_type, current) {
        (ChangeType::Delete, None) => return Err(JournalError::MissingFile(path.to_string())),
        (ChangeType::Delete, Some(content)) => FileSnapshot::new(path, ChangeType::Delete, Some(content)),
        (ChangeType::Create | ChangeType::Modify, Some(content)) => {
            FileSnapshot::new(path, ChangeType::Modify, Some(content))
        }
        (ChangeType::Create | ChangeType::Modify, None) => FileSnapshot::new(path, ChangeType::Create, None),
    };
    if snapshot.change_type != change_type {
        debug!(%path, requested = %change_type, recorded = %snapshot.change_type, "Snapshot change type adjusted");
    }
    Ok(snapshot)
}

/// Step-scoped and task-scoped undo/redo of file mutations
///
/// Callers snapshot a path before mutating it and capture the result after.
/// Records live in the shared store as JSON under `rollback:{plan_id}` and
/// `task_rollback:{task_id}` with a TTL. Writes are plain read-modify-write;
/// callers sharing a record across agents must hold a lock around them.
pub struct RollbackJournal {
    store: Arc<dyn SharedStore>,
    fs: Arc<dyn FileSystem>,
    config: RollbackConfig,
}

impl RollbackJournal {
    pub fn new(store: Arc<dyn SharedStore>, fs: Arc<dyn FileSystem>, config: RollbackConfig) -> Self {
        debug!(?config, "RollbackJournal::new: called");
        Self { store, fs, config }
    }

    // === Persistence ===

    async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, JournalError> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw).map(Some).map_err(|e| JournalError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    async fn save<T: Serialize>(&self, key: &str, record: &T) -> Result<(), JournalError> {
        let raw = serde_json::to_string(record)?;
        self.store.set(key, &raw, Some(self.config.record_ttl())).await?;
        Ok(())
    }

    async fn load_plan(&self, plan_id: &str) -> Result<Option<PlanRollbackData>, JournalError> {
        let key = plan_key(plan_id);
        let plan: Option<PlanRollbackData> = self.load(&key).await?;
        if let Some(plan) = &plan {
            plan.validate().map_err(|reason| JournalError::Corrupt { key, reason })?;
        }
        Ok(plan)
    }

    async fn require_plan(&self, plan_id: &str) -> Result<PlanRollbackData, JournalError> {
        self.load_plan(plan_id)
            .await?
            .ok_or_else(|| JournalError::PlanNotFound(plan_id.to_string()))
    }

    async fn save_plan(&self, plan: &PlanRollbackData) -> Result<(), JournalError> {
        self.save(&plan_key(&plan.plan_id), plan).await
    }

    async fn load_task(&self, task_id: &str) -> Result<Option<TaskRollbackData>, JournalError> {
        let key = task_key(task_id);
        let task: Option<TaskRollbackData> = self.load(&key).await?;
        if let Some(task) = &task {
            task.validate().map_err(|reason| JournalError::Corrupt { key, reason })?;
        }
        Ok(task)
    }

    async fn require_task(&self, task_id: &str) -> Result<TaskRollbackData, JournalError> {
        self.load_task(task_id)
            .await?
            .ok_or_else(|| JournalError::TaskNotFound(task_id.to_string()))
    }

    async fn save_task(&self, task: &TaskRollbackData) -> Result<(), JournalError> {
        self.save(&task_key(&task.task_id), task).await
    }

    // === File operations ===

    /// Revert snapshots newest first, skipping ones already reverted
    async fn undo(&self, snapshots: &mut [FileSnapshot], step_id: Option<&str>, dry_run: bool, result: &mut RollbackResult) {
        for snap in snapshots.iter_mut().rev() {
            if snap.rolled_back {
                continue;
            }
            let path = Path::new(&snap.path);
            let (action, outcome) = match (snap.change_type, snap.original_content.as_deref()) {
                (ChangeType::Create, _) => (FileAction::Delete, self.apply_remove(path, dry_run).await),
                (ChangeType::Modify, Some(original)) => {
                    (FileAction::Restore, self.apply_write(path, original, dry_run).await)
                }
                (ChangeType::Delete, Some(original)) => {
                    (FileAction::Recreate, self.apply_write(path, original, dry_run).await)
                }
                (_, None) => {
                    result.push_error(&snap.path, "no original content recorded");
                    continue;
                }
            };
            match outcome {
                Ok(()) => {
                    if !dry_run {
                        snap.rolled_back = true;
                    }
                    result.push_action(&snap.path, action, step_id);
                }
                Err(e) => {
                    warn!(path = %snap.path, error = %e, "Rollback of file failed");
                    result.push_error(&snap.path, e.to_string());
                }
            }
        }
    }

    /// Reapply reverted snapshots oldest first
    ///
    /// A reverted file with no captured after-image is reported as an error
    /// and skipped; the rest of the step still proceeds.
    async fn reapply(&self, snapshots: &mut [FileSnapshot], step_id: Option<&str>, dry_run: bool, result: &mut RollbackResult) {
        for snap in snapshots.iter_mut() {
            if !snap.rolled_back {
                continue;
            }
            let path = Path::new(&snap.path);
            let (action, outcome) = match (snap.change_type, snap.new_content.as_deref()) {
                (ChangeType::Delete, _) => (FileAction::Delete, self.apply_remove(path, dry_run).await),
                (ChangeType::Create, Some(content)) => {
                    (FileAction::Recreate, self.apply_write(path, content, dry_run).await)
                }
                (ChangeType::Modify, Some(content)) => {
                    (FileAction::Restore, self.apply_write(path, content, dry_run).await)
                }
                (_, None) => {
                    result.push_error(&snap.path, "no content was captured after the change");
                    continue;
                }
            };
            match outcome {
                Ok(()) => {
                    if !dry_run {
                        snap.rolled_back = false;
                    }
                    result.push_action(&snap.path, action, step_id);
                }
                Err(e) => {
                    warn!(path = %snap.path, error = %e, "Redo of file failed");
                    result.push_error(&snap.path, e.to_string());
                }
            }
        }
    }

    async fn apply_write(&self, path: &Path, content: &str, dry_run: bool) -> std::io::Result<()> {
        if dry_run {
            return Ok(());
        }
        self.fs.write(path, content).await
    }

    async fn apply_remove(&self, path: &Path, dry_run: bool) -> std::io::Result<()> {
        if dry_run {
            return Ok(());
        }
        self.fs.remove(path).await
    }

    /// A rolled-back snapshot keeps its post-image; the file now holds the pre-image
    fn capture_into(
        snapshots: &mut [FileSnapshot],
        scope: String,
        path: &str,
        content: Option<String>,
    ) -> Result<(), JournalError> {
        let Some(snap) = snapshots.iter_mut().find(|s| s.path == path) else {
            return Err(JournalError::SnapshotNotFound {
                scope,
                path: path.to_string(),
            });
        };
        if snap.rolled_back {
            return Err(JournalError::AlreadyRolledBack {
                scope,
                path: path.to_string(),
            });
        }
        snap.set_new_content(content);
        Ok(())
    }

    // === Plan scope ===

    /// Create the plan record, or return the existing one
    pub async fn start_plan(&self, plan_id: &str, conversation_id: Option<&str>) -> Result<PlanRollbackData, JournalError> {
        debug!(%plan_id, "RollbackJournal::start_plan: called");
        if let Some(existing) = self.load_plan(plan_id).await? {
            return Ok(existing);
        }
        let plan = PlanRollbackData::new(plan_id, conversation_id.map(String::from));
        self.save_plan(&plan).await?;
        info!(%plan_id, "Rollback plan started");
        Ok(plan)
    }

    /// Open a step; a step that already exists is left as is
    pub async fn start_step(&self, plan_id: &str, step_id: &str, step_title: &str) -> Result<(), JournalError> {
        debug!(%plan_id, %step_id, "RollbackJournal::start_step: called");
        let mut plan = self.require_plan(plan_id).await?;
        if plan.steps.contains_key(step_id) {
            return Ok(());
        }
        plan.steps
            .insert(step_id.to_string(), StepRollbackData::new(step_id, step_title));
        self.save_plan(&plan).await
    }

    /// Mark a step finished; its position in completion order moves to the end
    pub async fn complete_step(&self, plan_id: &str, step_id: &str) -> Result<(), JournalError> {
        debug!(%plan_id, %step_id, "RollbackJournal::complete_step: called");
        let mut plan = self.require_plan(plan_id).await?;
        let Some(step) = plan.steps.get_mut(step_id) else {
            return Err(JournalError::SnapshotNotFound {
                scope: format!("plan {}", plan_id),
                path: format!("step {}", step_id),
            });
        };
        step.completed_at = Some(chrono::Utc::now());
        plan.completion_order.retain(|id| id != step_id);
        plan.completion_order.push(step_id.to_string());
        self.save_plan(&plan).await
    }

    /// Record the pre-image of `path` before the step mutates it
    ///
    /// Must run before the write. The first snapshot of a path in a step wins;
    /// later calls return `Ok(false)`. An unknown step is started with its id
    /// as title.
    pub async fn snapshot_file(
        &self,
        plan_id: &str,
        step_id: &str,
        path: &str,
        change_type: ChangeType,
    ) -> Result<bool, JournalError> {
        debug!(%plan_id, %step_id, %path, %change_type, "RollbackJournal::snapshot_file: called");
        let mut plan = self.require_plan(plan_id).await?;
        let step = plan
            .steps
            .entry(step_id.to_string())
            .or_insert_with(|| StepRollbackData::new(step_id, step_id));
        if step.snapshots.iter().any(|s| s.path == path) {
            debug!(%path, "RollbackJournal::snapshot_file: already snapshotted");
            return Ok(false);
        }
        let snapshot = take_snapshot(self.fs.as_ref(), path, change_type).await?;
        step.snapshots.push(snapshot);
        self.save_plan(&plan).await?;
        Ok(true)
    }

    /// Record the post-image of `path` after the mutation, enabling redo
    pub async fn capture_after_content(&self, plan_id: &str, step_id: &str, path: &str) -> Result<(), JournalError> {
        debug!(%plan_id, %step_id, %path, "RollbackJournal::capture_after_content: called");
        let mut plan = self.require_plan(plan_id).await?;
        let content = self.fs.read(Path::new(path)).await.map_err(io_error(path))?;
        let scope = format!("plan {} step {}", plan_id, step_id);
        match plan.steps.get_mut(step_id) {
            Some(step) => Self::capture_into(&mut step.snapshots, scope, path, content)?,
            None => {
                return Err(JournalError::SnapshotNotFound {
                    scope,
                    path: path.to_string(),
                });
            }
        }
        self.save_plan(&plan).await
    }

    /// Undo one step, newest mutation first
    pub async fn rollback_step(&self, plan_id: &str, step_id: &str, dry_run: bool) -> RollbackResult {
        debug!(%plan_id, %step_id, dry_run, "RollbackJournal::rollback_step: called");
        let mut plan = match self.require_plan(plan_id).await {
            Ok(plan) => plan,
            Err(e) => return RollbackResult::failed(dry_run, e.to_string()),
        };
        let Some(step) = plan.steps.get_mut(step_id) else {
            return RollbackResult::failed(dry_run, format!("Step not found: {}", step_id));
        };

        let mut result = RollbackResult::new(dry_run);
        self.undo(&mut step.snapshots, Some(step_id), dry_run, &mut result).await;
        if !dry_run && let Err(e) = self.save_plan(&plan).await {
            result.success = false;
            result.error = Some(e.to_string());
        }
        info!(%plan_id, %step_id, dry_run, success = result.success, files = result.actions.len(), "Step rolled back");
        result
    }

    /// Undo every step of a plan
    ///
    /// Unfinished steps go first, then completed steps in reverse completion
    /// order. A fully successful run deletes the plan record; any file error
    /// keeps it so the rollback can be retried.
    pub async fn rollback_plan(&self, plan_id: &str, dry_run: bool) -> RollbackResult {
        debug!(%plan_id, dry_run, "RollbackJournal::rollback_plan: called");
        let mut plan = match self.require_plan(plan_id).await {
            Ok(plan) => plan,
            Err(e) => return RollbackResult::failed(dry_run, e.to_string()),
        };

        let mut result = RollbackResult::new(dry_run);
        for step_id in plan.rollback_order() {
            if let Some(step) = plan.steps.get_mut(&step_id) {
                self.undo(&mut step.snapshots, Some(&step_id), dry_run, &mut result).await;
            }
        }

        if !dry_run {
            let persisted = if result.success {
                self.store.del(&plan_key(plan_id)).await.map(|_| ()).map_err(JournalError::from)
            } else {
                self.save_plan(&plan).await
            };
            if let Err(e) = persisted {
                result.success = false;
                result.error = Some(e.to_string());
            }
        }
        info!(%plan_id, dry_run, success = result.success, files = result.actions.len(), "Plan rolled back");
        result
    }

    /// Reapply one step's reverted files in original order
    pub async fn redo_step(&self, plan_id: &str, step_id: &str, dry_run: bool) -> RollbackResult {
        debug!(%plan_id, %step_id, dry_run, "RollbackJournal::redo_step: called");
        let mut plan = match self.require_plan(plan_id).await {
            Ok(plan) => plan,
            Err(e) => return RollbackResult::failed(dry_run, e.to_string()),
        };
        let Some(step) = plan.steps.get_mut(step_id) else {
            return RollbackResult::failed(dry_run, format!("Step not found: {}", step_id));
        };

        let mut result = RollbackResult::new(dry_run);
        self.reapply(&mut step.snapshots, Some(step_id), dry_run, &mut result).await;
        if !dry_run && let Err(e) = self.save_plan(&plan).await {
            result.success = false;
            result.error = Some(e.to_string());
        }
        info!(%plan_id, %step_id, dry_run, success = result.success, files = result.actions.len(), "Step redone");
        result
    }

    /// Reapply every reverted step, in the reverse of rollback order
    pub async fn redo_plan(&self, plan_id: &str, dry_run: bool) -> RollbackResult {
        debug!(%plan_id, dry_run, "RollbackJournal::redo_plan: called");
        let mut plan = match self.require_plan(plan_id).await {
            Ok(plan) => plan,
            Err(e) => return RollbackResult::failed(dry_run, e.to_string()),
        };

        let mut result = RollbackResult::new(dry_run);
        for step_id in plan.rollback_order().into_iter().rev() {
            if let Some(step) = plan.steps.get_mut(&step_id) {
                self.reapply(&mut step.snapshots, Some(&step_id), dry_run, &mut result).await;
            }
        }
        if !dry_run && let Err(e) = self.save_plan(&plan).await {
            result.success = false;
            result.error = Some(e.to_string());
        }
        info!(%plan_id, dry_run, success = result.success, files = result.actions.len(), "Plan redone");
        result
    }

    pub async fn get_rollback_info(&self, plan_id: &str) -> Result<Option<RollbackInfo>, JournalError> {
        debug!(%plan_id, "RollbackJournal::get_rollback_info: called");
        Ok(self.load_plan(plan_id).await?.as_ref().map(RollbackInfo::for_plan))
    }

    /// Raw plan record, for inspection
    pub async fn get_plan(&self, plan_id: &str) -> Result<Option<PlanRollbackData>, JournalError> {
        self.load_plan(plan_id).await
    }

    /// Delete the plan record; returns whether one existed
    pub async fn clear_rollback_data(&self, plan_id: &str) -> Result<bool, JournalError> {
        debug!(%plan_id, "RollbackJournal::clear_rollback_data: called");
        Ok(self.store.del(&plan_key(plan_id)).await?)
    }

    // === Task scope ===

    /// Create the task record, or return the existing one
    pub async fn start_task(
        &self,
        task_id: &str,
        description: Option<&str>,
        conversation_id: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<TaskRollbackData, JournalError> {
        debug!(%task_id, "RollbackJournal::start_task: called");
        if let Some(existing) = self.load_task(task_id).await? {
            return Ok(existing);
        }
        let mut task = TaskRollbackData::new(task_id);
        task.description = description.map(String::from);
        task.conversation_id = conversation_id.map(String::from);
        task.user_id = user_id.map(String::from);
        self.save_task(&task).await?;
        info!(%task_id, "Rollback task started");
        Ok(task)
    }

    pub async fn snapshot_task_file(&self, task_id: &str, path: &str, change_type: ChangeType) -> Result<bool, JournalError> {
        debug!(%task_id, %path, %change_type, "RollbackJournal::snapshot_task_file: called");
        let mut task = self.require_task(task_id).await?;
        if task.snapshots.iter().any(|s| s.path == path) {
            return Ok(false);
        }
        let snapshot = take_snapshot(self.fs.as_ref(), path, change_type).await?;
        task.snapshots.push(snapshot);
        self.save_task(&task).await?;
        Ok(true)
    }

    pub async fn capture_task_after_content(&self, task_id: &str, path: &str) -> Result<(), JournalError> {
        debug!(%task_id, %path, "RollbackJournal::capture_task_after_content: called");
        let mut task = self.require_task(task_id).await?;
        let content = self.fs.read(Path::new(path)).await.map_err(io_error(path))?;
        Self::capture_into(&mut task.snapshots, format!("task {}", task_id), path, content)?;
        self.save_task(&task).await
    }

    /// Undo a task's files newest first
    ///
    /// The record is kept either way so `redo_task` can reapply it.
    pub async fn rollback_task(&self, task_id: &str, dry_run: bool) -> RollbackResult {
        debug!(%task_id, dry_run, "RollbackJournal::rollback_task: called");
        let mut task = match self.require_task(task_id).await {
            Ok(task) => task,
            Err(e) => return RollbackResult::failed(dry_run, e.to_string()),
        };
        let mut result = RollbackResult::new(dry_run);
        self.undo(&mut task.snapshots, None, dry_run, &mut result).await;
        if !dry_run && let Err(e) = self.save_task(&task).await {
            result.success = false;
            result.error = Some(e.to_string());
        }
        info!(%task_id, dry_run, success = result.success, files = result.actions.len(), "Task rolled back");
        result
    }

    pub async fn redo_task(&self, task_id: &str, dry_run: bool) -> RollbackResult {
        debug!(%task_id, dry_run, "RollbackJournal::redo_task: called");
        let mut task = match self.require_task(task_id).await {
            Ok(task) => task,
            Err(e) => return RollbackResult::failed(dry_run, e.to_string()),
        };
        let mut result = RollbackResult::new(dry_run);
        self.reapply(&mut task.snapshots, None, dry_run, &mut result).await;
        if !dry_run && let Err(e) = self.save_task(&task).await {
            result.success = false;
            result.error = Some(e.to_string());
        }
        info!(%task_id, dry_run, success = result.success, files = result.actions.len(), "Task redone");
        result
    }

    pub async fn get_task_rollback_info(&self, task_id: &str) -> Result<Option<RollbackInfo>, JournalError> {
        debug!(%task_id, "RollbackJournal::get_task_rollback_info: called");
        Ok(self.load_task(task_id).await?.as_ref().map(RollbackInfo::for_task))
    }

    pub async fn clear_task_rollback_data(&self, task_id: &str) -> Result<bool, JournalError> {
        debug!(%task_id, "RollbackJournal::clear_task_rollback_data: called");
        Ok(self.store.del(&task_key(task_id)).await?)
    }
}
