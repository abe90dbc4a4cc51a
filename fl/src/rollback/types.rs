//! Rollback records and results

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::fs::content_hash;

/// Version written into every persisted record
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Modify,
    Delete,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Modify => write!(f, "modify"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Pre and post image of one file for one mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSnapshot {
    pub path: String,
    pub change_type: ChangeType,
    /// `None` exactly when the change creates the file
    pub original_content: Option<String>,
    pub original_hash: Option<String>,
    /// Filled in after the mutation; required for redo
    pub new_content: Option<String>,
    pub new_hash: Option<String>,
    /// Set once the file has been reverted, cleared again by redo
    pub rolled_back: bool,
    pub timestamp: DateTime<Utc>,
}

impl FileSnapshot {
    pub fn new(path: impl Into<String>, change_type: ChangeType, original_content: Option<String>) -> Self {
        let original_hash = original_content.as_deref().map(content_hash);
        Self {
            path: path.into(),
            change_type,
            original_content,
            original_hash,
            new_content: None,
            new_hash: None,
            rolled_back: false,
            timestamp: Utc::now(),
        }
    }

    pub fn set_new_content(&mut self, content: Option<String>) {
        self.new_hash = content.as_deref().map(content_hash);
        self.new_content = content;
    }

    /// Whether redo has what it needs for this file
    pub fn can_redo(&self) -> bool {
        self.change_type == ChangeType::Delete || self.new_content.is_some()
    }

    fn validate(&self) -> Result<(), String> {
        match (self.change_type, &self.original_content) {
            (ChangeType::Create, Some(_)) => Err(format!("create snapshot of {} has original content", self.path)),
            (ChangeType::Modify | ChangeType::Delete, None) => Err(format!(
                "{} snapshot of {} has no original content",
                self.change_type, self.path
            )),
            _ => Ok(()),
        }
    }
}

fn validate_snapshots(snapshots: &[FileSnapshot]) -> Result<(), String> {
    let mut seen = std::collections::HashSet::new();
    for snap in snapshots {
        snap.validate()?;
        if !seen.insert(snap.path.as_str()) {
            return Err(format!("duplicate snapshot of {}", snap.path));
        }
    }
    Ok(())
}

fn check_version(version: u32) -> Result<(), String> {
    if version != SCHEMA_VERSION {
        return Err(format!("unsupported schema version {}", version));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRollbackData {
    pub step_id: String,
    pub step_title: String,
    /// In mutation order; at most one per path
    pub snapshots: Vec<FileSnapshot>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepRollbackData {
    pub fn new(step_id: impl Into<String>, step_title: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            step_title: step_title.into(),
            snapshots: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanRollbackData {
    pub schema_version: u32,
    pub plan_id: String,
    pub conversation_id: Option<String>,
    pub steps: BTreeMap<String, StepRollbackData>,
    /// Step ids in the order they completed
    #[serde(default)]
    pub completion_order: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl PlanRollbackData {
    pub fn new(plan_id: impl Into<String>, conversation_id: Option<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            plan_id: plan_id.into(),
            conversation_id,
            steps: BTreeMap::new(),
            completion_order: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        check_version(self.schema_version)?;
        for (id, step) in &self.steps {
            if *id != step.step_id {
                return Err(format!("step keyed {} claims id {}", id, step.step_id));
            }
            validate_snapshots(&step.snapshots)?;
        }
        if let Some(unknown) = self.completion_order.iter().find(|id| !self.steps.contains_key(*id)) {
            return Err(format!("completion order names unknown step {}", unknown));
        }
        Ok(())
    }

    /// Step ids in the order they are undone
    ///
    /// Steps that never completed come first, most recently started first;
    /// then completed steps, most recently completed first.
    pub fn rollback_order(&self) -> Vec<String> {
        let mut unfinished: Vec<&StepRollbackData> = self
            .steps
            .values()
            .filter(|s| !self.completion_order.contains(&s.step_id))
            .collect();
        unfinished.sort_by(|a, b| b.started_at.cmp(&a.started_at));

        unfinished
            .into_iter()
            .map(|s| s.step_id.clone())
            .chain(self.completion_order.iter().rev().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRollbackData {
    pub schema_version: u32,
    pub task_id: String,
    pub conversation_id: Option<String>,
    pub user_id: Option<String>,
    pub description: Option<String>,
    pub snapshots: Vec<FileSnapshot>,
    pub created_at: DateTime<Utc>,
}

impl TaskRollbackData {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            task_id: task_id.into(),
            conversation_id: None,
            user_id: None,
            description: None,
            snapshots: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        check_version(self.schema_version)?;
        validate_snapshots(&self.snapshots)
    }
}

// === Results ===

/// What was (or, for a dry run, would be) done to one file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    /// Write back earlier content over an existing file
    Restore,
    Delete,
    /// Write a file that is currently absent
    Recreate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub path: String,
    pub action: FileAction,
    pub step_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileError {
    pub path: String,
    pub error: String,
}

/// Outcome of a rollback or redo
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackResult {
    /// True when nothing failed
    pub success: bool,
    pub dry_run: bool,
    /// Every file touched, in processing order
    pub actions: Vec<ActionRecord>,
    pub restored: Vec<String>,
    pub deleted: Vec<String>,
    pub recreated: Vec<String>,
    pub errors: Vec<FileError>,
    /// Failure of the whole operation, such as an unknown id
    pub error: Option<String>,
}

impl RollbackResult {
    pub fn new(dry_run: bool) -> Self {
        Self {
            success: true,
            dry_run,
            ..Default::default()
        }
    }

    pub fn failed(dry_run: bool, error: impl Into<String>) -> Self {
        Self {
            success: false,
            dry_run,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub(crate) fn push_action(&mut self, path: &str, action: FileAction, step_id: Option<&str>) {
        let list = match action {
            FileAction::Restore => &mut self.restored,
            FileAction::Delete => &mut self.deleted,
            FileAction::Recreate => &mut self.recreated,
        };
        list.push(path.to_string());
        self.actions.push(ActionRecord {
            path: path.to_string(),
            action,
            step_id: step_id.map(String::from),
        });
    }

    pub(crate) fn push_error(&mut self, path: &str, error: impl Into<String>) {
        self.success = false;
        self.errors.push(FileError {
            path: path.to_string(),
            error: error.into(),
        });
    }

    /// Paths in processing order
    pub fn processed_paths(&self) -> Vec<&str> {
        self.actions.iter().map(|a| a.path.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepInfo {
    pub step_id: String,
    pub step_title: String,
    pub files: Vec<String>,
    pub rolled_back: usize,
    pub completed: bool,
}

/// Summary of a plan or task record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackInfo {
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// One entry per step; a task record reports a single pseudo-step
    pub steps: Vec<StepInfo>,
    pub total_files: usize,
    pub rolled_back_files: usize,
    pub can_rollback: bool,
    pub can_redo: bool,
}

impl RollbackInfo {
    fn from_steps(id: &str, created_at: DateTime<Utc>, steps: Vec<(StepInfo, bool)>) -> Self {
        let total_files = steps.iter().map(|(s, _)| s.files.len()).sum();
        let rolled_back_files = steps.iter().map(|(s, _)| s.rolled_back).sum();
        let can_redo = steps.iter().any(|(_, redoable)| *redoable);
        Self {
            id: id.to_string(),
            created_at,
            steps: steps.into_iter().map(|(s, _)| s).collect(),
            total_files,
            rolled_back_files,
            can_rollback: rolled_back_files < total_files,
            can_redo,
        }
    }

    fn step_info(step_id: &str, title: &str, snapshots: &[FileSnapshot], completed: bool) -> (StepInfo, bool) {
        let info = StepInfo {
            step_id: step_id.to_string(),
            step_title: title.to_string(),
            files: snapshots.iter().map(|s| s.path.clone()).collect(),
            rolled_back: snapshots.iter().filter(|s| s.rolled_back).count(),
            completed,
        };
        let redoable = snapshots.iter().any(|s| s.rolled_back && s.can_redo());
        (info, redoable)
    }

    pub fn for_plan(plan: &PlanRollbackData) -> Self {
        let steps = plan
            .steps
            .values()
            .map(|s| Self::step_info(&s.step_id, &s.step_title, &s.snapshots, s.completed_at.is_some()))
            .collect();
        Self::from_steps(&plan.plan_id, plan.created_at, steps)
    }

    pub fn for_task(task: &TaskRollbackData) -> Self {
        let title = task.description.clone().unwrap_or_default();
        let step = Self::step_info(&task.task_id, &title, &task.snapshots, true);
        Self::from_steps(&task.task_id, task.created_at, vec![step])
    }
}
