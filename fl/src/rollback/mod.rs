//! Rollback/redo journal for agent file mutations
//!
//! Before a step or task mutates a file it snapshots the pre-image; after,
//! it captures the post-image. Undo walks snapshots newest first and writes
//! pre-images back; redo walks them oldest first and reapplies post-images.
//!
//! ```text
//!   snapshot_file ──► mutate ──► capture_after_content
//!                                       │
//!            rollback_step/plan ◄───────┘
//!                   │  ▲
//!                   ▼  │
//!              redo_step/plan
//! ```

mod config;
mod error;
mod fs;
mod journal;
mod types;

pub use config::RollbackConfig;
pub use error::JournalError;
pub use fs::{FileSystem, LocalFileSystem, content_hash};
pub use journal::{RollbackJournal, plan_key, task_key};
pub use types::{
    ActionRecord, ChangeType, FileAction, FileError, FileSnapshot, PlanRollbackData, RollbackInfo, RollbackResult,
    SCHEMA_VERSION, StepInfo, StepRollbackData, TaskRollbackData,
};
