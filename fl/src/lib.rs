//! fleetctl - coordination control plane for agent fleets
//!
//! Independent agent processes share one [`sharedstore::SharedStore`] and
//! coordinate through it. An agent that wants to change a file asks the
//! elevation manager for permission, locks the path, snapshots the pre-image
//! in the rollback journal, mutates, captures the post-image and unlocks.
//! Task dispatch, status and cancellation travel over the message bus and
//! pub/sub channels.
//!
//! # Modules
//!
//! - [`lock`] - Distributed lock with owner tokens and TTL recovery
//! - [`pubsub`] - Channel and pattern subscriptions, fire-and-forget
//! - [`bus`] - Request/reply over streams with a dead-letter stream
//! - [`elevation`] - Rate-limited permission elevation
//! - [`rollback`] - Step and task scoped undo/redo of file changes
//! - [`agents`] - Agent status records
//! - [`runtime`] - The [`ControlPlane`] composition root
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod agents;
pub mod bus;
pub mod cli;
pub mod config;
pub mod elevation;
pub mod lock;
pub mod messages;
pub mod pubsub;
pub mod rollback;
pub mod runtime;
pub mod service;

// Re-export commonly used types
pub use agents::{AgentError, AgentRecord, AgentTracker};
pub use bus::{BusConfig, BusError, MessageBus};
pub use config::{Config, StoreBackend, StoreConfig};
pub use elevation::{AgentContext, ElevationConfig, ElevationManager, ElevationOutcome, PermissionLevel};
pub use lock::{LockConfig, LockError, LockGuard, LockManager, LockOptions};
pub use messages::{Message, MessageKind, MessageType};
pub use pubsub::{PubSubConfig, PubSubManager};
pub use rollback::{ChangeType, RollbackConfig, RollbackJournal, RollbackResult};
pub use runtime::{ChangeScope, ControlError, ControlPlane, FileChange, FileChangeOutcome, FileChangeRequest};
