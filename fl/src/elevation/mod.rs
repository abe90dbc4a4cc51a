//! Permission elevation
//!
//! ```text
//! REQUESTED ─┬─> DENIED (ceiling exceeded)
//!            ├─> DENIED (rate limited)
//!            ├─> AUTO_APPROVED ──> grant
//!            └─> PENDING ─┬─> APPROVED ──> grant
//!                         └─> DENIED
//! ```
//!
//! Effective level is recomputed from valid grants on every check.

mod config;
mod manager;
mod types;

pub use config::ElevationConfig;
pub use manager::{ElevationError, ElevationManager};
pub use types::{
    AgentContext, DenialReason, ElevationDecision, ElevationGrant, ElevationOutcome, ElevationRecord, ElevationRequest,
    ElevationStats, PermissionLevel,
};
