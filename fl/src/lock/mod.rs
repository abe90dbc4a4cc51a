//! Distributed lock over the shared store
//!
//! A lock is the key `lock:{name}` holding a random owner token with a TTL.
//! Acquisition is a conditional set-if-absent. Release and extension are
//! atomic compare-and-act scripts, so a holder whose lock already expired
//! can never touch the lock of whoever took it next.
//!
//! The lock is advisory: nothing stops code that never asks for it.

mod config;
mod error;
mod guard;
mod manager;

pub use config::{LockConfig, LockProfile};
pub use error::LockError;
pub use guard::LockGuard;
pub use manager::{LockManager, LockOptions, lock_key};
