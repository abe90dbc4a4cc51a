//! Pub/Sub manager
//!
//! Fire-and-forget fan-out on named channels. Delivery is at-most-once:
//! nothing is redelivered, and messages published while nobody listens are
//! gone.

pub mod channels;
mod config;
mod manager;

pub use config::PubSubConfig;
pub use manager::{CancellationFlag, Delivery, PubSubHandler, PubSubManager, PubSubStats, handler};
