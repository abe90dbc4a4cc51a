//! Request/reply message bus over append-only streams
//!
//! Each service reads `bus:{service}:requests` and `bus:{service}:responses`.
//! Events go to the shared `bus:events` stream and anything that cannot be
//! decoded lands in `bus:dlq` with the error attached.
//!
//! Requests carry their own id as correlation id; the reply's correlation id
//! resolves the matching local pending future. Late replies to requests that
//! already timed out are dropped.

mod config;
mod core;
mod error;

pub use config::BusConfig;
pub use core::{BusHandler, BusStats, DeadLetter, MessageBus, bus_handler};
pub use error::BusError;

/// Shared event stream
pub const EVENTS_STREAM: &str = "bus:events";
/// Dead-letter stream
pub const DLQ_STREAM: &str = "bus:dlq";

pub fn request_stream(service: &str) -> String {
    format!("bus:{}:requests", service)
}

pub fn response_stream(service: &str) -> String {
    format!("bus:{}:responses", service)
}
