//! SharedStore - the single source of truth shared by every agent process
//!
//! Provides the primitives the fleet coordinates through:
//! - **Key/value** with optional TTL and conditional set-if-absent
//! - **Hashes** for small structured records
//! - **Streams**: append-only, length-capped logs with blocking reads
//! - **Pub/Sub**: channel and glob-pattern subscriptions, fire-and-forget
//! - **Atomic scripts**: compare-and-delete / compare-and-expire
//!
//! # Backends
//!
//! ```text
//! ┌──────────────────────────┐      ┌──────────────────────────┐
//! │       MemoryStore        │      │       SqliteStore        │
//! │  one process, many tasks │      │ many processes, one host │
//! │  Mutex + Notify + mpsc   │      │  WAL + BEGIN IMMEDIATE   │
//! └──────────────────────────┘      └──────────────────────────┘
//!              ↑                                 ↑
//!              └──────── dyn SharedStore ────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use sharedstore::{AtomicScript, MemoryStore, SharedStore};
//!
//! let store = MemoryStore::new();
//! store.set_nx("lock:db", "token-a", Some(ttl)).await?;
//! store.eval("lock:db", AtomicScript::CompareAndDelete { expected: "token-a".into() }).await?;
//! ```

mod error;
mod memory;
mod sqlite;
mod store;
mod types;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use sqlite::{SqliteStore, SqliteStoreConfig};
pub use store::{SharedStore, Subscriber};
pub use types::{AtomicScript, PubSubMessage, StreamEntry, StreamId, now_ms};
