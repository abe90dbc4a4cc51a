//! Store traits implemented by every backend

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::types::{AtomicScript, PubSubMessage, StreamEntry, StreamId};

/// Client interface to the shared store
///
/// Implementations must be safe to share between tasks. Every method is one
/// round trip; callers should expect suspension at each call.
///
/// # Atomicity
///
/// `set_nx` and `eval` are atomic with respect to every other operation on
/// the same store, across all processes using it. Lock correctness depends
/// on this.
#[async_trait]
pub trait SharedStore: Send + Sync {
    // === Key/value ===

    /// Get a value, `None` if missing or expired
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Set a value, replacing any previous value and TTL
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Set a value only if the key does not exist; returns whether it was set
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<bool>;

    /// Delete a key; returns whether it existed
    async fn del(&self, key: &str) -> StoreResult<bool>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Set a TTL on an existing key; returns false if the key is missing
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Remaining TTL, `None` if the key is missing or has no TTL
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    // === Hashes ===

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// Delete a hash field; returns whether it existed
    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool>;

    // === Streams ===

    /// Append an entry, trimming the oldest entries beyond `max_len`
    async fn xadd(&self, stream: &str, fields: &[(String, String)], max_len: Option<usize>) -> StoreResult<StreamId>;

    /// Read entries strictly after each cursor
    ///
    /// With `block` set, waits up to that long for at least one entry across
    /// all requested streams. Returns an empty vec on timeout.
    async fn xread(
        &self,
        cursors: &[(String, StreamId)],
        count: usize,
        block: Option<Duration>,
    ) -> StoreResult<Vec<StreamEntry>>;

    /// Id of the newest entry, `StreamId::ZERO` for an empty stream
    ///
    /// Reading after this id yields only messages appended from now on.
    async fn stream_tail(&self, stream: &str) -> StoreResult<StreamId>;

    async fn xlen(&self, stream: &str) -> StoreResult<usize>;

    /// Newest `count` entries, newest first
    async fn xrevrange(&self, stream: &str, count: usize) -> StoreResult<Vec<StreamEntry>>;

    // === Pub/Sub ===

    /// Publish a payload; returns how many subscriptions received it
    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<usize>;

    /// Open a new subscriber connection
    async fn subscriber(&self) -> StoreResult<Arc<dyn Subscriber>>;

    // === Scripting ===

    /// Run an atomic script against `key`; returns whether it acted
    async fn eval(&self, key: &str, script: AtomicScript) -> StoreResult<bool>;

    async fn ping(&self) -> StoreResult<()>;
}

/// A pub/sub connection with its own subscription set
///
/// Delivery is at-most-once: messages published while nobody is subscribed,
/// or after the subscriber is dropped, are lost.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn subscribe(&self, channel: &str) -> StoreResult<()>;

    async fn unsubscribe(&self, channel: &str) -> StoreResult<()>;

    /// Subscribe to a glob pattern (`*`, `?`, `[...]`)
    async fn psubscribe(&self, pattern: &str) -> StoreResult<()>;

    async fn punsubscribe(&self, pattern: &str) -> StoreResult<()>;

    /// Wait up to `timeout` for the next message
    async fn next_message(&self, timeout: Duration) -> StoreResult<Option<PubSubMessage>>;
}
