//! In-process store backend
//!
//! All state lives behind one mutex, which makes every operation atomic by
//! construction. Blocking stream reads park on a `Notify` that `xadd` pokes;
//! pub/sub deliveries go through per-subscriber unbounded channels.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::store::{SharedStore, Subscriber};
use crate::types::{AtomicScript, PubSubMessage, StreamEntry, StreamId, now_ms};

struct KvEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl KvEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

#[derive(Default)]
struct MemStream {
    last_id: StreamId,
    entries: VecDeque<StreamEntry>,
}

struct SubscriberSlot {
    channels: HashSet<String>,
    patterns: HashMap<String, glob::Pattern>,
    tx: mpsc::UnboundedSender<PubSubMessage>,
}

#[derive(Default)]
struct State {
    kv: HashMap<String, KvEntry>,
    hashes: HashMap<String, HashMap<String, String>>,
    streams: HashMap<String, MemStream>,
    subscribers: HashMap<u64, SubscriberSlot>,
    next_subscriber_id: u64,
}

impl State {
    /// Drop `key` if its TTL has passed, returning the live entry if any
    fn live(&mut self, key: &str) -> Option<&mut KvEntry> {
        let now = Instant::now();
        if self.kv.get(key).map(|e| e.is_expired(now)).unwrap_or(false) {
            debug!(%key, "MemoryStore: expired key evicted");
            self.kv.remove(key);
        }
        self.kv.get_mut(key)
    }
}

struct Shared {
    state: Mutex<State>,
    stream_notify: Notify,
}

impl Shared {
    fn state(&self) -> StoreResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| StoreError::Backend("memory store mutex poisoned".to_string()))
    }
}

/// Process-local implementation of [`SharedStore`]
///
/// Cloning is cheap and every clone sees the same data, so several
/// simulated agents in one process can share a store.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        debug!("MemoryStore::new: called");
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                stream_notify: Notify::new(),
            }),
        }
    }

    fn collect_after(state: &State, cursors: &[(String, StreamId)], count: usize) -> Vec<StreamEntry> {
        let mut out = Vec::new();
        for (stream, after) in cursors {
            if let Some(s) = state.streams.get(stream) {
                out.extend(s.entries.iter().filter(|e| e.id > *after).take(count).cloned());
            }
        }
        out
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut state = self.shared.state()?;
        Ok(state.live(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        debug!(%key, ?ttl, "MemoryStore::set: called");
        let mut state = self.shared.state()?;
        state.kv.insert(
            key.to_string(),
            KvEntry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<bool> {
        debug!(%key, ?ttl, "MemoryStore::set_nx: called");
        let mut state = self.shared.state()?;
        if state.live(key).is_some() {
            debug!(%key, "MemoryStore::set_nx: key exists");
            return Ok(false);
        }
        state.kv.insert(
            key.to_string(),
            KvEntry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        debug!(%key, "MemoryStore::del: called");
        let mut state = self.shared.state()?;
        let existed = state.live(key).is_some();
        state.kv.remove(key);
        let hash_existed = state.hashes.remove(key).is_some();
        let stream_existed = state.streams.remove(key).is_some();
        Ok(existed || hash_existed || stream_existed)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut state = self.shared.state()?;
        Ok(state.live(key).is_some() || state.hashes.contains_key(key) || state.streams.contains_key(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        debug!(%key, ?ttl, "MemoryStore::expire: called");
        let mut state = self.shared.state()?;
        match state.live(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let mut state = self.shared.state()?;
        let now = Instant::now();
        Ok(state
            .live(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        debug!(%key, %field, "MemoryStore::hset: called");
        let mut state = self.shared.state()?;
        state
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let state = self.shared.state()?;
        Ok(state.hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let state = self.shared.state()?;
        Ok(state.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        let mut state = self.shared.state()?;
        let Some(hash) = state.hashes.get_mut(key) else {
            return Ok(false);
        };
        let existed = hash.remove(field).is_some();
        if hash.is_empty() {
            state.hashes.remove(key);
        }
        Ok(existed)
    }

    async fn xadd(&self, stream: &str, fields: &[(String, String)], max_len: Option<usize>) -> StoreResult<StreamId> {
        debug!(%stream, ?max_len, "MemoryStore::xadd: called");
        let id = {
            let mut state = self.shared.state()?;
            let s = state.streams.entry(stream.to_string()).or_default();
            let id = s.last_id.next_after(now_ms().max(0) as u64);
            s.last_id = id;
            s.entries.push_back(StreamEntry {
                stream: stream.to_string(),
                id,
                fields: fields.iter().cloned().collect(),
            });
            if let Some(max) = max_len {
                while s.entries.len() > max {
                    s.entries.pop_front();
                }
            }
            id
        };
        self.shared.stream_notify.notify_waiters();
        Ok(id)
    }

    async fn xread(
        &self,
        cursors: &[(String, StreamId)],
        count: usize,
        block: Option<Duration>,
    ) -> StoreResult<Vec<StreamEntry>> {
        let deadline = block.map(|b| Instant::now() + b);
        loop {
            let notified = {
                let state = self.shared.state()?;
                let entries = Self::collect_after(&state, cursors, count);
                if !entries.is_empty() || deadline.is_none() {
                    return Ok(entries);
                }
                // Registered before the lock is released so an xadd in between is not missed
                self.shared.stream_notify.notified()
            };

            let remaining = deadline
                .map(|d| d.saturating_duration_since(Instant::now()))
                .unwrap_or_default();
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn stream_tail(&self, stream: &str) -> StoreResult<StreamId> {
        let state = self.shared.state()?;
        Ok(state.streams.get(stream).map(|s| s.last_id).unwrap_or(StreamId::ZERO))
    }

    async fn xlen(&self, stream: &str) -> StoreResult<usize> {
        let state = self.shared.state()?;
        Ok(state.streams.get(stream).map(|s| s.entries.len()).unwrap_or(0))
    }

    async fn xrevrange(&self, stream: &str, count: usize) -> StoreResult<Vec<StreamEntry>> {
        let state = self.shared.state()?;
        Ok(state
            .streams
            .get(stream)
            .map(|s| s.entries.iter().rev().take(count).cloned().collect())
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<usize> {
        debug!(%channel, "MemoryStore::publish: called");
        let state = self.shared.state()?;
        let mut delivered = 0;
        for slot in state.subscribers.values() {
            if slot.channels.contains(channel) {
                let msg = PubSubMessage {
                    channel: channel.to_string(),
                    pattern: None,
                    payload: payload.to_string(),
                };
                if slot.tx.send(msg).is_ok() {
                    delivered += 1;
                }
            }
            for (raw, pattern) in &slot.patterns {
                if pattern.matches(channel) {
                    let msg = PubSubMessage {
                        channel: channel.to_string(),
                        pattern: Some(raw.clone()),
                        payload: payload.to_string(),
                    };
                    if slot.tx.send(msg).is_ok() {
                        delivered += 1;
                    }
                }
            }
        }
        debug!(%channel, delivered, "MemoryStore::publish: delivered");
        Ok(delivered)
    }

    async fn subscriber(&self) -> StoreResult<Arc<dyn Subscriber>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.shared.state()?;
        let id = state.next_subscriber_id;
        state.next_subscriber_id += 1;
        state.subscribers.insert(
            id,
            SubscriberSlot {
                channels: HashSet::new(),
                patterns: HashMap::new(),
                tx,
            },
        );
        debug!(id, "MemoryStore::subscriber: opened");
        Ok(Arc::new(MemorySubscriber {
            id,
            shared: self.shared.clone(),
            rx: tokio::sync::Mutex::new(rx),
        }))
    }

    async fn eval(&self, key: &str, script: AtomicScript) -> StoreResult<bool> {
        debug!(%key, script = script.name(), "MemoryStore::eval: called");
        let mut state = self.shared.state()?;
        let matches = state.live(key).map(|e| e.value == script.expected()).unwrap_or(false);
        if !matches {
            return Ok(false);
        }
        match script {
            AtomicScript::CompareAndDelete { .. } => {
                state.kv.remove(key);
            }
            AtomicScript::CompareAndExpire { ttl, .. } => {
                if let Some(entry) = state.kv.get_mut(key) {
                    entry.expires_at = Some(Instant::now() + ttl);
                }
            }
        }
        Ok(true)
    }

    async fn ping(&self) -> StoreResult<()> {
        self.shared.state().map(|_| ())
    }
}

/// Subscriber connection for [`MemoryStore`]
struct MemorySubscriber {
    id: u64,
    shared: Arc<Shared>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<PubSubMessage>>,
}

impl MemorySubscriber {
    fn with_slot<T>(&self, f: impl FnOnce(&mut SubscriberSlot) -> T) -> StoreResult<T> {
        let mut state = self.shared.state()?;
        let slot = state
            .subscribers
            .get_mut(&self.id)
            .ok_or_else(|| StoreError::Backend(format!("subscriber {} is closed", self.id)))?;
        Ok(f(slot))
    }
}

#[async_trait]
impl Subscriber for MemorySubscriber {
    async fn subscribe(&self, channel: &str) -> StoreResult<()> {
        debug!(id = self.id, %channel, "MemorySubscriber::subscribe: called");
        self.with_slot(|slot| {
            slot.channels.insert(channel.to_string());
        })
    }

    async fn unsubscribe(&self, channel: &str) -> StoreResult<()> {
        debug!(id = self.id, %channel, "MemorySubscriber::unsubscribe: called");
        self.with_slot(|slot| {
            slot.channels.remove(channel);
        })
    }

    async fn psubscribe(&self, pattern: &str) -> StoreResult<()> {
        debug!(id = self.id, %pattern, "MemorySubscriber::psubscribe: called");
        let compiled = glob::Pattern::new(pattern).map_err(|e| StoreError::InvalidPattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;
        self.with_slot(|slot| {
            slot.patterns.insert(pattern.to_string(), compiled);
        })
    }

    async fn punsubscribe(&self, pattern: &str) -> StoreResult<()> {
        debug!(id = self.id, %pattern, "MemorySubscriber::punsubscribe: called");
        self.with_slot(|slot| {
            slot.patterns.remove(pattern);
        })
    }

    async fn next_message(&self, timeout: Duration) -> StoreResult<Option<PubSubMessage>> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(msg) => Ok(msg),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for MemorySubscriber {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.state() {
            state.subscribers.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[tokio::test]
    async fn test_set_nx_only_once() {
        let store = MemoryStore::new();
        assert!(store.set_nx("k", "a", None).await.unwrap());
        assert!(!store.set_nx("k", "b", None).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_ttl_expiry_frees_key() {
        let store = MemoryStore::new();
        assert!(store.set_nx("k", "a", Some(Duration::from_millis(50))).await.unwrap());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.set_nx("k", "b", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_eval_compare_and_delete() {
        let store = MemoryStore::new();
        store.set("k", "owner-a", None).await.unwrap();

        let wrong = AtomicScript::CompareAndDelete {
            expected: "owner-b".to_string(),
        };
        assert!(!store.eval("k", wrong).await.unwrap());
        assert!(store.exists("k").await.unwrap());

        let right = AtomicScript::CompareAndDelete {
            expected: "owner-a".to_string(),
        };
        assert!(store.eval("k", right).await.unwrap());
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_eval_compare_and_expire() {
        let store = MemoryStore::new();
        store.set("k", "owner", Some(Duration::from_millis(100))).await.unwrap();
        let script = AtomicScript::CompareAndExpire {
            expected: "owner".to_string(),
            ttl: Duration::from_secs(60),
        };
        assert!(store.eval("k", script).await.unwrap());
        let ttl = store.ttl("k").await.unwrap().unwrap();
        assert!(ttl > Duration::from_secs(50));
    }

    #[tokio::test]
    async fn test_hash_roundtrip() {
        let store = MemoryStore::new();
        store.hset("agent:1", "status", "idle").await.unwrap();
        store.hset("agent:1", "task", "t-1").await.unwrap();
        assert_eq!(store.hget("agent:1", "status").await.unwrap().as_deref(), Some("idle"));
        assert_eq!(store.hgetall("agent:1").await.unwrap().len(), 2);
        assert!(store.hdel("agent:1", "task").await.unwrap());
        assert!(!store.hdel("agent:1", "task").await.unwrap());
    }

    #[tokio::test]
    async fn test_stream_trim_and_order() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .xadd("s", &fields(&[("n", &i.to_string())]), Some(3))
                .await
                .unwrap();
        }
        assert_eq!(store.xlen("s").await.unwrap(), 3);

        let entries = store
            .xread(&[("s".to_string(), StreamId::ZERO)], 10, None)
            .await
            .unwrap();
        let ns: Vec<_> = entries.iter().map(|e| e.field("n").unwrap().to_string()).collect();
        assert_eq!(ns, vec!["2", "3", "4"]);

        let newest = store.xrevrange("s", 1).await.unwrap();
        assert_eq!(newest[0].field("n"), Some("4"));
    }

    #[tokio::test]
    async fn test_blocking_xread_wakes_on_xadd() {
        let store = MemoryStore::new();
        let tail = store.stream_tail("s").await.unwrap();

        let reader = store.clone();
        let handle = tokio::spawn(async move {
            reader
                .xread(&[("s".to_string(), tail)], 10, Some(Duration::from_secs(2)))
                .await
                .unwrap()
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        store.xadd("s", &fields(&[("k", "v")]), None).await.unwrap();

        let entries = handle.await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].field("k"), Some("v"));
    }

    #[tokio::test]
    async fn test_blocking_xread_times_out_empty() {
        let store = MemoryStore::new();
        let entries = store
            .xread(&[("s".to_string(), StreamId::ZERO)], 10, Some(Duration::from_millis(30)))
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_publish_counts_channel_and_pattern_subscriptions() {
        let store = MemoryStore::new();
        let sub = store.subscriber().await.unwrap();
        sub.subscribe("agent:7:events").await.unwrap();
        sub.psubscribe("agent:*:events").await.unwrap();

        let count = store.publish("agent:7:events", "{}").await.unwrap();
        assert_eq!(count, 2);

        let first = sub.next_message(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(first.pattern, None);
        let second = sub.next_message(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(second.pattern.as_deref(), Some("agent:*:events"));
    }

    #[tokio::test]
    async fn test_dropped_subscriber_stops_counting() {
        let store = MemoryStore::new();
        let sub = store.subscriber().await.unwrap();
        sub.subscribe("c").await.unwrap();
        assert_eq!(store.publish("c", "x").await.unwrap(), 1);
        drop(sub);
        assert_eq!(store.publish("c", "x").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_pattern_rejected() {
        let store = MemoryStore::new();
        let sub = store.subscriber().await.unwrap();
        let err = sub.psubscribe("agent:[").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidPattern { .. }));
    }
}
