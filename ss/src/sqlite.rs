//! SQLite store backend
//!
//! One database file shared by every agent process on a host. Atomic steps
//! (`set_nx`, `xadd`, `eval`) run inside `BEGIN IMMEDIATE` transactions so
//! the write lock is taken before the read, which serializes them across
//! processes. Blocking reads and pub/sub deliveries poll.
//!
//! # Layout
//!
//! ```text
//! kv                  key → value, expires_at (unix ms)
//! hashes              (key, field) → value
//! stream_entries      (stream, ms, seq) → fields (JSON object)
//! stream_meta         stream → last issued id (survives trimming)
//! pubsub_messages     autoincrement id, channel, payload, published_at
//! pubsub_subscribers  id → channels, patterns (JSON arrays), last_seen
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::store::{SharedStore, Subscriber};
use crate::types::{AtomicScript, PubSubMessage, StreamEntry, StreamId, now_ms};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    expires_at INTEGER
);
CREATE TABLE IF NOT EXISTS hashes (
    key TEXT NOT NULL,
    field TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (key, field)
);
CREATE TABLE IF NOT EXISTS stream_entries (
    stream TEXT NOT NULL,
    ms INTEGER NOT NULL,
    seq INTEGER NOT NULL,
    fields TEXT NOT NULL,
    PRIMARY KEY (stream, ms, seq)
);
CREATE TABLE IF NOT EXISTS stream_meta (
    stream TEXT PRIMARY KEY,
    last_ms INTEGER NOT NULL,
    last_seq INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS pubsub_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    channel TEXT NOT NULL,
    payload TEXT NOT NULL,
    published_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS pubsub_subscribers (
    id TEXT PRIMARY KEY,
    channels TEXT NOT NULL,
    patterns TEXT NOT NULL,
    last_seen INTEGER NOT NULL
);
"#;

/// Tuning knobs for [`SqliteStore`]
#[derive(Debug, Clone)]
pub struct SqliteStoreConfig {
    /// Database file path
    pub path: PathBuf,
    /// How long a writer waits on another process's write lock
    pub busy_timeout: Duration,
    /// Sleep between polls for blocking reads and subscribers
    pub poll_interval: Duration,
    /// How long published messages are kept for slow subscribers
    pub pubsub_retention: Duration,
    /// Subscribers silent for longer than this are not counted by `publish`
    pub subscriber_liveness: Duration,
}

impl SqliteStoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(25),
            pubsub_retention: Duration::from_secs(60),
            subscriber_liveness: Duration::from_secs(30),
        }
    }
}

/// Register or refresh a subscriber row; a swept subscriber comes back on its next poll
const UPSERT_SUBSCRIBER: &str = "INSERT INTO pubsub_subscribers (id, channels, patterns, last_seen) \
     VALUES (?1, ?2, ?3, ?4) ON CONFLICT(id) DO UPDATE SET \
     channels = excluded.channels, patterns = excluded.patterns, last_seen = excluded.last_seen";

type SharedConn = Arc<Mutex<Connection>>;

fn lock_conn(conn: &SharedConn) -> StoreResult<std::sync::MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| StoreError::Backend("sqlite connection mutex poisoned".to_string()))
}

fn ttl_deadline(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|t| now_ms() + t.as_millis() as i64)
}

/// Delete expired keys and subscribers silent past the liveness window
fn sweep_stale(conn: &Connection, now: i64, liveness_ms: i64) -> StoreResult<()> {
    let keys = conn.execute(
        "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
        params![now],
    )?;
    let subscribers = conn.execute(
        "DELETE FROM pubsub_subscribers WHERE last_seen < ?1",
        params![now - liveness_ms],
    )?;
    if keys + subscribers > 0 {
        debug!(keys, subscribers, "sweep_stale: removed rows");
    }
    Ok(())
}

/// Run a closure against the connection on the blocking pool
async fn blocking<T, F>(conn: &SharedConn, f: F) -> StoreResult<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
{
    let conn = conn.clone();
    tokio::task::spawn_blocking(move || {
        let mut guard = lock_conn(&conn)?;
        f(&mut guard)
    })
    .await?
}

fn read_after(conn: &Connection, cursors: &[(String, StreamId)], count: usize) -> StoreResult<Vec<StreamEntry>> {
    let mut out = Vec::new();
    let mut stmt = conn.prepare_cached(
        "SELECT ms, seq, fields FROM stream_entries \
         WHERE stream = ?1 AND (ms > ?2 OR (ms = ?2 AND seq > ?3)) \
         ORDER BY ms, seq LIMIT ?4",
    )?;
    for (stream, after) in cursors {
        let rows = stmt
            .query_map(
                params![stream, after.ms as i64, after.seq as i64, count as i64],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?)),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        for (ms, seq, fields) in rows {
            out.push(StreamEntry {
                stream: stream.clone(),
                id: StreamId::new(ms as u64, seq as u64),
                fields: serde_json::from_str(&fields)?,
            });
        }
    }
    Ok(out)
}

fn compile_patterns(raw: &[String]) -> Vec<(String, glob::Pattern)> {
    raw.iter()
        .filter_map(|p| match glob::Pattern::new(p) {
            Ok(compiled) => Some((p.clone(), compiled)),
            Err(e) => {
                warn!(pattern = %p, error = %e, "Skipping unparsable stored pattern");
                None
            }
        })
        .collect()
}

/// File-backed, multi-process implementation of [`SharedStore`]
#[derive(Clone)]
pub struct SqliteStore {
    conn: SharedConn,
    config: Arc<SqliteStoreConfig>,
}

impl SqliteStore {
    /// Open (or create) the store at `path` with default tuning
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::with_config(SqliteStoreConfig::new(path.as_ref()))
    }

    pub fn with_config(config: SqliteStoreConfig) -> StoreResult<Self> {
        debug!(path = %config.path.display(), "SqliteStore::with_config: called");
        if let Some(parent) = config.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        let conn = Connection::open(&config.path)?;
        conn.busy_timeout(config.busy_timeout)?;
        conn.execute_batch(SCHEMA)?;
        info!(path = %config.path.display(), "SqliteStore opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config: Arc::new(config),
        })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }
}

#[async_trait]
impl SharedStore for SqliteStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let key = key.to_string();
        blocking(&self.conn, move |conn| {
            Ok(conn
                .query_row(
                    "SELECT value FROM kv WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                    params![key, now_ms()],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        debug!(%key, ?ttl, "SqliteStore::set: called");
        let (key, value) = (key.to_string(), value.to_string());
        blocking(&self.conn, move |conn| {
            conn.execute(
                "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
                params![key, value, ttl_deadline(ttl)],
            )?;
            Ok(())
        })
        .await
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<bool> {
        debug!(%key, ?ttl, "SqliteStore::set_nx: called");
        let (key, value) = (key.to_string(), value.to_string());
        blocking(&self.conn, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "DELETE FROM kv WHERE key = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
                params![key, now_ms()],
            )?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)",
                params![key, value, ttl_deadline(ttl)],
            )?;
            tx.commit()?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        debug!(%key, "SqliteStore::del: called");
        let key = key.to_string();
        blocking(&self.conn, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let kv = tx.execute(
                "DELETE FROM kv WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, now_ms()],
            )?;
            tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            let hashes = tx.execute("DELETE FROM hashes WHERE key = ?1", params![key])?;
            let entries = tx.execute("DELETE FROM stream_entries WHERE stream = ?1", params![key])?;
            let meta = tx.execute("DELETE FROM stream_meta WHERE stream = ?1", params![key])?;
            tx.commit()?;
            Ok(kv + hashes + entries + meta > 0)
        })
        .await
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let key = key.to_string();
        blocking(&self.conn, move |conn| {
            let found: i64 = conn.query_row(
                "SELECT \
                   (SELECT COUNT(*) FROM kv WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)) + \
                   (SELECT COUNT(*) FROM hashes WHERE key = ?1) + \
                   (SELECT COUNT(*) FROM stream_meta WHERE stream = ?1)",
                params![key, now_ms()],
                |row| row.get(0),
            )?;
            Ok(found > 0)
        })
        .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        debug!(%key, ?ttl, "SqliteStore::expire: called");
        let key = key.to_string();
        blocking(&self.conn, move |conn| {
            let now = now_ms();
            let updated = conn.execute(
                "UPDATE kv SET expires_at = ?2 WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?3)",
                params![key, now + ttl.as_millis() as i64, now],
            )?;
            Ok(updated > 0)
        })
        .await
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let key = key.to_string();
        blocking(&self.conn, move |conn| {
            let now = now_ms();
            let expires_at: Option<Option<i64>> = conn
                .query_row(
                    "SELECT expires_at FROM kv WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                    params![key, now],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(expires_at
                .flatten()
                .map(|at| Duration::from_millis((at - now).max(0) as u64)))
        })
        .await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        debug!(%key, %field, "SqliteStore::hset: called");
        let (key, field, value) = (key.to_string(), field.to_string(), value.to_string());
        blocking(&self.conn, move |conn| {
            conn.execute(
                "INSERT INTO hashes (key, field, value) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(key, field) DO UPDATE SET value = excluded.value",
                params![key, field, value],
            )?;
            Ok(())
        })
        .await
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let (key, field) = (key.to_string(), field.to_string());
        blocking(&self.conn, move |conn| {
            Ok(conn
                .query_row(
                    "SELECT value FROM hashes WHERE key = ?1 AND field = ?2",
                    params![key, field],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let key = key.to_string();
        blocking(&self.conn, move |conn| {
            let mut stmt = conn.prepare_cached("SELECT field, value FROM hashes WHERE key = ?1")?;
            let rows = stmt
                .query_map(params![key], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<HashMap<String, String>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        let (key, field) = (key.to_string(), field.to_string());
        blocking(&self.conn, move |conn| {
            let removed = conn.execute(
                "DELETE FROM hashes WHERE key = ?1 AND field = ?2",
                params![key, field],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn xadd(&self, stream: &str, fields: &[(String, String)], max_len: Option<usize>) -> StoreResult<StreamId> {
        debug!(%stream, ?max_len, "SqliteStore::xadd: called");
        let stream = stream.to_string();
        let encoded = serde_json::to_string(&fields.iter().cloned().collect::<BTreeMap<String, String>>())?;
        blocking(&self.conn, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let last = tx
                .query_row(
                    "SELECT last_ms, last_seq FROM stream_meta WHERE stream = ?1",
                    params![stream],
                    |row| Ok(StreamId::new(row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64)),
                )
                .optional()?
                .unwrap_or(StreamId::ZERO);
            let id = last.next_after(now_ms().max(0) as u64);
            tx.execute(
                "INSERT INTO stream_entries (stream, ms, seq, fields) VALUES (?1, ?2, ?3, ?4)",
                params![stream, id.ms as i64, id.seq as i64, encoded],
            )?;
            tx.execute(
                "INSERT INTO stream_meta (stream, last_ms, last_seq) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(stream) DO UPDATE SET last_ms = excluded.last_ms, last_seq = excluded.last_seq",
                params![stream, id.ms as i64, id.seq as i64],
            )?;
            if let Some(max) = max_len {
                tx.execute(
                    "DELETE FROM stream_entries WHERE stream = ?1 AND rowid NOT IN \
                     (SELECT rowid FROM stream_entries WHERE stream = ?1 ORDER BY ms DESC, seq DESC LIMIT ?2)",
                    params![stream, max as i64],
                )?;
            }
            tx.commit()?;
            Ok(id)
        })
        .await
    }

    async fn xread(
        &self,
        cursors: &[(String, StreamId)],
        count: usize,
        block: Option<Duration>,
    ) -> StoreResult<Vec<StreamEntry>> {
        let deadline = block.map(|b| Instant::now() + b);
        loop {
            let owned = cursors.to_vec();
            let entries = blocking(&self.conn, move |conn| read_after(conn, &owned, count)).await?;
            if !entries.is_empty() {
                return Ok(entries);
            }
            let Some(deadline) = deadline else {
                return Ok(entries);
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(entries);
            }
            tokio::time::sleep(remaining.min(self.config.poll_interval)).await;
        }
    }

    async fn stream_tail(&self, stream: &str) -> StoreResult<StreamId> {
        let stream = stream.to_string();
        blocking(&self.conn, move |conn| {
            Ok(conn
                .query_row(
                    "SELECT last_ms, last_seq FROM stream_meta WHERE stream = ?1",
                    params![stream],
                    |row| Ok(StreamId::new(row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64)),
                )
                .optional()?
                .unwrap_or(StreamId::ZERO))
        })
        .await
    }

    async fn xlen(&self, stream: &str) -> StoreResult<usize> {
        let stream = stream.to_string();
        blocking(&self.conn, move |conn| {
            let len: i64 = conn.query_row(
                "SELECT COUNT(*) FROM stream_entries WHERE stream = ?1",
                params![stream],
                |row| row.get(0),
            )?;
            Ok(len as usize)
        })
        .await
    }

    async fn xrevrange(&self, stream: &str, count: usize) -> StoreResult<Vec<StreamEntry>> {
        let stream = stream.to_string();
        blocking(&self.conn, move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT ms, seq, fields FROM stream_entries WHERE stream = ?1 ORDER BY ms DESC, seq DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![stream, count as i64], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(ms, seq, fields)| {
                    Ok(StreamEntry {
                        stream: stream.clone(),
                        id: StreamId::new(ms as u64, seq as u64),
                        fields: serde_json::from_str(&fields)?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<usize> {
        debug!(%channel, "SqliteStore::publish: called");
        let (channel, payload) = (channel.to_string(), payload.to_string());
        let retention = self.config.pubsub_retention.as_millis() as i64;
        let liveness = self.config.subscriber_liveness.as_millis() as i64;
        blocking(&self.conn, move |conn| {
            let now = now_ms();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "INSERT INTO pubsub_messages (channel, payload, published_at) VALUES (?1, ?2, ?3)",
                params![channel, payload, now],
            )?;
            tx.execute(
                "DELETE FROM pubsub_messages WHERE published_at < ?1",
                params![now - retention],
            )?;
            sweep_stale(&tx, now, liveness)?;
            let subscribers = {
                let mut stmt =
                    tx.prepare_cached("SELECT channels, patterns FROM pubsub_subscribers WHERE last_seen >= ?1")?;
                stmt.query_map(params![now - liveness], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?
            };
            tx.commit()?;

            let mut delivered = 0;
            for (channels, patterns) in subscribers {
                let channels: Vec<String> = serde_json::from_str(&channels)?;
                let patterns: Vec<String> = serde_json::from_str(&patterns)?;
                delivered += channels.iter().filter(|c| **c == channel).count();
                delivered += compile_patterns(&patterns)
                    .iter()
                    .filter(|(_, p)| p.matches(&channel))
                    .count();
            }
            Ok(delivered)
        })
        .await
    }

    async fn subscriber(&self) -> StoreResult<Arc<dyn Subscriber>> {
        let id = Uuid::now_v7().to_string();
        let row_id = id.clone();
        let cursor = blocking(&self.conn, move |conn| {
            conn.execute(
                "INSERT INTO pubsub_subscribers (id, channels, patterns, last_seen) VALUES (?1, '[]', '[]', ?2)",
                params![row_id, now_ms()],
            )?;
            let cursor: i64 = conn.query_row("SELECT COALESCE(MAX(id), 0) FROM pubsub_messages", [], |row| {
                row.get(0)
            })?;
            Ok(cursor)
        })
        .await?;
        debug!(%id, cursor, "SqliteStore::subscriber: opened");
        Ok(Arc::new(SqliteSubscriber {
            id,
            conn: self.conn.clone(),
            poll_interval: self.config.poll_interval,
            state: Mutex::new(SubscriberState {
                channels: BTreeSet::new(),
                patterns: BTreeSet::new(),
                cursor,
                buffer: VecDeque::new(),
            }),
        }))
    }

    async fn eval(&self, key: &str, script: AtomicScript) -> StoreResult<bool> {
        debug!(%key, script = script.name(), "SqliteStore::eval: called");
        let key = key.to_string();
        blocking(&self.conn, move |conn| {
            let now = now_ms();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current: Option<String> = tx
                .query_row(
                    "SELECT value FROM kv WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                    params![key, now],
                    |row| row.get(0),
                )
                .optional()?;
            if current.as_deref() != Some(script.expected()) {
                return Ok(false);
            }
            match &script {
                AtomicScript::CompareAndDelete { .. } => {
                    tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
                }
                AtomicScript::CompareAndExpire { ttl, .. } => {
                    tx.execute(
                        "UPDATE kv SET expires_at = ?2 WHERE key = ?1",
                        params![key, now + ttl.as_millis() as i64],
                    )?;
                }
            }
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    /// Round trip to the database, sweeping stale rows on the way
    async fn ping(&self) -> StoreResult<()> {
        let liveness = self.config.subscriber_liveness.as_millis() as i64;
        blocking(&self.conn, move |conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            sweep_stale(conn, now_ms(), liveness)
        })
        .await
    }
}

struct SubscriberState {
    channels: BTreeSet<String>,
    patterns: BTreeSet<String>,
    /// Highest pubsub_messages.id already examined
    cursor: i64,
    buffer: VecDeque<PubSubMessage>,
}

/// Polling subscriber for [`SqliteStore`]
struct SqliteSubscriber {
    id: String,
    conn: SharedConn,
    poll_interval: Duration,
    state: Mutex<SubscriberState>,
}

impl SqliteSubscriber {
    fn state(&self) -> StoreResult<std::sync::MutexGuard<'_, SubscriberState>> {
        self.state
            .lock()
            .map_err(|_| StoreError::Backend("subscriber state mutex poisoned".to_string()))
    }

    /// Apply a change to the subscription set and persist it
    async fn update(&self, change: impl FnOnce(&mut SubscriberState)) -> StoreResult<()> {
        let (channels, patterns) = {
            let mut state = self.state()?;
            change(&mut state);
            (
                serde_json::to_string(&state.channels)?,
                serde_json::to_string(&state.patterns)?,
            )
        };
        let id = self.id.clone();
        blocking(&self.conn, move |conn| {
            conn.execute(UPSERT_SUBSCRIBER, params![id, channels, patterns, now_ms()])?;
            Ok(())
        })
        .await
    }

    /// Fetch everything published since the cursor that matches this subscriber
    async fn poll(&self) -> StoreResult<()> {
        let (id, cursor, channels, patterns, channels_json, patterns_json) = {
            let state = self.state()?;
            (
                self.id.clone(),
                state.cursor,
                state.channels.clone(),
                state.patterns.iter().cloned().collect::<Vec<_>>(),
                serde_json::to_string(&state.channels)?,
                serde_json::to_string(&state.patterns)?,
            )
        };
        let (new_cursor, messages) = blocking(&self.conn, move |conn| {
            conn.execute(UPSERT_SUBSCRIBER, params![id, channels_json, patterns_json, now_ms()])?;
            let mut stmt = conn.prepare_cached(
                "SELECT id, channel, payload FROM pubsub_messages WHERE id > ?1 ORDER BY id LIMIT 256",
            )?;
            let rows = stmt
                .query_map(params![cursor], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let compiled = compile_patterns(&patterns);
            let mut last = cursor;
            let mut out = Vec::new();
            for (row_id, channel, payload) in rows {
                last = row_id;
                if channels.contains(&channel) {
                    out.push(PubSubMessage {
                        channel: channel.clone(),
                        pattern: None,
                        payload: payload.clone(),
                    });
                }
                for (raw, pattern) in &compiled {
                    if pattern.matches(&channel) {
                        out.push(PubSubMessage {
                            channel: channel.clone(),
                            pattern: Some(raw.clone()),
                            payload: payload.clone(),
                        });
                    }
                }
            }
            Ok((last, out))
        })
        .await?;

        let mut state = self.state()?;
        state.cursor = new_cursor;
        state.buffer.extend(messages);
        Ok(())
    }
}

#[async_trait]
impl Subscriber for SqliteSubscriber {
    async fn subscribe(&self, channel: &str) -> StoreResult<()> {
        debug!(id = %self.id, %channel, "SqliteSubscriber::subscribe: called");
        let channel = channel.to_string();
        self.update(move |state| {
            state.channels.insert(channel);
        })
        .await
    }

    async fn unsubscribe(&self, channel: &str) -> StoreResult<()> {
        debug!(id = %self.id, %channel, "SqliteSubscriber::unsubscribe: called");
        self.update(|state| {
            state.channels.remove(channel);
        })
        .await
    }

    async fn psubscribe(&self, pattern: &str) -> StoreResult<()> {
        debug!(id = %self.id, %pattern, "SqliteSubscriber::psubscribe: called");
        glob::Pattern::new(pattern).map_err(|e| StoreError::InvalidPattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;
        let pattern = pattern.to_string();
        self.update(move |state| {
            state.patterns.insert(pattern);
        })
        .await
    }

    async fn punsubscribe(&self, pattern: &str) -> StoreResult<()> {
        debug!(id = %self.id, %pattern, "SqliteSubscriber::punsubscribe: called");
        self.update(|state| {
            state.patterns.remove(pattern);
        })
        .await
    }

    async fn next_message(&self, timeout: Duration) -> StoreResult<Option<PubSubMessage>> {
        let deadline = Instant::now() + timeout;
        loop {
            let buffered = self.state()?.buffer.pop_front();
            if let Some(msg) = buffered {
                return Ok(Some(msg));
            }
            self.poll().await?;
            let fetched = self.state()?.buffer.pop_front();
            if let Some(msg) = fetched {
                return Ok(Some(msg));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::time::sleep(remaining.min(self.poll_interval)).await;
        }
    }
}

impl Drop for SqliteSubscriber {
    fn drop(&mut self) {
        if let Ok(conn) = self.conn.lock()
            && let Err(e) = conn.execute("DELETE FROM pubsub_subscribers WHERE id = ?1", params![self.id])
        {
            warn!(id = %self.id, error = %e, "Failed to deregister subscriber");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> SqliteStore {
        SqliteStore::open(dir.path().join("store.db")).unwrap()
    }

    #[tokio::test]
    async fn test_set_nx_across_connections() {
        let dir = TempDir::new().unwrap();
        let a = open(&dir);
        let b = open(&dir);

        assert!(a.set_nx("lock:x", "a", Some(Duration::from_secs(5))).await.unwrap());
        assert!(!b.set_nx("lock:x", "b", Some(Duration::from_secs(5))).await.unwrap());
        assert_eq!(b.get("lock:x").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_expired_key_can_be_reacquired() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        assert!(store.set_nx("k", "a", Some(Duration::from_millis(30))).await.unwrap());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.set_nx("k", "b", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_eval_only_acts_for_matching_value() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.set("k", "mine", None).await.unwrap();

        let other = AtomicScript::CompareAndDelete {
            expected: "theirs".to_string(),
        };
        assert!(!store.eval("k", other).await.unwrap());

        let extend = AtomicScript::CompareAndExpire {
            expected: "mine".to_string(),
            ttl: Duration::from_secs(30),
        };
        assert!(store.eval("k", extend).await.unwrap());
        assert!(store.ttl("k").await.unwrap().is_some());

        let delete = AtomicScript::CompareAndDelete {
            expected: "mine".to_string(),
        };
        assert!(store.eval("k", delete).await.unwrap());
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_stream_ids_survive_trim() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let mut last = StreamId::ZERO;
        for i in 0..4 {
            let id = store
                .xadd("s", &[("n".to_string(), i.to_string())], Some(2))
                .await
                .unwrap();
            assert!(id > last);
            last = id;
        }
        assert_eq!(store.xlen("s").await.unwrap(), 2);
        assert_eq!(store.stream_tail("s").await.unwrap(), last);

        let newest = store.xrevrange("s", 10).await.unwrap();
        assert_eq!(newest[0].field("n"), Some("3"));
    }

    #[tokio::test]
    async fn test_blocking_xread_sees_other_connection() {
        let dir = TempDir::new().unwrap();
        let reader = open(&dir);
        let writer = open(&dir);
        let tail = reader.stream_tail("bus:svc:requests").await.unwrap();

        let handle = tokio::spawn(async move {
            reader
                .xread(
                    &[("bus:svc:requests".to_string(), tail)],
                    10,
                    Some(Duration::from_secs(2)),
                )
                .await
                .unwrap()
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        writer
            .xadd("bus:svc:requests", &[("k".to_string(), "v".to_string())], None)
            .await
            .unwrap();

        let entries = handle.await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_pubsub_between_connections() {
        let dir = TempDir::new().unwrap();
        let publisher = open(&dir);
        let listener = open(&dir);

        let sub = listener.subscriber().await.unwrap();
        sub.psubscribe("task:*").await.unwrap();
        sub.subscribe("system:alerts").await.unwrap();

        assert_eq!(publisher.publish("task:1:progress", "p").await.unwrap(), 1);
        assert_eq!(publisher.publish("system:alerts", "a").await.unwrap(), 1);
        assert_eq!(publisher.publish("elsewhere", "x").await.unwrap(), 0);

        let first = sub.next_message(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(first.channel, "task:1:progress");
        assert_eq!(first.pattern.as_deref(), Some("task:*"));
        let second = sub.next_message(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(second.payload, "a");
        assert!(sub.next_message(Duration::from_millis(50)).await.unwrap().is_none());
    }

    fn count_rows(store: &SqliteStore, table: &str) -> i64 {
        let conn = lock_conn(&store.conn).unwrap();
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
            .unwrap()
    }

    #[tokio::test]
    async fn test_publish_sweeps_expired_keys() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.set("short", "v", Some(Duration::from_millis(20))).await.unwrap();
        store.set("kept", "v", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count_rows(&store, "kv"), 2);

        store.publish("system:alerts", "{}").await.unwrap();
        assert_eq!(count_rows(&store, "kv"), 1);
        assert_eq!(store.get("kept").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_stale_subscriber_swept_and_reregistered() {
        let dir = TempDir::new().unwrap();
        let mut config = SqliteStoreConfig::new(dir.path().join("store.db"));
        config.subscriber_liveness = Duration::from_millis(50);
        let store = SqliteStore::with_config(config).unwrap();

        let sub = store.subscriber().await.unwrap();
        sub.subscribe("agent:status").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        store.ping().await.unwrap();
        assert_eq!(count_rows(&store, "pubsub_subscribers"), 0);
        assert_eq!(store.publish("agent:status", "{}").await.unwrap(), 0);

        // Polling refreshes the row with the full subscription set
        sub.next_message(Duration::from_millis(10)).await.unwrap();
        assert_eq!(store.publish("agent:status", "{}").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_hashes() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.hset("agent:a", "status", "busy").await.unwrap();
        assert_eq!(store.hget("agent:a", "status").await.unwrap().as_deref(), Some("busy"));
        assert!(store.exists("agent:a").await.unwrap());
        assert!(store.del("agent:a").await.unwrap());
        assert!(store.hgetall("agent:a").await.unwrap().is_empty());
    }
}
