//! Value types shared by every store backend

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Current wall-clock time in unix milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Identifier of a stream entry: `{ms}-{seq}`
///
/// Ids are strictly increasing within one stream. Ordering compares the
/// millisecond part first, then the sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    /// The id before every real entry
    pub const ZERO: StreamId = StreamId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Next id after `self` given the current clock
    ///
    /// Falls back to bumping the sequence when the clock has not advanced
    /// (or went backwards), keeping ids monotonic.
    pub fn next_after(&self, now_ms: u64) -> Self {
        if now_ms > self.ms {
            Self { ms: now_ms, seq: 0 }
        } else {
            Self {
                ms: self.ms,
                seq: self.seq + 1,
            }
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for StreamId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ms, seq) = s
            .split_once('-')
            .ok_or_else(|| StoreError::InvalidStreamId(s.to_string()))?;
        let ms = ms.parse().map_err(|_| StoreError::InvalidStreamId(s.to_string()))?;
        let seq = seq.parse().map_err(|_| StoreError::InvalidStreamId(s.to_string()))?;
        Ok(Self { ms, seq })
    }
}

/// One entry read from a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEntry {
    pub stream: String,
    pub id: StreamId,
    pub fields: BTreeMap<String, String>,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// A message delivered to a pub/sub subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubSubMessage {
    /// Channel the message was published on
    pub channel: String,
    /// Pattern that matched, for pattern subscriptions
    pub pattern: Option<String>,
    pub payload: String,
}

/// Server-side scripts executed atomically by the store
///
/// Each variant checks the stored value against `expected` and only acts
/// when they are equal. The check and the action are one atomic step, so a
/// key that expired and was re-set by another owner in between is never
/// touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtomicScript {
    /// Delete the key if it still holds `expected`
    CompareAndDelete { expected: String },
    /// Reset the key's TTL if it still holds `expected`
    CompareAndExpire { expected: String, ttl: Duration },
}

impl AtomicScript {
    pub fn expected(&self) -> &str {
        match self {
            AtomicScript::CompareAndDelete { expected } | AtomicScript::CompareAndExpire { expected, .. } => expected,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AtomicScript::CompareAndDelete { .. } => "compare_and_delete",
            AtomicScript::CompareAndExpire { .. } => "compare_and_expire",
        }
    }
}
