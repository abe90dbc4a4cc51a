//! Scoped lock handle

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use sharedstore::{AtomicScript, SharedStore};
use tracing::{debug, warn};

use super::error::LockError;

/// A held lock
///
/// Release explicitly with [`LockGuard::release`]. A guard dropped while
/// still held schedules a best-effort release on the current Tokio runtime;
/// otherwise the TTL reclaims the lock.
pub struct LockGuard {
    store: Arc<dyn SharedStore>,
    key: String,
    token: String,
    ttl: Duration,
    released: AtomicBool,
}

impl LockGuard {
    pub(crate) fn new(store: Arc<dyn SharedStore>, key: String, token: String, ttl: Duration) -> Self {
        Self {
            store,
            key,
            token,
            ttl,
            released: AtomicBool::new(false),
        }
    }

    /// Store key of the lock (`lock:{name}`)
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Owner token written on acquisition
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Release the lock if this guard still owns it
    ///
    /// Returns whether a lock was actually removed. Releasing a lock that
    /// expired or now belongs to someone else is a no-op.
    pub async fn release(&self) -> Result<bool, LockError> {
        debug!(key = %self.key, "LockGuard::release: called");
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        let script = AtomicScript::CompareAndDelete {
            expected: self.token.clone(),
        };
        let removed = match self.store.eval(&self.key, script).await {
            Ok(removed) => removed,
            Err(e) => {
                // Still held as far as we know; leave it to a retry or Drop
                self.released.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        if !removed {
            debug!(key = %self.key, "LockGuard::release: lock no longer owned");
        }
        Ok(removed)
    }

    /// Reset the TTL if this guard still owns the lock
    pub async fn extend(&self, ttl: Duration) -> Result<bool, LockError> {
        debug!(key = %self.key, ?ttl, "LockGuard::extend: called");
        if self.released.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let script = AtomicScript::CompareAndExpire {
            expected: self.token.clone(),
            ttl,
        };
        Ok(self.store.eval(&self.key, script).await?)
    }

    /// Whether anyone holds the lock key right now
    pub async fn is_locked(&self) -> Result<bool, LockError> {
        Ok(self.store.exists(&self.key).await?)
    }

    /// Whether the stored token is still ours
    pub async fn owned(&self) -> Result<bool, LockError> {
        if self.released.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let current = self.store.get(&self.key).await?;
        Ok(current.as_deref() == Some(self.token.as_str()))
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released.load(Ordering::SeqCst) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(key = %self.key, "LockGuard dropped outside runtime, leaving to TTL");
            return;
        };
        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let script = AtomicScript::CompareAndDelete {
            expected: std::mem::take(&mut self.token),
        };
        handle.spawn(async move {
            if let Err(e) = store.eval(&key, script).await {
                warn!(%key, error = %e, "Failed to release dropped lock");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sharedstore::{MemoryStore, StoreError, StoreResult, StreamEntry, StreamId, Subscriber};
    use std::collections::HashMap;

    /// Memory store whose `eval` fails while `failing` is set
    struct FlakyStore {
        inner: MemoryStore,
        failing: AtomicBool,
    }

    #[async_trait]
    impl SharedStore for FlakyStore {
        async fn get(&self, key: &str) -> StoreResult<Option<String>> {
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
            self.inner.set(key, value, ttl).await
        }
        async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<bool> {
            self.inner.set_nx(key, value, ttl).await
        }
        async fn del(&self, key: &str) -> StoreResult<bool> {
            self.inner.del(key).await
        }
        async fn exists(&self, key: &str) -> StoreResult<bool> {
            self.inner.exists(key).await
        }
        async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
            self.inner.expire(key, ttl).await
        }
        async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
            self.inner.ttl(key).await
        }
        async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
            self.inner.hset(key, field, value).await
        }
        async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
            self.inner.hget(key, field).await
        }
        async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
            self.inner.hgetall(key).await
        }
        async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
            self.inner.hdel(key, field).await
        }
        async fn xadd(&self, stream: &str, fields: &[(String, String)], max_len: Option<usize>) -> StoreResult<StreamId> {
            self.inner.xadd(stream, fields, max_len).await
        }
        async fn xread(
            &self,
            cursors: &[(String, StreamId)],
            count: usize,
            block: Option<Duration>,
        ) -> StoreResult<Vec<StreamEntry>> {
            self.inner.xread(cursors, count, block).await
        }
        async fn stream_tail(&self, stream: &str) -> StoreResult<StreamId> {
            self.inner.stream_tail(stream).await
        }
        async fn xlen(&self, stream: &str) -> StoreResult<usize> {
            self.inner.xlen(stream).await
        }
        async fn xrevrange(&self, stream: &str, count: usize) -> StoreResult<Vec<StreamEntry>> {
            self.inner.xrevrange(stream, count).await
        }
        async fn publish(&self, channel: &str, payload: &str) -> StoreResult<usize> {
            self.inner.publish(channel, payload).await
        }
        async fn subscriber(&self) -> StoreResult<Arc<dyn Subscriber>> {
            self.inner.subscriber().await
        }
        async fn eval(&self, key: &str, script: AtomicScript) -> StoreResult<bool> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("connection reset".to_string()));
            }
            self.inner.eval(key, script).await
        }
        async fn ping(&self) -> StoreResult<()> {
            self.inner.ping().await
        }
    }

    async fn held_guard(store: &Arc<FlakyStore>) -> LockGuard {
        store.set("lock:job", "tok", Some(Duration::from_secs(300))).await.unwrap();
        LockGuard::new(store.clone(), "lock:job".to_string(), "tok".to_string(), Duration::from_secs(300))
    }

    #[tokio::test]
    async fn test_release_retries_after_store_error() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failing: AtomicBool::new(true),
        });
        let guard = held_guard(&store).await;

        assert!(guard.release().await.is_err());
        assert!(guard.owned().await.unwrap());

        store.failing.store(false, Ordering::SeqCst);
        assert!(guard.release().await.unwrap());
        assert!(!store.exists("lock:job").await.unwrap());
    }

    #[tokio::test]
    async fn test_drop_releases_after_failed_release() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failing: AtomicBool::new(true),
        });
        let guard = held_guard(&store).await;
        assert!(guard.release().await.is_err());

        store.failing.store(false, Ordering::SeqCst);
        drop(guard);
        for _ in 0..40 {
            if !store.exists("lock:job").await.unwrap() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("lock still held after drop");
    }
}
