//! Lock acquisition

use std::sync::Arc;
use std::time::{Duration, Instant};

use sharedstore::SharedStore;
use tracing::{debug, info};

use super::config::{LockConfig, LockProfile};
use super::error::LockError;
use super::guard::LockGuard;

/// Store key for a lock name
pub fn lock_key(name: &str) -> String {
    format!("lock:{}", name)
}

fn new_token() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// How one acquisition behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub ttl: Duration,
    /// Retry on contention instead of failing immediately
    pub blocking: bool,
    /// Overall wait budget; `None` means bounded by `max_retries` only
    pub timeout: Option<Duration>,
    pub retry_interval: Duration,
    pub max_retries: u32,
}

impl LockOptions {
    /// Options following a configured profile, blocking with no overall timeout
    pub fn from_profile(profile: &LockProfile) -> Self {
        Self {
            ttl: profile.ttl(),
            blocking: true,
            timeout: None,
            retry_interval: profile.retry_interval(),
            max_retries: profile.max_retries,
        }
    }

    /// Fail immediately if the lock is held
    pub fn non_blocking(ttl: Duration) -> Self {
        Self {
            ttl,
            blocking: false,
            timeout: None,
            retry_interval: Duration::ZERO,
            max_retries: 0,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Factory for locks on one store
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn SharedStore>,
    config: LockConfig,
}

impl LockManager {
    pub fn new(store: Arc<dyn SharedStore>, config: LockConfig) -> Self {
        debug!(?config, "LockManager::new: called");
        Self { store, config }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Default blocking options from configuration
    pub fn default_options(&self) -> LockOptions {
        LockOptions::from_profile(&self.config.default)
    }

    /// Acquire `lock:{name}`
    ///
    /// Non-blocking acquisition fails with [`LockError::NotAcquired`] on
    /// contention. Blocking acquisition retries every `retry_interval` and
    /// fails with [`LockError::Timeout`] once `max_retries` or `timeout` is
    /// exhausted, whichever comes first.
    pub async fn acquire(&self, name: &str, options: LockOptions) -> Result<LockGuard, LockError> {
        debug!(%name, ?options, "LockManager::acquire: called");
        let key = lock_key(name);
        let token = new_token();
        let started = Instant::now();
        let deadline = options.timeout.map(|t| started + t);
        let mut retries = 0u32;

        loop {
            if self.store.set_nx(&key, &token, Some(options.ttl)).await? {
                debug!(%key, attempts = retries + 1, "LockManager::acquire: acquired");
                return Ok(LockGuard::new(self.store.clone(), key, token, options.ttl));
            }

            if !options.blocking {
                debug!(%key, "LockManager::acquire: held, not blocking");
                return Err(LockError::NotAcquired(key));
            }

            let now = Instant::now();
            let out_of_time = deadline.is_some_and(|d| now >= d);
            if retries >= options.max_retries || out_of_time {
                info!(%key, retries, waited = ?started.elapsed(), "Lock acquisition timed out");
                return Err(LockError::Timeout {
                    key,
                    waited: started.elapsed(),
                });
            }
            retries += 1;

            let pause = match deadline {
                Some(d) => options.retry_interval.min(d.saturating_duration_since(now)),
                None => options.retry_interval,
            };
            tokio::time::sleep(pause).await;
        }
    }

    /// Single non-blocking attempt; `None` when the lock is held
    pub async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockGuard>, LockError> {
        debug!(%name, ?ttl, "LockManager::try_acquire: called");
        match self.acquire(name, LockOptions::non_blocking(ttl)).await {
            Ok(guard) => Ok(Some(guard)),
            Err(LockError::NotAcquired(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Lock guarding one agent's status record
    pub async fn agent_status_lock(&self, agent_id: &str) -> Result<LockGuard, LockError> {
        debug!(%agent_id, "LockManager::agent_status_lock: called");
        let options = LockOptions::from_profile(&self.config.agent_status);
        self.acquire(&format!("agent_status:{}", agent_id), options).await
    }

    /// Lock guarding one task's execution
    pub async fn task_lock(&self, task_id: &str) -> Result<LockGuard, LockError> {
        debug!(%task_id, "LockManager::task_lock: called");
        let options = LockOptions::from_profile(&self.config.task);
        self.acquire(&format!("task:{}", task_id), options).await
    }

    /// Whether `lock:{name}` is currently held by anyone
    pub async fn is_locked(&self, name: &str) -> Result<bool, LockError> {
        Ok(self.store.exists(&lock_key(name)).await?)
    }

    /// Remaining lifetime of `lock:{name}`
    pub async fn remaining_ttl(&self, name: &str) -> Result<Option<Duration>, LockError> {
        Ok(self.store.ttl(&lock_key(name)).await?)
    }
}
