//! Pub/Sub manager implementation

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sharedstore::{PubSubMessage, SharedStore, StoreError, Subscriber};
use tokio::sync::{Mutex, Notify, RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::messages::{
    AgentStatus, Message, MessageKind, SystemAlert, TaskProgress, TaskRequest, TaskResponse, TaskStatus,
    UserNotification,
};

use super::channels;
use super::config::PubSubConfig;

/// A decoded message handed to a handler
#[derive(Debug, Clone)]
pub struct Delivery {
    pub channel: String,
    /// Pattern that routed the message, for pattern subscriptions
    pub pattern: Option<String>,
    pub message: Message,
}

pub type PubSubHandler = Arc<dyn Fn(Delivery) -> BoxFuture<'static, eyre::Result<()>> + Send + Sync>;

/// Wrap an async closure as a [`PubSubHandler`]
pub fn handler<F, Fut>(f: F) -> PubSubHandler
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = eyre::Result<()>> + Send + 'static,
{
    Arc::new(move |delivery: Delivery| f(delivery).boxed())
}

/// Counters for the poll loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubSubStats {
    pub received: u64,
    pub dispatched: u64,
    pub decode_errors: u64,
    pub handler_errors: u64,
    /// Messages that arrived with no handler registered for their route
    pub unroutable: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    dispatched: AtomicU64,
    decode_errors: AtomicU64,
    handler_errors: AtomicU64,
    unroutable: AtomicU64,
}

#[derive(Default)]
struct Routes {
    channels: HashMap<String, Vec<PubSubHandler>>,
    patterns: HashMap<String, Vec<PubSubHandler>>,
}

impl Routes {
    fn table(&mut self, pattern: bool) -> &mut HashMap<String, Vec<PubSubHandler>> {
        if pattern { &mut self.patterns } else { &mut self.channels }
    }
}

struct Inner {
    store: Arc<dyn SharedStore>,
    subscriber: Arc<dyn Subscriber>,
    source: String,
    config: PubSubConfig,
    routes: RwLock<Routes>,
    counters: Counters,
}

impl Inner {
    async fn dispatch(&self, raw: PubSubMessage) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        let handlers = {
            let routes = self.routes.read().await;
            match &raw.pattern {
                Some(pattern) => routes.patterns.get(pattern).cloned(),
                None => routes.channels.get(&raw.channel).cloned(),
            }
            .unwrap_or_default()
        };
        if handlers.is_empty() {
            debug!(channel = %raw.channel, pattern = ?raw.pattern, "No handler for message, dropping");
            self.counters.unroutable.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let message = match Message::from_json(&raw.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(channel = %raw.channel, error = %e, "Failed to decode pub/sub payload");
                self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let delivery = Delivery {
            channel: raw.channel,
            pattern: raw.pattern,
            message,
        };
        for h in handlers {
            let fut = AssertUnwindSafe(async { h(delivery.clone()).await }).catch_unwind();
            match fut.await {
                Ok(Ok(())) => {
                    self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    warn!(channel = %delivery.channel, error = %e, "Pub/sub handler failed");
                    self.counters.handler_errors.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    error!(channel = %delivery.channel, "Pub/sub handler panicked");
                    self.counters.handler_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    async fn run(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) {
        info!(source = %self.source, "Pub/sub poll loop started");
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                result = self.subscriber.next_message(self.config.poll_timeout()) => match result {
                    Ok(Some(raw)) => self.dispatch(raw).await,
                    Ok(None) => {}
                    Err(e) => {
                        warn!(error = %e, "Pub/sub poll failed");
                        tokio::time::sleep(self.config.error_backoff()).await;
                    }
                },
            }
        }
        info!(source = %self.source, "Pub/sub poll loop stopped");
    }
}

/// Cooperative cancellation signal for one task
///
/// Set when a cancellation arrives on the task's control channel. Long
/// running work checks it between iterations.
#[derive(Clone, Default)]
pub struct CancellationFlag {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Wait until the flag is set
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Channel subscriptions with per-route handlers and a background poll loop
pub struct PubSubManager {
    inner: Arc<Inner>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PubSubManager {
    /// Open a subscriber connection on `store`
    ///
    /// `source` is stamped on messages built by the typed publish helpers.
    pub async fn new(
        store: Arc<dyn SharedStore>,
        source: impl Into<String>,
        config: PubSubConfig,
    ) -> Result<Self, StoreError> {
        let source = source.into();
        debug!(%source, ?config, "PubSubManager::new: called");
        let subscriber = store.subscriber().await?;
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                subscriber,
                source,
                config,
                routes: RwLock::new(Routes::default()),
                counters: Counters::default(),
            }),
            shutdown_tx: Mutex::new(None),
            task: Mutex::new(None),
        })
    }

    /// Start the poll loop; a no-op when already running
    pub async fn start(&self) {
        debug!(source = %self.inner.source, "PubSubManager::start: called");
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        *self.shutdown_tx.lock().await = Some(shutdown_tx);
        *task = Some(tokio::spawn(self.inner.clone().run(shutdown_rx)));
    }

    /// Stop the poll loop and wait for it to exit
    pub async fn stop(&self) {
        debug!(source = %self.inner.source, "PubSubManager::stop: called");
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(()).await;
        }
        if let Some(task) = self.task.lock().await.take()
            && let Err(e) = task.await
        {
            warn!(error = %e, "Pub/sub poll loop ended abnormally");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.task.lock().await.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Register `handler` for an exact channel, or a glob pattern when `pattern` is set
    pub async fn subscribe(&self, channel_or_pattern: &str, handler: PubSubHandler, pattern: bool) -> Result<(), StoreError> {
        debug!(%channel_or_pattern, pattern, "PubSubManager::subscribe: called");
        let first = {
            let mut routes = self.inner.routes.write().await;
            let entry = routes.table(pattern).entry(channel_or_pattern.to_string()).or_default();
            entry.push(handler);
            entry.len() == 1
        };
        if first {
            let subscribed = if pattern {
                self.inner.subscriber.psubscribe(channel_or_pattern).await
            } else {
                self.inner.subscriber.subscribe(channel_or_pattern).await
            };
            if let Err(e) = subscribed {
                self.inner.routes.write().await.table(pattern).remove(channel_or_pattern);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Drop every handler for a channel or pattern
    pub async fn unsubscribe(&self, channel_or_pattern: &str, pattern: bool) -> Result<(), StoreError> {
        debug!(%channel_or_pattern, pattern, "PubSubManager::unsubscribe: called");
        let removed = self
            .inner
            .routes
            .write()
            .await
            .table(pattern)
            .remove(channel_or_pattern)
            .is_some();
        if removed {
            if pattern {
                self.inner.subscriber.punsubscribe(channel_or_pattern).await?;
            } else {
                self.inner.subscriber.unsubscribe(channel_or_pattern).await?;
            }
        }
        Ok(())
    }

    /// Channels and patterns with at least one handler, sorted
    pub async fn subscriptions(&self) -> Vec<(String, bool)> {
        let routes = self.inner.routes.read().await;
        let mut out: Vec<(String, bool)> = routes
            .channels
            .keys()
            .map(|c| (c.clone(), false))
            .chain(routes.patterns.keys().map(|p| (p.clone(), true)))
            .collect();
        out.sort();
        out
    }

    /// Publish a message; returns how many subscriptions received it
    pub async fn publish(&self, channel: &str, message: &Message) -> Result<usize, StoreError> {
        debug!(%channel, message_type = %message.message_type(), "PubSubManager::publish: called");
        let payload = message.to_json()?;
        self.inner.store.publish(channel, &payload).await
    }

    fn envelope(&self, kind: MessageKind) -> Message {
        Message::new(self.inner.source.clone(), kind)
    }

    // === Typed helpers ===

    pub async fn publish_task_request(&self, request: TaskRequest) -> Result<usize, StoreError> {
        let message = self.envelope(MessageKind::TaskRequest(request));
        self.publish(channels::TASK_REQUESTS, &message).await
    }

    pub async fn publish_task_response(&self, response: TaskResponse) -> Result<usize, StoreError> {
        let message = self.envelope(MessageKind::TaskResponse(response));
        self.publish(channels::TASK_RESPONSES, &message).await
    }

    /// Announce on `agent:status` and on the agent's own event channel
    pub async fn publish_agent_status(&self, status: AgentStatus) -> Result<usize, StoreError> {
        let agent_channel = channels::agent_events(&status.agent_id);
        let message = self.envelope(MessageKind::AgentStatus(status));
        let mut delivered = self.publish(channels::AGENT_STATUS, &message).await?;
        delivered += self.publish(&agent_channel, &message).await?;
        Ok(delivered)
    }

    pub async fn publish_system_alert(&self, alert: SystemAlert) -> Result<usize, StoreError> {
        let message = self.envelope(MessageKind::SystemAlert(alert));
        self.publish(channels::SYSTEM_ALERTS, &message).await
    }

    pub async fn publish_user_notification(&self, notification: UserNotification) -> Result<usize, StoreError> {
        let message = self.envelope(MessageKind::UserNotification(notification));
        self.publish(channels::USER_NOTIFICATIONS, &message).await
    }

    pub async fn publish_task_progress(&self, progress: TaskProgress) -> Result<usize, StoreError> {
        let channel = channels::task_progress(&progress.task_id);
        let message = self.envelope(MessageKind::TaskProgress(progress));
        self.publish(&channel, &message).await
    }

    /// Ask whoever runs `task_id` to stop
    pub async fn publish_task_cancellation(&self, task_id: &str, reason: &str) -> Result<usize, StoreError> {
        debug!(%task_id, %reason, "PubSubManager::publish_task_cancellation: called");
        let message = self.envelope(MessageKind::TaskResponse(TaskResponse::cancelled(task_id, reason)));
        self.publish(&channels::task_control(task_id), &message).await
    }

    /// Flag that flips when a cancellation for `task_id` arrives
    pub async fn watch_cancellation(&self, task_id: &str) -> Result<CancellationFlag, StoreError> {
        debug!(%task_id, "PubSubManager::watch_cancellation: called");
        let flag = CancellationFlag::new();
        let watched = flag.clone();
        let expected = task_id.to_string();
        let on_control = handler(move |delivery: Delivery| {
            let watched = watched.clone();
            let expected = expected.clone();
            async move {
                if let MessageKind::TaskResponse(resp) = &delivery.message.kind
                    && resp.status == TaskStatus::Cancelled
                    && resp.task_id == expected
                {
                    info!(task_id = %expected, "Task cancellation received");
                    watched.cancel();
                }
                Ok(())
            }
        });
        self.subscribe(&channels::task_control(task_id), on_control, false).await?;
        Ok(flag)
    }

    pub fn stats(&self) -> PubSubStats {
        let c = &self.inner.counters;
        PubSubStats {
            received: c.received.load(Ordering::Relaxed),
            dispatched: c.dispatched.load(Ordering::Relaxed),
            decode_errors: c.decode_errors.load(Ordering::Relaxed),
            handler_errors: c.handler_errors.load(Ordering::Relaxed),
            unroutable: c.unroutable.load(Ordering::Relaxed),
        }
    }
}
