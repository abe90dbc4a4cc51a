//! Message bus implementation

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sharedstore::{SharedStore, StreamEntry, StreamId};
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::messages::{Message, MessageKind, MessageType};

use super::config::BusConfig;
use super::error::BusError;
use super::{DLQ_STREAM, EVENTS_STREAM, request_stream, response_stream};

/// Stream entry field holding the JSON message
const MESSAGE_FIELD: &str = "message";

/// Request handler; a returned kind is sent back as the reply
pub type BusHandler = Arc<dyn Fn(Message) -> BoxFuture<'static, eyre::Result<Option<MessageKind>>> + Send + Sync>;

/// Wrap an async closure as a [`BusHandler`]
pub fn bus_handler<F, Fut>(f: F) -> BusHandler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = eyre::Result<Option<MessageKind>>> + Send + 'static,
{
    Arc::new(move |message: Message| f(message).boxed())
}

/// An entry diverted to the dead-letter stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Stream the entry was read from
    pub stream: String,
    pub entry_id: String,
    pub payload: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    fn from_entry(entry: &StreamEntry) -> Option<Self> {
        Some(Self {
            stream: entry.field("stream")?.to_string(),
            entry_id: entry.field("entry_id")?.to_string(),
            payload: entry.field("payload").unwrap_or_default().to_string(),
            error: entry.field("error")?.to_string(),
            failed_at: entry.field("failed_at")?.parse().ok()?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    pub requests_sent: u64,
    pub requests_received: u64,
    pub responses_sent: u64,
    pub responses_received: u64,
    pub events_published: u64,
    pub timeouts: u64,
    pub handler_errors: u64,
    /// Requests with no handler for their type
    pub unhandled: u64,
    /// Responses with no matching pending request
    pub unmatched_responses: u64,
    pub dead_lettered: u64,
    pub pending: usize,
}

#[derive(Default)]
struct Counters {
    requests_sent: AtomicU64,
    requests_received: AtomicU64,
    responses_sent: AtomicU64,
    responses_received: AtomicU64,
    events_published: AtomicU64,
    timeouts: AtomicU64,
    handler_errors: AtomicU64,
    unhandled: AtomicU64,
    unmatched_responses: AtomicU64,
    dead_lettered: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Copy)]
enum Role {
    Requests,
    Responses,
}

type PendingMap = HashMap<String, oneshot::Sender<Message>>;

struct Inner {
    store: Arc<dyn SharedStore>,
    service: String,
    config: BusConfig,
    handlers: RwLock<HashMap<MessageType, Vec<BusHandler>>>,
    pending: StdMutex<PendingMap>,
    counters: Counters,
}

/// Removes a pending record when the waiting future ends for any reason
struct PendingGuard<'a> {
    inner: &'a Inner,
    request_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending().remove(&self.request_id);
    }
}

impl Inner {
    fn pending(&self) -> MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn append(&self, stream: &str, message: &Message) -> Result<StreamId, BusError> {
        let payload = message.to_json()?;
        let fields = [(MESSAGE_FIELD.to_string(), payload)];
        Ok(self
            .store
            .xadd(stream, &fields, Some(self.config.stream_max_len))
            .await?)
    }

    async fn send_response(&self, response: &Message) -> Result<StreamId, BusError> {
        let target = response
            .target
            .as_deref()
            .ok_or_else(|| BusError::MissingTarget(response.id.clone()))?;
        let id = self.append(&response_stream(target), response).await?;
        bump(&self.counters.responses_sent);
        Ok(id)
    }

    async fn dead_letter(&self, entry: &StreamEntry, error: &str) {
        warn!(stream = %entry.stream, entry_id = %entry.id, %error, "Diverting message to dead-letter stream");
        let fields = [
            ("stream".to_string(), entry.stream.clone()),
            ("entry_id".to_string(), entry.id.to_string()),
            (
                "payload".to_string(),
                entry.field(MESSAGE_FIELD).unwrap_or_default().to_string(),
            ),
            ("error".to_string(), error.to_string()),
            ("failed_at".to_string(), Utc::now().to_rfc3339()),
        ];
        match self
            .store
            .xadd(DLQ_STREAM, &fields, Some(self.config.stream_max_len))
            .await
        {
            Ok(_) => bump(&self.counters.dead_lettered),
            Err(e) => error!(entry_id = %entry.id, error = %e, "Failed to write dead letter"),
        }
    }

    async fn decode(&self, entry: &StreamEntry) -> Option<Message> {
        let Some(payload) = entry.field(MESSAGE_FIELD) else {
            self.dead_letter(entry, "entry has no message field").await;
            return None;
        };
        match Message::from_json(payload) {
            Ok(message) => Some(message),
            Err(e) => {
                self.dead_letter(entry, &e.to_string()).await;
                None
            }
        }
    }

    async fn handle_request(&self, entry: StreamEntry) {
        let Some(request) = self.decode(&entry).await else {
            return;
        };
        bump(&self.counters.requests_received);
        let message_type = request.message_type();
        debug!(id = %request.id, %message_type, source = %request.source, "Bus request received");

        let handlers = self
            .handlers
            .read()
            .await
            .get(&message_type)
            .cloned()
            .unwrap_or_default();
        if handlers.is_empty() {
            debug!(id = %request.id, %message_type, "No handler registered, ignoring");
            bump(&self.counters.unhandled);
            return;
        }

        for h in handlers {
            let outcome = AssertUnwindSafe(async { h(request.clone()).await })
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(Some(kind))) => {
                    let mut reply = Message::reply(&request, kind);
                    reply.source = self.service.clone();
                    if let Err(e) = self.send_response(&reply).await {
                        warn!(request_id = %request.id, error = %e, "Failed to send reply");
                    }
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    warn!(request_id = %request.id, %message_type, error = %e, "Bus handler failed");
                    bump(&self.counters.handler_errors);
                }
                Err(_) => {
                    error!(request_id = %request.id, %message_type, "Bus handler panicked");
                    bump(&self.counters.handler_errors);
                }
            }
        }
    }

    async fn handle_response(&self, entry: StreamEntry) {
        let Some(response) = self.decode(&entry).await else {
            return;
        };
        bump(&self.counters.responses_received);

        let Some(correlation_id) = response.correlation_id.clone() else {
            debug!(id = %response.id, "Response without correlation id, dropping");
            bump(&self.counters.unmatched_responses);
            return;
        };
        let waiter = self.pending().remove(&correlation_id);
        match waiter {
            Some(tx) => {
                if tx.send(response).is_err() {
                    debug!(%correlation_id, "Requester gave up before reply arrived");
                }
            }
            None => {
                debug!(%correlation_id, "No pending request for response, dropping");
                bump(&self.counters.unmatched_responses);
            }
        }
    }

    async fn read_loop(self: Arc<Self>, stream: String, role: Role, mut cursor: StreamId, mut shutdown_rx: mpsc::Receiver<()>) {
        info!(service = %self.service, %stream, "Bus reader started");
        loop {
            let cursors = [(stream.clone(), cursor)];
            let read = tokio::select! {
                _ = shutdown_rx.recv() => break,
                read = self.store.xread(&cursors, self.config.read_count, Some(self.config.block())) => read,
            };
            match read {
                Ok(entries) => {
                    for entry in entries {
                        cursor = entry.id;
                        match role {
                            Role::Requests => self.handle_request(entry).await,
                            Role::Responses => self.handle_response(entry).await,
                        }
                    }
                }
                Err(e) => {
                    warn!(%stream, error = %e, "Bus read failed");
                    tokio::time::sleep(self.config.error_backoff()).await;
                }
            }
        }
        info!(service = %self.service, %stream, "Bus reader stopped");
    }
}

/// Request/reply and event messaging for one service
pub struct MessageBus {
    inner: Arc<Inner>,
    shutdown: Mutex<Vec<mpsc::Sender<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MessageBus {
    pub fn new(store: Arc<dyn SharedStore>, service: impl Into<String>, config: BusConfig) -> Self {
        let service = service.into();
        debug!(%service, ?config, "MessageBus::new: called");
        Self {
            inner: Arc::new(Inner {
                store,
                service,
                config,
                handlers: RwLock::new(HashMap::new()),
                pending: StdMutex::new(HashMap::new()),
                counters: Counters::default(),
            }),
            shutdown: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn service(&self) -> &str {
        &self.inner.service
    }

    /// Start reading this service's request and response streams
    ///
    /// Only messages appended after this call are seen; history is never
    /// replayed. Calling it again while running does nothing.
    pub async fn start(&self) -> Result<(), BusError> {
        debug!(service = %self.inner.service, "MessageBus::start: called");
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return Ok(());
        }
        let mut shutdown = self.shutdown.lock().await;
        for (stream, role) in [
            (request_stream(&self.inner.service), Role::Requests),
            (response_stream(&self.inner.service), Role::Responses),
        ] {
            let cursor = self.inner.store.stream_tail(&stream).await?;
            let (tx, rx) = mpsc::channel::<()>(1);
            shutdown.push(tx);
            tasks.push(tokio::spawn(self.inner.clone().read_loop(stream, role, cursor, rx)));
        }
        info!(service = %self.inner.service, "Message bus started");
        Ok(())
    }

    /// Stop both readers and wait for them to exit
    pub async fn stop(&self) {
        debug!(service = %self.inner.service, "MessageBus::stop: called");
        for tx in self.shutdown.lock().await.drain(..) {
            let _ = tx.send(()).await;
        }
        for task in self.tasks.lock().await.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Bus reader ended abnormally");
            }
        }
        info!(service = %self.inner.service, "Message bus stopped");
    }

    /// Add a handler for one message type; all handlers for a type run in order
    pub async fn register_handler(&self, message_type: MessageType, handler: BusHandler) {
        debug!(%message_type, "MessageBus::register_handler: called");
        self.inner
            .handlers
            .write()
            .await
            .entry(message_type)
            .or_default()
            .push(handler);
    }

    /// Send `request` to `target` and wait for the correlated reply
    ///
    /// The request is stamped with this service as source and its own id as
    /// correlation id. On timeout the pending record is discarded and a late
    /// reply is dropped when it arrives.
    pub async fn send_request(
        &self,
        target: &str,
        mut request: Message,
        timeout: Option<Duration>,
    ) -> Result<Message, BusError> {
        debug!(%target, id = %request.id, "MessageBus::send_request: called");
        request.correlation_id = Some(request.id.clone());
        request.source = self.inner.service.clone();
        request.target = Some(target.to_string());
        let request_id = request.id.clone();

        let (tx, rx) = oneshot::channel();
        match self.inner.pending().entry(request_id.clone()) {
            Entry::Occupied(_) => {
                warn!(%request_id, "Rejecting request id already in flight");
                return Err(BusError::DuplicateRequest(request_id));
            }
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }
        let _guard = PendingGuard {
            inner: &self.inner,
            request_id: request_id.clone(),
        };

        self.inner.append(&request_stream(target), &request).await?;
        bump(&self.inner.counters.requests_sent);

        let after = timeout.unwrap_or_else(|| self.inner.config.request_timeout());
        match tokio::time::timeout(after, rx).await {
            Ok(Ok(response)) => {
                debug!(%request_id, "MessageBus::send_request: reply received");
                Ok(response)
            }
            Ok(Err(_)) => Err(BusError::Abandoned(request_id)),
            Err(_) => {
                warn!(%request_id, %target, ?after, "Request timed out");
                bump(&self.inner.counters.timeouts);
                Err(BusError::Timeout { request_id, after })
            }
        }
    }

    /// Append a response to its target's response stream
    pub async fn send_response(&self, response: &Message) -> Result<StreamId, BusError> {
        debug!(id = %response.id, target = ?response.target, "MessageBus::send_response: called");
        self.inner.send_response(response).await
    }

    /// Append to the shared event stream
    pub async fn publish_event(&self, event: &Message) -> Result<StreamId, BusError> {
        debug!(id = %event.id, message_type = %event.message_type(), "MessageBus::publish_event: called");
        let id = self.inner.append(EVENTS_STREAM, event).await?;
        bump(&self.inner.counters.events_published);
        Ok(id)
    }

    /// Newest events first; undecodable entries are skipped
    pub async fn recent_events(&self, count: usize) -> Result<Vec<Message>, BusError> {
        let entries = self.inner.store.xrevrange(EVENTS_STREAM, count).await?;
        Ok(entries
            .iter()
            .filter_map(|e| e.field(MESSAGE_FIELD))
            .filter_map(|payload| Message::from_json(payload).ok())
            .collect())
    }

    /// Newest dead letters first
    pub async fn dead_letters(&self, count: usize) -> Result<Vec<DeadLetter>, BusError> {
        let entries = self.inner.store.xrevrange(DLQ_STREAM, count).await?;
        Ok(entries.iter().filter_map(DeadLetter::from_entry).collect())
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending().len()
    }

    pub fn stats(&self) -> BusStats {
        let c = &self.inner.counters;
        BusStats {
            requests_sent: c.requests_sent.load(Ordering::Relaxed),
            requests_received: c.requests_received.load(Ordering::Relaxed),
            responses_sent: c.responses_sent.load(Ordering::Relaxed),
            responses_received: c.responses_received.load(Ordering::Relaxed),
            events_published: c.events_published.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            handler_errors: c.handler_errors.load(Ordering::Relaxed),
            unhandled: c.unhandled.load(Ordering::Relaxed),
            unmatched_responses: c.unmatched_responses.load(Ordering::Relaxed),
            dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
            pending: self.pending_count(),
        }
    }
}
