//! Subscription registry: one live remote stream per key, however many local
//! listeners attach to it.
//!
//! Repeated `monitor` calls for the same key share the existing stream
//! instead of issuing redundant network subscribes; concurrent first calls
//! collapse into a single subscribe via a pending-entry waiter queue. The
//! last `unmonitor` sends exactly one forget.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::events::{EventSink, StatusEvent};
use crate::protocol;
use crate::transport::{Transport, TransportError};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Ticks,
    Balance,
    Contract,
}

impl StreamKind {
    /// Stream-type label understood by the API's bulk forget.
    fn forget_all_type(&self) -> &'static str {
        match self {
            StreamKind::Ticks => "ticks",
            StreamKind::Balance => "balance",
            StreamKind::Contract => "proposal_open_contract",
        }
    }
}

/// Logical stream identity: kind plus instrument symbol or contract id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub kind: StreamKind,
    pub target: String,
}

impl StreamKey {
    pub fn ticks(symbol: &str) -> Self {
        Self {
            kind: StreamKind::Ticks,
            target: symbol.to_string(),
        }
    }

    pub fn balance() -> Self {
        Self {
            kind: StreamKind::Balance,
            target: String::new(),
        }
    }

    pub fn contract(contract_id: u64) -> Self {
        Self {
            kind: StreamKind::Contract,
            target: contract_id.to_string(),
        }
    }

    fn subscribe_request(&self) -> Value {
        match self.kind {
            StreamKind::Ticks => protocol::tick_stream(&self.target),
            StreamKind::Balance => protocol::balance_stream(),
            StreamKind::Contract => {
                let id = self.target.parse::<u64>().unwrap_or(0);
                protocol::open_contract(id, true)
            }
        }
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            StreamKind::Ticks => write!(f, "ticks:{}", self.target),
            StreamKind::Balance => write!(f, "balance"),
            StreamKind::Contract => write!(f, "contract:{}", self.target),
        }
    }
}

#[derive(Debug)]
pub enum SubscriptionError {
    NoTransport,
    Transport(TransportError),
    Rejected { code: String, message: String },
}

impl std::fmt::Display for SubscriptionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionError::NoTransport => write!(f, "no transport attached"),
            SubscriptionError::Transport(e) => write!(f, "transport failure: {}", e),
            SubscriptionError::Rejected { code, message } => {
                write!(f, "subscribe rejected ({}): {}", code, message)
            }
        }
    }
}

impl std::error::Error for SubscriptionError {}

type Listeners = Arc<DashMap<u64, mpsc::UnboundedSender<Value>>>;

struct ActiveStream {
    remote_id: Option<String>,
    listeners: Listeners,
    router: JoinHandle<()>,
}

enum StreamState {
    /// Subscribe in flight; queued callers wait for the outcome.
    Pending(Vec<oneshot::Sender<Result<(), String>>>),
    Active(ActiveStream),
}

/// Handle returned by `monitor`; identifies the listener for `unmonitor`.
pub struct StreamHandle {
    pub key: StreamKey,
    pub listener_id: u64,
    pub updates: mpsc::UnboundedReceiver<Value>,
}

pub struct SubscriptionManager {
    transport: Mutex<Option<Arc<dyn Transport>>>,
    streams: Mutex<HashMap<StreamKey, StreamState>>,
    listener_seq: AtomicU64,
    events: EventSink,
}

impl SubscriptionManager {
    pub fn new(events: EventSink) -> Arc<Self> {
        Arc::new(Self {
            transport: Mutex::new(None),
            streams: Mutex::new(HashMap::new()),
            listener_seq: AtomicU64::new(1),
            events,
        })
    }

    /// Swap in a (re)connected transport. All local stream state is dropped;
    /// callers re-monitor what they need once the connection is usable.
    pub async fn set_transport(&self, transport: Arc<dyn Transport>) {
        let mut streams = self.streams.lock().await;
        for (_, state) in streams.drain() {
            if let StreamState::Active(active) = state {
                active.router.abort();
            }
        }
        *self.transport.lock().await = Some(transport);
    }

    async fn current_transport(&self) -> Result<Arc<dyn Transport>, SubscriptionError> {
        self.transport
            .lock()
            .await
            .clone()
            .ok_or(SubscriptionError::NoTransport)
    }

    /// Attach a listener to the stream for `key`, subscribing remotely only
    /// if this is the first listener.
    pub async fn monitor(&self, key: StreamKey) -> Result<StreamHandle, SubscriptionError> {
        loop {
            let waiter = {
                let mut streams = self.streams.lock().await;
                match streams.get_mut(&key) {
                    Some(StreamState::Active(active)) => {
                        // Dedup hit: attach locally, no network call.
                        return Ok(self.attach_listener(&key, &active.listeners));
                    }
                    Some(StreamState::Pending(waiters)) => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        Some(rx)
                    }
                    None => {
                        streams.insert(key.clone(), StreamState::Pending(Vec::new()));
                        None
                    }
                }
            };

            match waiter {
                Some(rx) => {
                    match rx.await {
                        Ok(Ok(())) => continue, // stream is Active now, attach on next pass
                        Ok(Err(message)) => {
                            return Err(SubscriptionError::Rejected {
                                code: "SubscribeFailed".to_string(),
                                message,
                            });
                        }
                        Err(_) => continue, // owner vanished; retry from scratch
                    }
                }
                None => return self.open_stream(&key).await,
            }
        }
    }

    /// Perform the single network subscribe for a key this caller claimed.
    async fn open_stream(&self, key: &StreamKey) -> Result<StreamHandle, SubscriptionError> {
        let result = self.subscribe_remote(key).await;

        let mut streams = self.streams.lock().await;
        let waiters = match streams.remove(key) {
            Some(StreamState::Pending(waiters)) => waiters,
            // set_transport() wiped the registry while we were subscribing;
            // report failure and let callers re-monitor.
            _ => Vec::new(),
        };

        match result {
            Ok(stream) => {
                let listeners: Listeners = Arc::new(DashMap::new());
                // Attach before the router starts so the stream's first
                // message cannot slip past an empty listener set.
                let handle = self.attach_listener(key, &listeners);
                let router = Self::spawn_router(stream.updates, listeners.clone());
                let active = ActiveStream {
                    remote_id: stream.subscription_id,
                    listeners,
                    router,
                };
                streams.insert(key.clone(), StreamState::Active(active));
                for waiter in waiters {
                    let _ = waiter.send(Ok(()));
                }
                Ok(handle)
            }
            Err(e) => {
                let message = e.to_string();
                for waiter in waiters {
                    let _ = waiter.send(Err(message.clone()));
                }
                Err(e)
            }
        }
    }

    async fn subscribe_remote(
        &self,
        key: &StreamKey,
    ) -> Result<crate::transport::LiveStream, SubscriptionError> {
        let transport = self.current_transport().await?;
        match transport.subscribe(key.subscribe_request()).await {
            Ok(stream) => Ok(stream),
            Err(TransportError::Api(err)) if protocol::is_already_subscribed(&err) => {
                // Benign: the remote end already carries this stream, most
                // likely orphaned across a reconnect race. Clear the remote
                // side for this stream type and retry once.
                self.events.emit(StatusEvent::DuplicateSubscribeAbsorbed {
                    key: key.to_string(),
                });
                let _ = transport
                    .call(protocol::forget_all(key.kind.forget_all_type()))
                    .await;
                transport
                    .subscribe(key.subscribe_request())
                    .await
                    .map_err(|e| match e {
                        TransportError::Api(err) => SubscriptionError::Rejected {
                            code: err.code,
                            message: err.message,
                        },
                        other => SubscriptionError::Transport(other),
                    })
            }
            Err(TransportError::Api(err)) => Err(SubscriptionError::Rejected {
                code: err.code,
                message: err.message,
            }),
            Err(other) => Err(SubscriptionError::Transport(other)),
        }
    }

    fn attach_listener(&self, key: &StreamKey, listeners: &Listeners) -> StreamHandle {
        let listener_id = self.listener_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        listeners.insert(listener_id, tx);
        StreamHandle {
            key: key.clone(),
            listener_id,
            updates: rx,
        }
    }

    fn spawn_router(
        mut updates: mpsc::UnboundedReceiver<Value>,
        listeners: Listeners,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(msg) = updates.recv().await {
                let mut gone = Vec::new();
                for entry in listeners.iter() {
                    if entry.value().send(msg.clone()).is_err() {
                        gone.push(*entry.key());
                    }
                }
                for id in gone {
                    listeners.remove(&id);
                }
            }
            // Upstream ended (socket died or the registry was reset): drop
            // every listener sender so consumers observe end-of-stream.
            listeners.clear();
        })
    }

    /// Detach a listener. Removing the last listener for a key tears the
    /// remote subscription down with exactly one forget.
    pub async fn unmonitor(&self, key: &StreamKey, listener_id: u64) {
        let forget_id = {
            let mut streams = self.streams.lock().await;
            let Some(StreamState::Active(active)) = streams.get_mut(key) else {
                return;
            };
            active.listeners.remove(&listener_id);
            if !active.listeners.is_empty() {
                return;
            }
            match streams.remove(key) {
                Some(StreamState::Active(active)) => {
                    active.router.abort();
                    active.remote_id
                }
                _ => None,
            }
        };
        if let Some(remote_id) = forget_id {
            if let Ok(transport) = self.current_transport().await {
                let _ = transport.forget(&remote_id).await;
            }
        }
    }

    /// Number of live local listeners for a key (diagnostics and tests).
    pub async fn listener_count(&self, key: &StreamKey) -> usize {
        let streams = self.streams.lock().await;
        match streams.get(key) {
            Some(StreamState::Active(active)) => active.listeners.len(),
            _ => 0,
        }
    }
}
