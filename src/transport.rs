//! WebSocket transport: one live socket, request/response correlation and
//! subscription routing.
//!
//! Requests are correlated by a client-assigned `req_id`; streaming
//! subscriptions keep their `req_id` on every message, so a single routing
//! table covers both one-shot calls and long-lived streams. The transport is
//! behind a trait so the connection manager and the tests can swap in fakes.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{self, ApiError};
use crate::utils;

const PING_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ReadyState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            2 => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }
}

#[derive(Debug)]
pub enum TransportError {
    NotConnected,
    ConnectionClosed,
    Handshake(String),
    Send(String),
    Api(ApiError),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::NotConnected => write!(f, "no live connection"),
            TransportError::ConnectionClosed => write!(f, "connection closed"),
            TransportError::Handshake(e) => write!(f, "websocket handshake failed: {}", e),
            TransportError::Send(e) => write!(f, "send failed: {}", e),
            TransportError::Api(e) => write!(f, "api error {}: {}", e.code, e.message),
        }
    }
}

impl std::error::Error for TransportError {}

/// A live server-side stream: the ack already arrived, updates flow on `updates`.
pub struct LiveStream {
    pub subscription_id: Option<String>,
    pub updates: mpsc::UnboundedReceiver<Value>,
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// One request, one response. The response may still carry an `error`
    /// envelope; callers inspect it (a rejected quote is not a transport
    /// failure).
    async fn call(&self, request: Value) -> Result<Value, TransportError>;

    /// Issue a subscribe request and return the stream once acknowledged.
    /// An `error` envelope in the acknowledgment surfaces as
    /// `TransportError::Api`.
    async fn subscribe(&self, request: Value) -> Result<LiveStream, TransportError>;

    async fn forget(&self, subscription_id: &str) -> Result<(), TransportError>;

    fn ready_state(&self) -> ReadyState;

    /// Flips to `true` once, when the socket is gone for good.
    fn closed(&self) -> watch::Receiver<bool>;

    async fn shutdown(&self);
}

/// Creates transports; injected so tests can hand out fakes and the
/// connection manager can rebuild the socket on reconnect.
#[async_trait::async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Transport>, TransportError>;
}

enum Route {
    Call(oneshot::Sender<Value>),
    Stream {
        tx: mpsc::UnboundedSender<Value>,
        ack: Option<oneshot::Sender<Value>>,
    },
}

pub struct WsTransport {
    req_seq: AtomicU64,
    routes: Arc<DashMap<u64, Route>>,
    out_tx: mpsc::UnboundedSender<Message>,
    state: Arc<AtomicU8>,
    closed_tx: Arc<watch::Sender<bool>>,
    closed_rx: watch::Receiver<bool>,
}

impl WsTransport {
    pub async fn connect(endpoint: &str) -> Result<Arc<Self>, TransportError> {
        let (ws, _response) = tokio_tungstenite::connect_async(endpoint)
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        let (mut write, mut read) = ws.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (closed_tx, closed_rx) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);
        let routes: Arc<DashMap<u64, Route>> = Arc::new(DashMap::new());
        let state = Arc::new(AtomicU8::new(1)); // Open

        let transport = Arc::new(Self {
            req_seq: AtomicU64::new(1),
            routes: routes.clone(),
            out_tx: out_tx.clone(),
            state: state.clone(),
            closed_tx: closed_tx.clone(),
            closed_rx,
        });

        // Writer: serializes outbound frames and keeps the socket alive with
        // application-level pings.
        {
            let state = state.clone();
            let closed_tx = closed_tx.clone();
            tokio::spawn(async move {
                let mut ping_tick = utils::interval_secs(PING_INTERVAL_SECS);
                loop {
                    tokio::select! {
                        msg = out_rx.recv() => {
                            let msg = match msg {
                                Some(m) => m,
                                None => break,
                            };
                            if write.send(msg).await.is_err() {
                                break;
                            }
                        }
                        _ = ping_tick.tick() => {
                            let ping = Message::Text(protocol::ping().to_string());
                            if write.send(ping).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                state.store(3, Ordering::Release); // Closed
                let _ = closed_tx.send(true);
            });
        }

        // Reader: routes every inbound message by req_id.
        {
            let routes = routes.clone();
            let out_tx = out_tx.clone();
            let state = state.clone();
            let closed_tx = closed_tx.clone();
            tokio::spawn(async move {
                while let Some(msg) = read.next().await {
                    let text = match msg {
                        Ok(Message::Text(text)) => text,
                        Ok(Message::Ping(payload)) => {
                            let _ = out_tx.send(Message::Pong(payload));
                            continue;
                        }
                        Ok(Message::Close(_)) | Err(_) => break,
                        Ok(_) => continue,
                    };
                    let value: Value = match serde_json::from_str(&text) {
                        Ok(v) => v,
                        Err(_) => continue,
                    };
                    Self::route_message(&routes, value);
                }
                state.store(3, Ordering::Release); // Closed
                // Dropping the routes wakes every waiting caller with a
                // closed-channel error.
                routes.clear();
                let _ = closed_tx.send(true);
            });
        }

        Ok(transport)
    }

    fn route_message(routes: &DashMap<u64, Route>, msg: Value) {
        let Some(req_id) = protocol::req_id(&msg) else {
            return;
        };
        let is_call = match routes.get(&req_id) {
            Some(entry) => matches!(entry.value(), Route::Call(_)),
            None => return,
        };
        if is_call {
            // One response per call: take the route out and resolve it.
            if let Some((_, Route::Call(done))) = routes.remove(&req_id) {
                let _ = done.send(msg);
            }
            return;
        }
        let mut stale = false;
        if let Some(mut entry) = routes.get_mut(&req_id) {
            if let Route::Stream { tx, ack } = entry.value_mut() {
                if let Some(ack) = ack.take() {
                    let _ = ack.send(msg.clone());
                }
                stale = tx.send(msg).is_err();
            }
        }
        if stale {
            // Listener went away without a forget; drop the route.
            routes.remove(&req_id);
        }
    }

    fn next_req_id(&self) -> u64 {
        self.req_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn send_request(&self, mut request: Value, req_id: u64) -> Result<(), TransportError> {
        if self.ready_state() != ReadyState::Open {
            return Err(TransportError::NotConnected);
        }
        request["req_id"] = Value::from(req_id);
        request["passthrough"] = serde_json::json!({ "cid": uuid::Uuid::new_v4().to_string() });
        self.out_tx
            .send(Message::Text(request.to_string()))
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

#[async_trait::async_trait]
impl Transport for WsTransport {
    async fn call(&self, request: Value) -> Result<Value, TransportError> {
        let req_id = self.next_req_id();
        let (done_tx, done_rx) = oneshot::channel();
        self.routes.insert(req_id, Route::Call(done_tx));
        if let Err(e) = self.send_request(request, req_id) {
            self.routes.remove(&req_id);
            return Err(e);
        }
        done_rx.await.map_err(|_| TransportError::ConnectionClosed)
    }

    async fn subscribe(&self, request: Value) -> Result<LiveStream, TransportError> {
        let req_id = self.next_req_id();
        let (tx, rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = oneshot::channel();
        self.routes.insert(
            req_id,
            Route::Stream {
                tx,
                ack: Some(ack_tx),
            },
        );
        if let Err(e) = self.send_request(request, req_id) {
            self.routes.remove(&req_id);
            return Err(e);
        }
        let ack = match ack_rx.await {
            Ok(msg) => msg,
            Err(_) => return Err(TransportError::ConnectionClosed),
        };
        if let Some(err) = protocol::api_error(&ack) {
            self.routes.remove(&req_id);
            return Err(TransportError::Api(err));
        }
        Ok(LiveStream {
            subscription_id: protocol::subscription_id(&ack).map(str::to_string),
            updates: rx,
        })
    }

    async fn forget(&self, subscription_id: &str) -> Result<(), TransportError> {
        let response = self.call(protocol::forget(subscription_id)).await?;
        if let Some(err) = protocol::api_error(&response) {
            return Err(TransportError::Api(err));
        }
        Ok(())
    }

    fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }

    async fn shutdown(&self) {
        self.state.store(2, Ordering::Release); // Closing
        let _ = self.out_tx.send(Message::Close(None));
        // Give the close frame a moment to flush before the handle drops.
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.state.store(3, Ordering::Release);
        let _ = self.closed_tx.send(true);
    }
}

/// Factory for the real WebSocket endpoint.
pub struct WsFactory {
    endpoint: String,
}

impl WsFactory {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait::async_trait]
impl TransportFactory for WsFactory {
    async fn connect(&self) -> Result<Arc<dyn Transport>, TransportError> {
        let transport = WsTransport::connect(&self.endpoint).await?;
        Ok(transport)
    }
}
