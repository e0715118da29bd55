//! Shared fakes for the integration tests: a scriptable in-memory transport
//! and factories that hand it out, so the full connection → subscription →
//! execution stack runs without a network.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};

use digitbot::protocol::ApiError;
use digitbot::transport::{LiveStream, ReadyState, Transport, TransportError, TransportFactory};

/// What the fake does with a `call()` request.
pub enum Scripted {
    Reply(Value),
    /// Never answer; lets timeout paths fire.
    Silent,
}

pub type Responder = dyn Fn(&Value) -> Scripted + Send + Sync;

pub struct FakeTransport {
    pub calls: Mutex<Vec<Value>>,
    pub subscribes: AtomicUsize,
    pub forgets: AtomicUsize,
    pub call_delay: Duration,
    pub subscribe_delay: Duration,
    responder: Box<Responder>,
    /// Queued rejections consumed by successive subscribe attempts.
    subscribe_errors: Mutex<VecDeque<ApiError>>,
    /// Senders for every stream handed out, for tests to push updates into.
    pub streams: Mutex<Vec<mpsc::UnboundedSender<Value>>>,
    /// Message pushed into a contract stream as soon as it opens.
    pub auto_settle: Mutex<Option<Value>>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

pub fn won_settlement(profit: f64) -> Value {
    json!({
        "proposal_open_contract": { "is_sold": 1, "status": "won", "profit": profit }
    })
}

pub fn lost_settlement(stake: f64) -> Value {
    json!({
        "proposal_open_contract": { "is_sold": 1, "status": "lost", "profit": -stake }
    })
}

/// Answers every request the stack makes with a plausible success.
pub fn default_responder(request: &Value) -> Scripted {
    if request.get("authorize").is_some() {
        return Scripted::Reply(json!({
            "authorize": { "loginid": "CR90000000", "currency": "USD", "balance": 1000.0 }
        }));
    }
    if request.get("active_symbols").is_some() {
        return Scripted::Reply(json!({
            "active_symbols": [
                { "symbol": "R_100", "pip": 0.01, "market": "synthetic_index" }
            ]
        }));
    }
    if request.get("proposal").is_some() {
        return Scripted::Reply(json!({
            "proposal": { "id": "quote-1", "ask_price": 1.0, "payout": 1.95 }
        }));
    }
    if request.get("buy").is_some() {
        return Scripted::Reply(json!({
            "buy": { "contract_id": 7001, "buy_price": 1.0 }
        }));
    }
    if request.get("proposal_open_contract").is_some() {
        return Scripted::Reply(won_settlement(0.95));
    }
    Scripted::Reply(json!({}))
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Self::with_responder(Box::new(default_responder))
    }

    pub fn with_responder(responder: Box<Responder>) -> Arc<Self> {
        let (closed_tx, closed_rx) = watch::channel(false);
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            subscribes: AtomicUsize::new(0),
            forgets: AtomicUsize::new(0),
            call_delay: Duration::ZERO,
            subscribe_delay: Duration::ZERO,
            responder,
            subscribe_errors: Mutex::new(VecDeque::new()),
            streams: Mutex::new(Vec::new()),
            auto_settle: Mutex::new(Some(won_settlement(0.95))),
            closed_tx,
            closed_rx,
        })
    }

    pub fn with_delays(call_delay: Duration, subscribe_delay: Duration) -> Arc<Self> {
        let (closed_tx, closed_rx) = watch::channel(false);
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            subscribes: AtomicUsize::new(0),
            forgets: AtomicUsize::new(0),
            call_delay,
            subscribe_delay,
            responder: Box::new(default_responder),
            subscribe_errors: Mutex::new(VecDeque::new()),
            streams: Mutex::new(Vec::new()),
            auto_settle: Mutex::new(Some(won_settlement(0.95))),
            closed_tx,
            closed_rx,
        })
    }

    /// Queue a rejection for the next subscribe attempt.
    pub fn push_subscribe_error(&self, code: &str, message: &str) {
        self.subscribe_errors.lock().unwrap().push_back(ApiError {
            code: code.to_string(),
            message: message.to_string(),
        });
    }

    /// Push a message into every open stream.
    pub fn push_to_streams(&self, msg: Value) {
        let streams = self.streams.lock().unwrap();
        for tx in streams.iter() {
            let _ = tx.send(msg.clone());
        }
    }

    /// Number of `call()` requests containing the given top-level key.
    pub fn count_calls(&self, key: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|req| req.get(key).is_some())
            .count()
    }

    /// Simulate the socket dying.
    pub fn kill(&self) {
        let _ = self.closed_tx.send(true);
        // Drop every live stream so receivers observe the end.
        self.streams.lock().unwrap().clear();
    }
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    async fn call(&self, request: Value) -> Result<Value, TransportError> {
        if *self.closed_rx.borrow() {
            return Err(TransportError::NotConnected);
        }
        self.calls.lock().unwrap().push(request.clone());
        if !self.call_delay.is_zero() {
            tokio::time::sleep(self.call_delay).await;
        }
        match (self.responder)(&request) {
            Scripted::Reply(v) => Ok(v),
            Scripted::Silent => std::future::pending().await,
        }
    }

    async fn subscribe(&self, request: Value) -> Result<LiveStream, TransportError> {
        if *self.closed_rx.borrow() {
            return Err(TransportError::NotConnected);
        }
        if !self.subscribe_delay.is_zero() {
            tokio::time::sleep(self.subscribe_delay).await;
        }
        let n = self.subscribes.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(err) = self.subscribe_errors.lock().unwrap().pop_front() {
            return Err(TransportError::Api(err));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        if request.get("proposal_open_contract").is_some() {
            if let Some(settle) = self.auto_settle.lock().unwrap().clone() {
                let _ = tx.send(settle);
            }
        }
        self.streams.lock().unwrap().push(tx);
        Ok(LiveStream {
            subscription_id: Some(format!("sub-{}", n)),
            updates: rx,
        })
    }

    async fn forget(&self, _subscription_id: &str) -> Result<(), TransportError> {
        self.forgets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn ready_state(&self) -> ReadyState {
        if *self.closed_rx.borrow() {
            ReadyState::Closed
        } else {
            ReadyState::Open
        }
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }

    async fn shutdown(&self) {
        let _ = self.closed_tx.send(true);
    }
}

/// Hands out pre-built transports in order; fails once the script runs dry.
pub struct FakeFactory {
    transports: Mutex<VecDeque<Arc<FakeTransport>>>,
    pub connects: AtomicUsize,
}

impl FakeFactory {
    pub fn new(transports: Vec<Arc<FakeTransport>>) -> Arc<Self> {
        Arc::new(Self {
            transports: Mutex::new(transports.into()),
            connects: AtomicUsize::new(0),
        })
    }
}

#[async_trait::async_trait]
impl TransportFactory for FakeFactory {
    async fn connect(&self) -> Result<Arc<dyn Transport>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        match self.transports.lock().unwrap().pop_front() {
            Some(t) => Ok(t),
            None => Err(TransportError::Handshake("no transport scripted".to_string())),
        }
    }
}

/// Wire a full execution stack around one fake transport.
pub async fn execution_stack(
    transport: Arc<FakeTransport>,
    risk_config: digitbot::risk::RiskConfig,
    call_timeout: Duration,
) -> (
    Arc<digitbot::connection::ConnectionManager>,
    Arc<digitbot::subscription::SubscriptionManager>,
    Arc<digitbot::risk::RiskManager>,
    Arc<digitbot::execution::Executor>,
) {
    use digitbot::connection::{ConnectionManager, ReconnectPolicy};
    use digitbot::events::EventSink;
    use digitbot::execution::Executor;
    use digitbot::risk::RiskManager;
    use digitbot::session::AccountSession;
    use digitbot::subscription::SubscriptionManager;

    let factory = FakeFactory::new(vec![transport.clone()]);
    let connection = ConnectionManager::new(
        factory,
        ReconnectPolicy::default(),
        EventSink::disabled(),
    );
    connection.connect(false).await.expect("fake connect");
    let subscriptions = SubscriptionManager::new(EventSink::disabled());
    subscriptions.set_transport(transport).await;
    let risk = Arc::new(RiskManager::new(risk_config, EventSink::disabled()));
    let executor = Executor::new(
        connection.clone(),
        subscriptions.clone(),
        risk.clone(),
        AccountSession::new(),
        EventSink::disabled(),
        call_timeout,
    );
    (connection, subscriptions, risk, executor)
}

/// A trade request that any strategy could have produced.
pub fn sample_request() -> digitbot::strategy::types::TradeRequest {
    digitbot::strategy::types::TradeRequest {
        contract: digitbot::protocol::ContractKind::DigitEven,
        prediction: None,
        stake: 1.0,
        duration_ticks: 1,
        symbol: "R_100".to_string(),
    }
}

/// A factory whose every connect attempt fails.
pub struct FailingFactory;

#[async_trait::async_trait]
impl TransportFactory for FailingFactory {
    async fn connect(&self) -> Result<Arc<dyn Transport>, TransportError> {
        Err(TransportError::Handshake("connection refused".to_string()))
    }
}
