//! Connection lifecycle: one live transport at a time, exponential-backoff
//! reconnection, and status events for the supervision loop.
//!
//! The manager only restores the socket. Re-authorization and resubscription
//! are performed by whoever observes `ConnectionOpened` — the manager has no
//! knowledge of what was subscribed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::events::{EventSink, StatusEvent};
use crate::transport::{ReadyState, Transport, TransportError, TransportFactory};

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempts` (0-based), or `None` once
    /// the attempt budget is spent. Doubles from the base, capped at the max:
    /// 1000, 2000, 4000, 8000, 10000.
    pub fn backoff_delay(&self, attempts: u32) -> Option<Duration> {
        if attempts >= self.max_attempts {
            return None;
        }
        let factor = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
        let delay = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Some(Duration::from_millis(delay))
    }
}

struct ConnState {
    transport: Option<Arc<dyn Transport>>,
    attempts: u32,
    reconnect_pending: bool,
    close_watcher: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    terminated: bool,
}

pub struct ConnectionManager {
    factory: Arc<dyn TransportFactory>,
    policy: ReconnectPolicy,
    events: EventSink,
    state: Mutex<ConnState>,
    generation: AtomicU64,
}

impl ConnectionManager {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        policy: ReconnectPolicy,
        events: EventSink,
    ) -> Arc<Self> {
        Arc::new(Self {
            factory,
            policy,
            events,
            state: Mutex::new(ConnState {
                transport: None,
                attempts: 0,
                reconnect_pending: false,
                close_watcher: None,
                reconnect_timer: None,
                terminated: false,
            }),
            generation: AtomicU64::new(0),
        })
    }

    /// Monotonic id of the current transport. Responses captured under an
    /// older generation belong to a dead socket and must be discarded.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub async fn transport(&self) -> Result<Arc<dyn Transport>, TransportError> {
        let state = self.state.lock().await;
        match &state.transport {
            Some(t) if t.ready_state() == ReadyState::Open => Ok(t.clone()),
            _ => Err(TransportError::NotConnected),
        }
    }

    pub async fn is_open(&self) -> bool {
        let state = self.state.lock().await;
        matches!(&state.transport, Some(t) if t.ready_state() == ReadyState::Open)
    }

    /// Establish the connection. Idempotent while a live open transport
    /// exists and `force` is false; with `force`, the old handle is torn down
    /// first and replaced.
    pub async fn connect(self: &Arc<Self>, force: bool) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock().await;
            if state.terminated {
                return Err(TransportError::NotConnected);
            }
            if !force {
                if let Some(t) = &state.transport {
                    if t.ready_state() == ReadyState::Open {
                        return Ok(());
                    }
                }
            }
            Self::teardown_transport(&mut state).await;
        }

        match self.factory.connect().await {
            Ok(transport) => {
                let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
                let mut state = self.state.lock().await;
                // A successful open fully resets backoff state.
                state.attempts = 0;
                state.reconnect_pending = false;
                if let Some(timer) = state.reconnect_timer.take() {
                    timer.abort();
                }
                state.close_watcher = Some(self.spawn_close_watcher(transport.clone()));
                state.transport = Some(transport);
                drop(state);
                self.events.emit(StatusEvent::ConnectionOpened { generation });
                Ok(())
            }
            Err(e) => {
                self.reconnect_if_not_connected().await;
                Err(e)
            }
        }
    }

    /// Boxed-future wrapper around `connect`, used by the reconnect timer task.
    /// Returning a concrete `Pin<Box<dyn Future + Send>>` here breaks the
    /// opaque-type `Send` inference cycle between `connect` and
    /// `reconnect_if_not_connected` (which spawns a task that calls back into
    /// `connect`). Behaviorally identical to `connect`.
    fn connect_boxed(
        self: &Arc<Self>,
        force: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), TransportError>> + Send>>
    {
        let this = Arc::clone(self);
        Box::pin(async move { this.connect(force).await })
    }

    /// Tear down the current transport without scheduling a reconnect. The
    /// manager stays usable; a later `connect` starts fresh.
    pub async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        if let Some(timer) = state.reconnect_timer.take() {
            timer.abort();
        }
        state.reconnect_pending = false;
        Self::teardown_transport(&mut state).await;
    }

    /// Tear everything down; no reconnect will follow.
    pub async fn terminate(&self) {
        let mut state = self.state.lock().await;
        state.terminated = true;
        if let Some(timer) = state.reconnect_timer.take() {
            timer.abort();
        }
        Self::teardown_transport(&mut state).await;
    }

    async fn teardown_transport(state: &mut ConnState) {
        if let Some(watcher) = state.close_watcher.take() {
            watcher.abort();
        }
        if let Some(old) = state.transport.take() {
            old.shutdown().await;
        }
    }

    fn spawn_close_watcher(self: &Arc<Self>, transport: Arc<dyn Transport>) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let mut closed = transport.closed();
        tokio::spawn(async move {
            loop {
                if *closed.borrow() {
                    break;
                }
                if closed.changed().await.is_err() {
                    break;
                }
            }
            if let Some(manager) = manager.upgrade() {
                manager.events.emit(StatusEvent::ConnectionClosed);
                manager.reconnect_if_not_connected().await;
            }
        })
    }

    /// Schedule a reconnect unless one is already pending or the transport
    /// recovered in the meantime. Exhausting the attempt budget is terminal:
    /// it emits `ReconnectExhausted` and schedules nothing further.
    pub async fn reconnect_if_not_connected(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        if state.terminated || state.reconnect_pending {
            return;
        }
        if let Some(t) = &state.transport {
            if t.ready_state() == ReadyState::Open {
                return;
            }
        }
        let attempt = state.attempts;
        let Some(delay) = self.policy.backoff_delay(attempt) else {
            drop(state);
            self.events.emit(StatusEvent::ReconnectExhausted {
                attempts: attempt,
            });
            return;
        };
        state.attempts += 1;
        state.reconnect_pending = true;

        let manager = Arc::downgrade(self);
        state.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(manager) = manager.upgrade() else {
                return;
            };
            {
                let mut state = manager.state.lock().await;
                state.reconnect_pending = false;
                state.reconnect_timer = None;
            }
            let _ = manager.connect_boxed(true).await;
        }));
        drop(state);
        self.events.emit(StatusEvent::ReconnectScheduled {
            attempt: attempt + 1,
            delay_ms: delay.as_millis() as u64,
        });
    }
}
