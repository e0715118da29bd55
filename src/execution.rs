//! Trade execution: quote → accept → monitor-to-settlement, with per-call
//! timeouts and a per-strategy single-flight guard.
//!
//! A timeout or an explicit rejection before the purchase leaves no stake on
//! the table and surfaces as a retriable error. Losing the connection after
//! the purchase was sent is different: the outcome exists server-side but is
//! unknown here, so it surfaces as `Indeterminate` carrying the contract id
//! (when known) for reconciliation after reconnect.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;

use crate::connection::ConnectionManager;
use crate::events::{EventSink, StatusEvent};
use crate::protocol;
use crate::risk::{RiskManager, RiskViolation};
use crate::session::AccountSession;
use crate::strategy::types::{Settlement, TradeRequest};
use crate::subscription::{StreamKey, SubscriptionManager};
use crate::transport::{Transport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStage {
    Quote,
    Accept,
}

impl std::fmt::Display for ExecutionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStage::Quote => write!(f, "quote"),
            ExecutionStage::Accept => write!(f, "accept"),
        }
    }
}

#[derive(Debug)]
pub enum ExecutionError {
    /// Quote or Accept exceeded its timeout; no counters are touched.
    Timeout(ExecutionStage),
    /// The API refused the request (bad parameters, market closed, ...).
    Rejected(String),
    /// The connection died after the purchase may have gone through.
    Indeterminate { contract_id: Option<u64> },
    /// Vetoed by the risk layer before anything was sent.
    Vetoed(RiskViolation),
    /// Another execute() for the same strategy is still in flight.
    Busy,
    Transport(TransportError),
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionError::Timeout(stage) => write!(f, "{} timed out", stage),
            ExecutionError::Rejected(reason) => write!(f, "rejected: {}", reason),
            ExecutionError::Indeterminate { contract_id } => match contract_id {
                Some(id) => write!(f, "settlement indeterminate for contract {}", id),
                None => write!(f, "settlement indeterminate"),
            },
            ExecutionError::Vetoed(v) => write!(f, "vetoed: {}", v),
            ExecutionError::Busy => write!(f, "trade already in flight"),
            ExecutionError::Transport(e) => write!(f, "transport: {}", e),
        }
    }
}

impl std::error::Error for ExecutionError {}

/// Removes the strategy's in-flight marker when the execution ends, however
/// it ends.
struct FlightGuard<'a> {
    map: &'a DashMap<String, ()>,
    key: String,
}

impl<'a> FlightGuard<'a> {
    fn try_acquire(map: &'a DashMap<String, ()>, key: &str) -> Option<Self> {
        match map.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(());
                Some(Self {
                    map,
                    key: key.to_string(),
                })
            }
        }
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

pub struct Executor {
    connection: Arc<ConnectionManager>,
    subscriptions: Arc<SubscriptionManager>,
    risk: Arc<RiskManager>,
    session: Arc<AccountSession>,
    events: EventSink,
    call_timeout: Duration,
    in_flight: DashMap<String, ()>,
}

impl Executor {
    pub fn new(
        connection: Arc<ConnectionManager>,
        subscriptions: Arc<SubscriptionManager>,
        risk: Arc<RiskManager>,
        session: Arc<AccountSession>,
        events: EventSink,
        call_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            connection,
            subscriptions,
            risk,
            session,
            events,
            call_timeout,
            in_flight: DashMap::new(),
        })
    }

    /// Run one trade attempt for a strategy through to settlement.
    pub async fn execute(
        &self,
        strategy_id: &str,
        request: TradeRequest,
    ) -> Result<Settlement, ExecutionError> {
        let _guard =
            FlightGuard::try_acquire(&self.in_flight, strategy_id).ok_or(ExecutionError::Busy)?;

        // Global gates re-checked at dispatch time: a breaker tripped by
        // another strategy's settlement vetoes requests already queued.
        self.risk
            .check_global(request.stake)
            .map_err(ExecutionError::Vetoed)?;

        let generation = self.connection.generation();
        let transport = self
            .connection
            .transport()
            .await
            .map_err(ExecutionError::Transport)?;

        // Quote
        let quote_req = protocol::quote(
            &request.symbol,
            request.contract,
            request.stake,
            &self.session.currency(),
            request.duration_ticks,
            request.prediction,
        );
        let response = self
            .timed_call(&transport, quote_req, ExecutionStage::Quote, generation)
            .await?;
        if let Some(err) = protocol::api_error(&response) {
            return Err(ExecutionError::Rejected(err.message));
        }
        let quote = protocol::parse_quote(&response)
            .ok_or_else(|| ExecutionError::Rejected("malformed quote response".to_string()))?;

        // Accept
        let response = self
            .timed_call(
                &transport,
                protocol::accept(&quote.id, quote.ask_price),
                ExecutionStage::Accept,
                generation,
            )
            .await?;
        if let Some(err) = protocol::api_error(&response) {
            return Err(ExecutionError::Rejected(err.message));
        }
        let accepted = protocol::parse_accept(&response)
            .ok_or(ExecutionError::Indeterminate { contract_id: None })?;

        self.events.emit(StatusEvent::TradeOpened {
            strategy_id: strategy_id.to_string(),
            contract_id: accepted.contract_id,
            stake: request.stake,
        });

        // Monitor until settlement.
        self.monitor_contract(accepted.contract_id).await
    }

    async fn timed_call(
        &self,
        transport: &Arc<dyn Transport>,
        request: Value,
        stage: ExecutionStage,
        generation: u64,
    ) -> Result<Value, ExecutionError> {
        match tokio::time::timeout(self.call_timeout, transport.call(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                // A response lost to a dead socket after the accept was sent
                // may have been a successful purchase.
                if stage == ExecutionStage::Accept && self.connection.generation() != generation {
                    Err(ExecutionError::Indeterminate { contract_id: None })
                } else if stage == ExecutionStage::Accept
                    && matches!(e, TransportError::ConnectionClosed)
                {
                    Err(ExecutionError::Indeterminate { contract_id: None })
                } else {
                    Err(ExecutionError::Transport(e))
                }
            }
            Err(_) => Err(ExecutionError::Timeout(stage)),
        }
    }

    /// Subscribe to one contract's updates and wait for `is_sold`.
    /// Unsubscribes exactly once on every exit path.
    async fn monitor_contract(&self, contract_id: u64) -> Result<Settlement, ExecutionError> {
        let key = StreamKey::contract(contract_id);
        let mut handle = match self.subscriptions.monitor(key.clone()).await {
            Ok(handle) => handle,
            Err(_) => {
                return Err(ExecutionError::Indeterminate {
                    contract_id: Some(contract_id),
                })
            }
        };

        let result = loop {
            match handle.updates.recv().await {
                Some(msg) => {
                    if let Some(err) = protocol::api_error(&msg) {
                        break Err(ExecutionError::Rejected(err.message));
                    }
                    let Some(update) = protocol::parse_contract_update(&msg) else {
                        continue;
                    };
                    if update.is_sold {
                        break Ok(Settlement {
                            contract_id,
                            won: update.status == "won",
                            profit: update.profit,
                        });
                    }
                }
                // Stream ended before settlement: transport died or the
                // registry was reset under us.
                None => {
                    break Err(ExecutionError::Indeterminate {
                        contract_id: Some(contract_id),
                    })
                }
            }
        };

        self.subscriptions.unmonitor(&key, handle.listener_id).await;
        result
    }

    /// Re-query a contract whose outcome was lost to a disconnect. Called
    /// after the connection reopens, before the owning strategy resumes.
    pub async fn reconcile(&self, contract_id: u64) -> Result<Settlement, ExecutionError> {
        // Any connectivity failure here keeps the contract reconcilable on
        // the next reconnect; only an explicit rejection is final.
        let indeterminate = || ExecutionError::Indeterminate {
            contract_id: Some(contract_id),
        };
        let transport = self
            .connection
            .transport()
            .await
            .map_err(|_| indeterminate())?;
        let response = match tokio::time::timeout(
            self.call_timeout,
            transport.call(protocol::open_contract(contract_id, false)),
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(_)) | Err(_) => return Err(indeterminate()),
        };
        if let Some(err) = protocol::api_error(&response) {
            return Err(ExecutionError::Rejected(err.message));
        }
        match protocol::parse_contract_update(&response) {
            Some(update) if update.is_sold => Ok(Settlement {
                contract_id,
                won: update.status == "won",
                profit: update.profit,
            }),
            // Still open: fall back to monitoring it to settlement.
            Some(_) => self.monitor_contract(contract_id).await,
            None => Err(ExecutionError::Indeterminate {
                contract_id: Some(contract_id),
            }),
        }
    }

    /// Whether a strategy currently has a trade in flight (diagnostics).
    pub fn is_executing(&self, strategy_id: &str) -> bool {
        self.in_flight.contains_key(strategy_id)
    }
}
