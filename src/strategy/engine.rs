//! Strategy engine: the single loop through which every tick, settlement and
//! command flows.
//!
//! Statistics are recomputed before any strategy looks at them, and all
//! strategies evaluate the same snapshot for a given tick. Executions run as
//! spawned tasks and report back over the outcome channel, so one strategy's
//! in-flight trade never blocks another's evaluation — but the owning
//! strategy itself stays in `Trading` and ignores triggers until its outcome
//! arrives.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::events::{EventSink, StatusEvent};
use crate::execution::{ExecutionError, Executor};
use crate::market::MarketRegistry;
use crate::protocol;
use crate::risk::{RiskManager, RiskViolation};
use crate::session::AccountSession;
use crate::stats::{last_digit, DigitStatsPipeline, Tick};

use super::triggers;
use super::types::{Settlement, StrategyConfig, StrategyState, StrategyStatus};

/// Raw ticks handed to pattern-based triggers.
const RECENT_TICKS: usize = 10;

pub enum EngineCommand {
    /// Wire (or re-wire after reconnect) the merged tick stream.
    AttachTicks(mpsc::UnboundedReceiver<Value>),
    /// The connection reopened; reconcile any indeterminate contracts.
    Reconnected,
    Start(String),
    Stop(String),
    StartAll,
    StopAll,
    Shutdown,
}

struct ExecutionOutcome {
    strategy_id: String,
    reconcile: bool,
    result: Result<Settlement, ExecutionError>,
}

pub struct StrategyEngine {
    strategies: Vec<StrategyState>,
    pipeline: DigitStatsPipeline,
    market: Arc<MarketRegistry>,
    session: Arc<AccountSession>,
    executor: Arc<Executor>,
    risk: Arc<RiskManager>,
    events: EventSink,
    ticks: Option<mpsc::UnboundedReceiver<Value>>,
    outcome_tx: mpsc::UnboundedSender<ExecutionOutcome>,
    outcome_rx: mpsc::UnboundedReceiver<ExecutionOutcome>,
}

impl StrategyEngine {
    pub fn new(
        configs: Vec<StrategyConfig>,
        sample_size: usize,
        market: Arc<MarketRegistry>,
        session: Arc<AccountSession>,
        executor: Arc<Executor>,
        risk: Arc<RiskManager>,
        events: EventSink,
    ) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        Self {
            strategies: configs.into_iter().map(StrategyState::new).collect(),
            pipeline: DigitStatsPipeline::new(sample_size),
            market,
            session,
            executor,
            risk,
            events,
            ticks: None,
            outcome_tx,
            outcome_rx,
        }
    }

    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<EngineCommand>) {
        loop {
            tokio::select! {
                tick = Self::next_tick(&mut self.ticks) => {
                    match tick {
                        Some(msg) => self.handle_tick_message(&msg),
                        // Stream gone; the supervision loop re-attaches after
                        // reconnect.
                        None => self.ticks = None,
                    }
                }
                Some(outcome) = self.outcome_rx.recv() => {
                    self.handle_outcome(outcome);
                }
                cmd = commands.recv() => {
                    match cmd {
                        Some(EngineCommand::AttachTicks(rx)) => self.ticks = Some(rx),
                        Some(EngineCommand::Reconnected) => self.reconcile_pending(),
                        Some(EngineCommand::Start(id)) => self.set_running(Some(&id), true),
                        Some(EngineCommand::Stop(id)) => self.set_running(Some(&id), false),
                        Some(EngineCommand::StartAll) => self.set_running(None, true),
                        Some(EngineCommand::StopAll) => self.set_running(None, false),
                        Some(EngineCommand::Shutdown) | None => break,
                    }
                }
            }
        }
    }

    async fn next_tick(ticks: &mut Option<mpsc::UnboundedReceiver<Value>>) -> Option<Value> {
        match ticks {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }

    fn set_running(&mut self, id: Option<&str>, running: bool) {
        for strategy in &mut self.strategies {
            if id.is_some_and(|id| id != strategy.config.id) {
                continue;
            }
            if running {
                strategy.start();
            } else {
                strategy.stop();
            }
        }
    }

    /// One tick: update statistics first, then let every waiting strategy
    /// evaluate the same snapshot.
    fn handle_tick_message(&mut self, msg: &Value) {
        let Some(tick_msg) = protocol::parse_tick(msg) else {
            return;
        };
        let decimals = self.market.decimals_for(&tick_msg.symbol);
        let digit = match last_digit(tick_msg.quote, decimals) {
            Some(d) => d,
            None => {
                // Known approximation: the window keeps its length, the
                // failure is surfaced rather than swallowed.
                self.pipeline.note_degraded_quote();
                self.events.emit(StatusEvent::DegradedQuote {
                    symbol: tick_msg.symbol.clone(),
                    quote: tick_msg.quote,
                });
                0
            }
        };
        let tick = Tick {
            quote: tick_msg.quote,
            last_digit: digit,
            epoch: tick_msg.epoch,
        };
        let stats = self.pipeline.ingest(&[tick]);
        let recent = self.pipeline.recent(RECENT_TICKS);

        // Warm-up: percentages over a part-filled window are noise, so no
        // strategy evaluates until the sample is complete.
        if self.pipeline.window_len() < self.pipeline.sample_size() {
            return;
        }
        if !self.session.is_logged_in() {
            return;
        }

        for strategy in &mut self.strategies {
            if strategy.status != StrategyStatus::Waiting
                || strategy.config.symbol != tick_msg.symbol
            {
                continue;
            }
            let Some(request) = triggers::evaluate(strategy, &stats, &recent) else {
                continue;
            };
            match self
                .risk
                .can_trade(&strategy.config.limits, &strategy.stake, request.stake)
            {
                Ok(()) => {
                    strategy.status = StrategyStatus::Trading;
                    let executor = self.executor.clone();
                    let outcome_tx = self.outcome_tx.clone();
                    let strategy_id = strategy.config.id.clone();
                    tokio::spawn(async move {
                        let result = executor.execute(&strategy_id, request).await;
                        let _ = outcome_tx.send(ExecutionOutcome {
                            strategy_id,
                            reconcile: false,
                            result,
                        });
                    });
                }
                // The breaker clears on its own; keep waiting.
                Err(RiskViolation::CircuitBreakerActive { .. }) => {}
                // A per-strategy limit is final for this run.
                Err(violation) => {
                    strategy.stop();
                    self.events.emit(StatusEvent::StrategyStopped {
                        strategy_id: strategy.config.id.clone(),
                        reason: violation.to_string(),
                    });
                }
            }
        }
    }

    fn handle_outcome(&mut self, outcome: ExecutionOutcome) {
        let Some(strategy) = self
            .strategies
            .iter_mut()
            .find(|s| s.config.id == outcome.strategy_id)
        else {
            return;
        };

        match outcome.result {
            Ok(settlement) => {
                strategy.pending_contract = None;
                self.risk.record_result(
                    &strategy.config.stake,
                    &mut strategy.stake,
                    settlement.won,
                    settlement.profit,
                );
                self.events.emit(StatusEvent::TradeSettled {
                    strategy_id: strategy.config.id.clone(),
                    contract_id: settlement.contract_id,
                    won: settlement.won,
                    profit: settlement.profit,
                });
                if strategy.status == StrategyStatus::Trading {
                    strategy.status = StrategyStatus::Waiting;
                }
                // Limits breached by this settlement stop the strategy now
                // rather than at its next trigger.
                if let Err(violation) = self.risk.can_trade(
                    &strategy.config.limits,
                    &strategy.stake,
                    strategy.stake.current_stake,
                ) {
                    if !matches!(violation, RiskViolation::CircuitBreakerActive { .. }) {
                        strategy.stop();
                        self.events.emit(StatusEvent::StrategyStopped {
                            strategy_id: strategy.config.id.clone(),
                            reason: violation.to_string(),
                        });
                    }
                }
            }
            Err(ExecutionError::Indeterminate { contract_id }) => {
                // Outcome unknown; hold the strategy until reconciliation.
                strategy.pending_contract = contract_id;
                self.events.emit(StatusEvent::TradeFailed {
                    strategy_id: strategy.config.id.clone(),
                    reason: match contract_id {
                        Some(id) => format!("settlement indeterminate (contract {})", id),
                        None => "settlement indeterminate".to_string(),
                    },
                });
                if contract_id.is_none() {
                    // Nothing to reconcile against; treat as unrecoverable.
                    strategy.status = StrategyStatus::Error;
                }
            }
            Err(ExecutionError::Vetoed(violation)) => {
                if matches!(violation, RiskViolation::CircuitBreakerActive { .. }) {
                    if strategy.status == StrategyStatus::Trading {
                        strategy.status = StrategyStatus::Waiting;
                    }
                } else {
                    strategy.stop();
                    self.events.emit(StatusEvent::StrategyStopped {
                        strategy_id: strategy.config.id.clone(),
                        reason: violation.to_string(),
                    });
                }
            }
            Err(e) => {
                if outcome.reconcile {
                    // A contract we could not re-query is an unrecoverable
                    // hole in the accounting.
                    strategy.status = StrategyStatus::Error;
                    self.events.emit(StatusEvent::StrategyStopped {
                        strategy_id: strategy.config.id.clone(),
                        reason: format!("reconciliation failed: {}", e),
                    });
                } else {
                    // Timeouts and rejections place no stake; back to waiting.
                    self.events.emit(StatusEvent::TradeFailed {
                        strategy_id: strategy.config.id.clone(),
                        reason: e.to_string(),
                    });
                    if strategy.status == StrategyStatus::Trading {
                        strategy.status = StrategyStatus::Waiting;
                    }
                }
            }
        }
    }

    /// Re-query every contract whose settlement was lost to a disconnect.
    /// The id is taken out so a second reconnect cannot spawn a duplicate
    /// reconciliation; a failed attempt re-arms it via `handle_outcome`.
    fn reconcile_pending(&mut self) {
        for strategy in &mut self.strategies {
            let Some(contract_id) = strategy.pending_contract.take() else {
                continue;
            };
            let executor = self.executor.clone();
            let outcome_tx = self.outcome_tx.clone();
            let strategy_id = strategy.config.id.clone();
            tokio::spawn(async move {
                let result = executor.reconcile(contract_id).await;
                let _ = outcome_tx.send(ExecutionOutcome {
                    strategy_id,
                    reconcile: true,
                    result,
                });
            });
        }
    }

    /// Status snapshot for diagnostics and tests.
    pub fn statuses(&self) -> Vec<(String, StrategyStatus)> {
        self.strategies
            .iter()
            .map(|s| (s.config.id.clone(), s.status))
            .collect()
    }
}
