//! Risk and safety: stake sizing, per-strategy limits, and the global
//! circuit breaker.
//!
//! Sizing modes are keyed to the last outcome, so martingale (loss recovery)
//! and compounding (win reinvestment) can both be enabled without ever
//! applying to the same settlement.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::events::{EventSink, StatusEvent};

#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// Hard ceiling on any single stake, across all strategies.
    pub max_stake: f64,
    /// Losses inside the sliding window needed to trip the breaker.
    pub breaker_loss_threshold: usize,
    pub breaker_window: Duration,
    pub breaker_cooldown: Duration,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_stake: 100.0,
            breaker_loss_threshold: 3,
            breaker_window: Duration::from_secs(30),
            breaker_cooldown: Duration::from_secs(120),
        }
    }
}

/// How a strategy sizes its next stake.
#[derive(Debug, Clone)]
pub struct StakeRules {
    pub base_stake: f64,
    pub martingale: bool,
    pub martingale_multiplier: f64,
    pub martingale_cap: Option<f64>,
    pub compounding: bool,
}

impl Default for StakeRules {
    fn default() -> Self {
        Self {
            base_stake: 1.0,
            martingale: false,
            martingale_multiplier: 2.0,
            martingale_cap: None,
            compounding: false,
        }
    }
}

/// Per-strategy cutoffs; `None` disables a check.
#[derive(Debug, Clone, Default)]
pub struct StrategyLimits {
    pub take_profit: Option<f64>,
    pub stop_loss: Option<f64>,
    pub max_consecutive_losses: Option<u32>,
}

/// Mutable sizing state owned by exactly one strategy.
#[derive(Debug, Clone)]
pub struct StakeState {
    pub current_stake: f64,
    pub consecutive_losses: u32,
    pub profit_loss: f64,
    pub wins: u32,
    pub losses: u32,
    pub last_won: Option<bool>,
}

impl StakeState {
    pub fn new(base_stake: f64) -> Self {
        Self {
            current_stake: base_stake,
            consecutive_losses: 0,
            profit_loss: 0.0,
            wins: 0,
            losses: 0,
            last_won: None,
        }
    }

    pub fn reset(&mut self, base_stake: f64) {
        *self = Self::new(base_stake);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RiskViolation {
    CircuitBreakerActive { remaining_secs: u64 },
    TakeProfitReached { profit_loss: f64 },
    StopLossReached { profit_loss: f64 },
    MaxConsecutiveLosses { losses: u32 },
    StakeCeiling { stake: f64, max_stake: f64 },
}

impl std::fmt::Display for RiskViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskViolation::CircuitBreakerActive { remaining_secs } => {
                write!(f, "circuit breaker active ({}s remaining)", remaining_secs)
            }
            RiskViolation::TakeProfitReached { profit_loss } => {
                write!(f, "take profit reached (P/L {:.2})", profit_loss)
            }
            RiskViolation::StopLossReached { profit_loss } => {
                write!(f, "stop loss reached (P/L {:.2})", profit_loss)
            }
            RiskViolation::MaxConsecutiveLosses { losses } => {
                write!(f, "max consecutive losses reached ({})", losses)
            }
            RiskViolation::StakeCeiling { stake, max_stake } => {
                write!(f, "stake {:.2} exceeds ceiling {:.2}", stake, max_stake)
            }
        }
    }
}

impl std::error::Error for RiskViolation {}

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    pub profit_loss: f64,
    pub wins: u32,
    pub losses: u32,
}

struct RiskState {
    session: SessionStats,
    loss_times: VecDeque<Instant>,
    breaker_until: Option<Instant>,
}

pub struct RiskManager {
    config: RiskConfig,
    events: EventSink,
    state: Mutex<RiskState>,
}

impl RiskManager {
    pub fn new(config: RiskConfig, events: EventSink) -> Self {
        Self {
            config,
            events,
            state: Mutex::new(RiskState {
                session: SessionStats::default(),
                loss_times: VecDeque::new(),
                breaker_until: None,
            }),
        }
    }

    /// Global gates only: circuit breaker and the stake ceiling. Applies to
    /// every strategy regardless of its own limits.
    pub fn check_global(&self, stake: f64) -> Result<(), RiskViolation> {
        if stake > self.config.max_stake {
            return Err(RiskViolation::StakeCeiling {
                stake,
                max_stake: self.config.max_stake,
            });
        }
        let mut state = self.state.lock().unwrap();
        if let Some(until) = state.breaker_until {
            let now = Instant::now();
            if now < until {
                return Err(RiskViolation::CircuitBreakerActive {
                    remaining_secs: (until - now).as_secs(),
                });
            }
            // Cooldown elapsed: the breaker resets itself.
            state.breaker_until = None;
            state.loss_times.clear();
            self.events.emit(StatusEvent::CircuitBreakerReset);
        }
        Ok(())
    }

    /// Full pre-trade check for one strategy.
    pub fn can_trade(
        &self,
        limits: &StrategyLimits,
        stake_state: &StakeState,
        stake: f64,
    ) -> Result<(), RiskViolation> {
        self.check_global(stake)?;
        if let Some(tp) = limits.take_profit {
            if stake_state.profit_loss >= tp {
                return Err(RiskViolation::TakeProfitReached {
                    profit_loss: stake_state.profit_loss,
                });
            }
        }
        if let Some(sl) = limits.stop_loss {
            if stake_state.profit_loss <= -sl {
                return Err(RiskViolation::StopLossReached {
                    profit_loss: stake_state.profit_loss,
                });
            }
        }
        if let Some(max) = limits.max_consecutive_losses {
            if stake_state.consecutive_losses >= max {
                return Err(RiskViolation::MaxConsecutiveLosses {
                    losses: stake_state.consecutive_losses,
                });
            }
        }
        Ok(())
    }

    /// Stake for the next trade given the last settlement.
    ///
    /// Loss → martingale multiplies the current stake (capped). Win →
    /// compounding reinvests the strategy's accumulated profit on top of the
    /// base, otherwise the stake resets to base. The two modes key off
    /// opposite outcomes, so enabling both never conflicts.
    pub fn next_stake(rules: &StakeRules, stake_state: &StakeState) -> f64 {
        match stake_state.last_won {
            Some(false) if rules.martingale => {
                let raised = stake_state.current_stake * rules.martingale_multiplier;
                match rules.martingale_cap {
                    Some(cap) => raised.min(cap),
                    None => raised,
                }
            }
            Some(true) if rules.compounding && stake_state.profit_loss > 0.0 => {
                rules.base_stake + stake_state.profit_loss
            }
            _ => rules.base_stake,
        }
    }

    /// Fold a settlement into the owning strategy's counters and the global
    /// session, then recompute the strategy's next stake.
    pub fn record_result(
        &self,
        rules: &StakeRules,
        stake_state: &mut StakeState,
        won: bool,
        profit: f64,
    ) {
        stake_state.profit_loss += profit;
        stake_state.last_won = Some(won);
        if won {
            stake_state.wins += 1;
            stake_state.consecutive_losses = 0;
        } else {
            stake_state.losses += 1;
            stake_state.consecutive_losses += 1;
        }
        stake_state.current_stake = Self::next_stake(rules, stake_state);

        let mut state = self.state.lock().unwrap();
        state.session.profit_loss += profit;
        if won {
            state.session.wins += 1;
        } else {
            state.session.losses += 1;
            self.note_loss(&mut state, Instant::now());
        }
    }

    fn note_loss(&self, state: &mut RiskState, now: Instant) {
        // An expired breaker is cleared here too, so settlements that land
        // after the cooldown (without an intervening can_trade) still count
        // toward a fresh cluster.
        if matches!(state.breaker_until, Some(until) if now >= until) {
            state.breaker_until = None;
            state.loss_times.clear();
            self.events.emit(StatusEvent::CircuitBreakerReset);
        }
        state.loss_times.push_back(now);
        let window = self.config.breaker_window;
        while let Some(&oldest) = state.loss_times.front() {
            if now.duration_since(oldest) > window {
                state.loss_times.pop_front();
            } else {
                break;
            }
        }
        if state.breaker_until.is_none()
            && state.loss_times.len() >= self.config.breaker_loss_threshold
        {
            state.breaker_until = Some(now + self.config.breaker_cooldown);
            // Require a fresh loss cluster after the cooldown.
            state.loss_times.clear();
            self.events.emit(StatusEvent::CircuitBreakerTripped {
                cooldown_secs: self.config.breaker_cooldown.as_secs(),
            });
        }
    }

    pub fn breaker_active(&self) -> bool {
        let state = self.state.lock().unwrap();
        matches!(state.breaker_until, Some(until) if Instant::now() < until)
    }

    pub fn session(&self) -> SessionStats {
        self.state.lock().unwrap().session
    }
}
