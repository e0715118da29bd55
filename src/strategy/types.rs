//! Strategy definitions: a closed set of strategy kinds, each with its own
//! strongly-typed configuration, plus the per-strategy run state.

use std::collections::VecDeque;

use crate::protocol::ContractKind;
use crate::risk::{StakeRules, StakeState, StrategyLimits};

/// Entries kept in the per-strategy power history.
pub const POWER_HISTORY_CAP: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyStatus {
    /// Not running; ticks are ignored.
    Idle,
    /// Running and evaluating trigger conditions on each tick.
    Waiting,
    /// A trade is in flight; new triggers are ignored until settlement.
    Trading,
    /// Unrecoverable failure; requires an explicit restart.
    Error,
}

impl std::fmt::Display for StrategyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyStatus::Idle => write!(f, "idle"),
            StrategyStatus::Waiting => write!(f, "waiting"),
            StrategyStatus::Trading => write!(f, "trading"),
            StrategyStatus::Error => write!(f, "error"),
        }
    }
}

/// One trade attempt produced by a triggered strategy.
#[derive(Debug, Clone)]
pub struct TradeRequest {
    pub contract: ContractKind,
    pub prediction: Option<u8>,
    pub stake: f64,
    pub duration_ticks: u32,
    pub symbol: String,
}

/// Outcome of a settled contract.
#[derive(Debug, Clone, Copy)]
pub struct Settlement {
    pub contract_id: u64,
    pub won: bool,
    pub profit: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverUnderSide {
    Over,
    Under,
}

/// Which digit a matches/differs strategy targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigitTarget {
    MostFrequent,
    LeastFrequent,
    Fixed(u8),
}

#[derive(Debug, Clone)]
pub struct EvenOddConfig {
    /// Minimum percentage the dominant parity must hold across the window.
    pub dominance_pct: f64,
    /// Require the parity's power history to be rising before entering.
    pub require_rising_power: bool,
    /// Require two consecutive opposite-parity ticks followed by one
    /// matching the dominant parity.
    pub confirm_pattern: bool,
}

impl Default for EvenOddConfig {
    fn default() -> Self {
        Self {
            dominance_pct: 55.0,
            require_rising_power: false,
            confirm_pattern: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OverUnderConfig {
    pub side: OverUnderSide,
    /// Digits strictly over (or under) this barrier count toward dominance.
    pub barrier: u8,
    pub dominance_pct: f64,
}

impl Default for OverUnderConfig {
    fn default() -> Self {
        Self {
            side: OverUnderSide::Over,
            barrier: 4,
            dominance_pct: 60.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatchesDiffersConfig {
    /// True trades DIGITMATCH on the target, false trades DIGITDIFF.
    pub matches: bool,
    pub target: DigitTarget,
    /// Differs: enter while the target digit stays at or below this share.
    pub max_target_pct: f64,
    /// Matches: enter once the target digit holds at least this share.
    pub min_target_pct: f64,
}

impl Default for MatchesDiffersConfig {
    fn default() -> Self {
        Self {
            matches: false,
            target: DigitTarget::LeastFrequent,
            max_target_pct: 6.0,
            min_target_pct: 14.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RiseFallConfig {
    /// Consecutive strictly-monotone quotes required to follow the move.
    pub min_streak: usize,
}

impl Default for RiseFallConfig {
    fn default() -> Self {
        Self { min_streak: 3 }
    }
}

/// Closed set of strategy kinds. Adding a kind means adding a variant here
/// and an arm in `triggers::evaluate` — nothing is dispatched dynamically.
#[derive(Debug, Clone)]
pub enum StrategyKind {
    EvenOdd(EvenOddConfig),
    OverUnder(OverUnderConfig),
    MatchesDiffers(MatchesDiffersConfig),
    RiseFall(RiseFallConfig),
}

impl StrategyKind {
    pub fn name(&self) -> &'static str {
        match self {
            StrategyKind::EvenOdd(_) => "even-odd",
            StrategyKind::OverUnder(_) => "over-under",
            StrategyKind::MatchesDiffers(_) => "matches-differs",
            StrategyKind::RiseFall(_) => "rise-fall",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StrategyConfig {
    pub id: String,
    pub symbol: String,
    pub kind: StrategyKind,
    pub stake: StakeRules,
    pub limits: StrategyLimits,
    pub duration_ticks: u32,
}

/// Full mutable run state for one strategy. Never shared between strategies.
pub struct StrategyState {
    pub config: StrategyConfig,
    pub status: StrategyStatus,
    pub stake: StakeState,
    pub power_history: VecDeque<f64>,
    /// Contract whose outcome was lost to a disconnect; reconciled before
    /// the strategy trades again.
    pub pending_contract: Option<u64>,
}

impl StrategyState {
    pub fn new(config: StrategyConfig) -> Self {
        let base = config.stake.base_stake;
        Self {
            config,
            status: StrategyStatus::Idle,
            stake: StakeState::new(base),
            power_history: VecDeque::with_capacity(POWER_HISTORY_CAP),
            pending_contract: None,
        }
    }

    pub fn start(&mut self) {
        if self.status == StrategyStatus::Idle || self.status == StrategyStatus::Error {
            self.status = StrategyStatus::Waiting;
        }
    }

    /// Explicit stop from any state; run counters reset with it.
    pub fn stop(&mut self) {
        self.status = StrategyStatus::Idle;
        self.stake.reset(self.config.stake.base_stake);
        self.power_history.clear();
        self.pending_contract = None;
    }

    pub fn is_running(&self) -> bool {
        !matches!(self.status, StrategyStatus::Idle | StrategyStatus::Error)
    }

    pub fn push_power(&mut self, power: f64) {
        if self.power_history.len() == POWER_HISTORY_CAP {
            self.power_history.pop_front();
        }
        self.power_history.push_back(power);
    }

    /// True once at least two samples exist and the newest is strictly above
    /// the previous one.
    pub fn power_rising(&self) -> bool {
        let len = self.power_history.len();
        if len < 2 {
            return false;
        }
        self.power_history[len - 1] > self.power_history[len - 2]
    }
}
