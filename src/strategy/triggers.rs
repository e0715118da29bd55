//! Trigger evaluation: per-kind entry conditions over a statistics snapshot
//! and the most recent raw ticks.
//!
//! All thresholds come from the strategy's own config. Evaluation mutates
//! only the strategy's power history; the actual state transition to
//! `Trading` is the engine's call.

use crate::protocol::ContractKind;
use crate::stats::{DigitStatistic, Tick};

use super::types::{
    DigitTarget, EvenOddConfig, MatchesDiffersConfig, OverUnderConfig, OverUnderSide,
    RiseFallConfig, StrategyKind, StrategyState, TradeRequest,
};

/// Evaluate one strategy against the current snapshot. Returns the trade the
/// strategy wants to enter, or `None` to keep waiting.
pub fn evaluate(
    state: &mut StrategyState,
    stats: &[DigitStatistic; 10],
    recent: &[Tick],
) -> Option<TradeRequest> {
    let kind = state.config.kind.clone();
    let (contract, prediction) = match &kind {
        StrategyKind::EvenOdd(cfg) => evaluate_even_odd(state, cfg, stats, recent)?,
        StrategyKind::OverUnder(cfg) => evaluate_over_under(cfg, stats)?,
        StrategyKind::MatchesDiffers(cfg) => evaluate_matches_differs(cfg, stats)?,
        StrategyKind::RiseFall(cfg) => evaluate_rise_fall(cfg, recent)?,
    };
    Some(TradeRequest {
        contract,
        prediction,
        stake: state.stake.current_stake,
        duration_ticks: state.config.duration_ticks,
        symbol: state.config.symbol.clone(),
    })
}

fn parity_pct(stats: &[DigitStatistic; 10], even: bool) -> f64 {
    stats
        .iter()
        .filter(|s| (s.digit % 2 == 0) == even)
        .map(|s| s.percentage)
        .sum()
}

fn parity_power(stats: &[DigitStatistic; 10], even: bool) -> f64 {
    stats
        .iter()
        .filter(|s| (s.digit % 2 == 0) == even)
        .map(|s| s.power)
        .sum()
}

fn evaluate_even_odd(
    state: &mut StrategyState,
    cfg: &EvenOddConfig,
    stats: &[DigitStatistic; 10],
    recent: &[Tick],
) -> Option<(ContractKind, Option<u8>)> {
    let even_pct = parity_pct(stats, true);
    let odd_pct = parity_pct(stats, false);
    // Exact 50/50 has no dominant side; lowest-digit-style determinism is
    // irrelevant here because neither side can clear a >50 threshold anyway.
    let dominant_even = even_pct > odd_pct;
    let dominant_pct = even_pct.max(odd_pct);

    state.push_power(parity_power(stats, dominant_even));

    if dominant_pct < cfg.dominance_pct {
        return None;
    }
    if cfg.require_rising_power && !state.power_rising() {
        return None;
    }
    if cfg.confirm_pattern && !pattern_confirms(recent, dominant_even) {
        return None;
    }
    let contract = if dominant_even {
        ContractKind::DigitEven
    } else {
        ContractKind::DigitOdd
    };
    Some((contract, None))
}

/// Two consecutive ticks of the opposite parity followed by one matching the
/// dominant parity.
fn pattern_confirms(recent: &[Tick], dominant_even: bool) -> bool {
    let n = recent.len();
    if n < 3 {
        return false;
    }
    let a = &recent[n - 3];
    let b = &recent[n - 2];
    let c = &recent[n - 1];
    a.is_even() != dominant_even && b.is_even() != dominant_even && c.is_even() == dominant_even
}

fn evaluate_over_under(
    cfg: &OverUnderConfig,
    stats: &[DigitStatistic; 10],
) -> Option<(ContractKind, Option<u8>)> {
    let in_side = |digit: u8| match cfg.side {
        OverUnderSide::Over => digit > cfg.barrier,
        OverUnderSide::Under => digit < cfg.barrier,
    };
    let side_pct: f64 = stats
        .iter()
        .filter(|s| in_side(s.digit))
        .map(|s| s.percentage)
        .sum();
    if side_pct < cfg.dominance_pct {
        return None;
    }
    let contract = match cfg.side {
        OverUnderSide::Over => ContractKind::DigitOver,
        OverUnderSide::Under => ContractKind::DigitUnder,
    };
    Some((contract, Some(cfg.barrier)))
}

fn evaluate_matches_differs(
    cfg: &MatchesDiffersConfig,
    stats: &[DigitStatistic; 10],
) -> Option<(ContractKind, Option<u8>)> {
    let target = match cfg.target {
        DigitTarget::MostFrequent => stats.iter().find(|s| s.rank == 1)?.digit,
        DigitTarget::LeastFrequent => stats.iter().find(|s| s.rank == 10)?.digit,
        DigitTarget::Fixed(d) => d.min(9),
    };
    let stat = stats[target as usize];
    if cfg.matches {
        // Ride a hot digit only while it keeps getting hotter.
        if stat.percentage >= cfg.min_target_pct && stat.is_increasing {
            return Some((ContractKind::DigitMatch, Some(target)));
        }
    } else {
        // Bet against a cold digit only while it stays cold.
        if stat.percentage <= cfg.max_target_pct && !stat.is_increasing {
            return Some((ContractKind::DigitDiff, Some(target)));
        }
    }
    None
}

fn evaluate_rise_fall(
    cfg: &RiseFallConfig,
    recent: &[Tick],
) -> Option<(ContractKind, Option<u8>)> {
    let needed = cfg.min_streak.max(2);
    if recent.len() < needed {
        return None;
    }
    let tail = &recent[recent.len() - needed..];
    let rising = tail.windows(2).all(|w| w[1].quote > w[0].quote);
    let falling = tail.windows(2).all(|w| w[1].quote < w[0].quote);
    if rising {
        Some((ContractKind::Rise, None))
    } else if falling {
        Some((ContractKind::Fall, None))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::{StakeRules, StrategyLimits};
    use crate::stats::DigitStatsPipeline;
    use crate::strategy::types::StrategyConfig;

    fn tick(digit: u8) -> Tick {
        Tick {
            quote: 100.0 + digit as f64 / 10.0,
            last_digit: digit,
            epoch: 0,
        }
    }

    fn even_odd_state(cfg: EvenOddConfig) -> StrategyState {
        StrategyState::new(StrategyConfig {
            id: "even-odd-1".to_string(),
            symbol: "R_100".to_string(),
            kind: StrategyKind::EvenOdd(cfg),
            stake: StakeRules::default(),
            limits: StrategyLimits::default(),
            duration_ticks: 1,
        })
    }

    #[test]
    fn test_even_odd_stays_quiet_at_fifty_fifty() {
        // Balanced window: 5 even, 5 odd -> 50% cannot clear a 55% threshold.
        let mut pipeline = DigitStatsPipeline::new(10);
        let ticks: Vec<Tick> = [2u8, 4, 6, 8, 1, 3, 5, 7, 9, 0].iter().map(|&d| tick(d)).collect();
        let stats = pipeline.ingest(&ticks);
        let mut state = even_odd_state(EvenOddConfig::default());
        assert!(evaluate(&mut state, &stats, &pipeline.recent(5)).is_none());
    }

    #[test]
    fn test_even_odd_fires_on_dominance() {
        let mut pipeline = DigitStatsPipeline::new(10);
        // 8 even, 2 odd -> 80% even.
        let ticks: Vec<Tick> = [0u8, 2, 4, 6, 8, 0, 2, 4, 1, 3].iter().map(|&d| tick(d)).collect();
        let stats = pipeline.ingest(&ticks);
        let mut state = even_odd_state(EvenOddConfig::default());
        let request = evaluate(&mut state, &stats, &pipeline.recent(5)).expect("should trigger");
        assert_eq!(request.contract, ContractKind::DigitEven);
        assert!(request.prediction.is_none());
    }

    #[test]
    fn test_even_odd_pattern_gate() {
        let cfg = EvenOddConfig {
            confirm_pattern: true,
            ..EvenOddConfig::default()
        };
        let mut pipeline = DigitStatsPipeline::new(10);
        // Even-dominant window whose tail is odd, odd, even: pattern holds.
        let ticks: Vec<Tick> = [0u8, 2, 4, 6, 8, 2, 4, 1, 3, 6].iter().map(|&d| tick(d)).collect();
        let stats = pipeline.ingest(&ticks);
        let mut state = even_odd_state(cfg.clone());
        assert!(evaluate(&mut state, &stats, &pipeline.recent(5)).is_some());

        // Same distribution but a tail that never flips back misses the gate.
        let mut pipeline = DigitStatsPipeline::new(10);
        let ticks: Vec<Tick> = [0u8, 2, 4, 6, 8, 2, 1, 3, 4, 6].iter().map(|&d| tick(d)).collect();
        let stats = pipeline.ingest(&ticks);
        let mut state = even_odd_state(cfg);
        assert!(evaluate(&mut state, &stats, &pipeline.recent(5)).is_none());
    }

    #[test]
    fn test_over_under_barrier_share() {
        let mut pipeline = DigitStatsPipeline::new(10);
        // 7 of 10 digits strictly over 4.
        let ticks: Vec<Tick> = [5u8, 6, 7, 8, 9, 5, 6, 1, 2, 3].iter().map(|&d| tick(d)).collect();
        let stats = pipeline.ingest(&ticks);
        let cfg = OverUnderConfig {
            side: OverUnderSide::Over,
            barrier: 4,
            dominance_pct: 70.0,
        };
        let (contract, prediction) = evaluate_over_under(&cfg, &stats).expect("should trigger");
        assert_eq!(contract, ContractKind::DigitOver);
        assert_eq!(prediction, Some(4));

        let strict = OverUnderConfig {
            dominance_pct: 75.0,
            ..cfg
        };
        assert!(evaluate_over_under(&strict, &stats).is_none());
    }

    #[test]
    fn test_differs_targets_cold_digit() {
        let mut pipeline = DigitStatsPipeline::new(20);
        // Digit 9 never appears; everything else cycles.
        let ticks: Vec<Tick> = (0..20).map(|i| tick((i % 9) as u8)).collect();
        let stats = pipeline.ingest(&ticks);
        let cfg = MatchesDiffersConfig::default();
        let (contract, prediction) =
            evaluate_matches_differs(&cfg, &stats).expect("should trigger");
        assert_eq!(contract, ContractKind::DigitDiff);
        assert_eq!(prediction, Some(9));
    }

    #[test]
    fn test_rise_fall_needs_monotone_streak() {
        let cfg = RiseFallConfig { min_streak: 3 };
        let rising = vec![
            Tick { quote: 1.0, last_digit: 0, epoch: 0 },
            Tick { quote: 1.1, last_digit: 1, epoch: 1 },
            Tick { quote: 1.2, last_digit: 2, epoch: 2 },
        ];
        assert_eq!(
            evaluate_rise_fall(&cfg, &rising),
            Some((ContractKind::Rise, None))
        );

        let choppy = vec![
            Tick { quote: 1.0, last_digit: 0, epoch: 0 },
            Tick { quote: 1.2, last_digit: 2, epoch: 1 },
            Tick { quote: 1.1, last_digit: 1, epoch: 2 },
        ];
        assert_eq!(evaluate_rise_fall(&cfg, &choppy), None);
    }
}
