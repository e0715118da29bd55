#[cfg(test)]
mod property_tests {
    use crate::connection::ReconnectPolicy;
    use crate::risk::{RiskConfig, RiskManager, StakeRules, StakeState};
    use crate::stats::{DigitStatsPipeline, Tick};
    use proptest::prelude::*;

    fn tick(digit: u8) -> Tick {
        Tick {
            quote: 100.0 + digit as f64 / 10.0,
            last_digit: digit,
            epoch: 0,
        }
    }

    // Property 1: Histogram Conservation
    proptest! {
        #[test]
        fn prop_counts_match_window(
            digits in prop::collection::vec(0u8..10, 1..300),
            sample_size in 1usize..200
        ) {
            let mut pipeline = DigitStatsPipeline::new(sample_size);
            let ticks: Vec<Tick> = digits.iter().map(|&d| tick(d)).collect();
            let stats = pipeline.ingest(&ticks);

            let total: u32 = stats.iter().map(|s| s.count).sum();
            prop_assert_eq!(total as usize, pipeline.window_len());
            prop_assert!(pipeline.window_len() <= sample_size.clamp(1, 1000));

            let pct: f64 = stats.iter().map(|s| s.percentage).sum();
            prop_assert!((pct - 100.0).abs() < 1e-6);
        }
    }

    // Property 2: Rank Determinism
    proptest! {
        #[test]
        fn prop_ranks_are_a_deterministic_permutation(
            digits in prop::collection::vec(0u8..10, 1..300)
        ) {
            let mut pipeline = DigitStatsPipeline::new(100);
            let ticks: Vec<Tick> = digits.iter().map(|&d| tick(d)).collect();
            let first = pipeline.ingest(&ticks);
            let second = pipeline.compute();

            let mut seen = [false; 10];
            for stat in first.iter() {
                prop_assert!((1..=10).contains(&stat.rank));
                prop_assert!(!seen[stat.rank as usize - 1], "rank {} assigned twice", stat.rank);
                seen[stat.rank as usize - 1] = true;
            }
            for (a, b) in first.iter().zip(second.iter()) {
                prop_assert_eq!(a.rank, b.rank);
            }

            // Ties break toward the lower digit.
            for a in first.iter() {
                for b in first.iter() {
                    if a.count == b.count && a.digit < b.digit {
                        prop_assert!(a.rank < b.rank);
                    }
                }
            }
        }
    }

    // Property 3: Stake Sizing Bounds
    proptest! {
        #[test]
        fn prop_stake_never_escapes_its_rules(
            outcomes in prop::collection::vec(prop::bool::ANY, 1..30),
            base in 0.5f64..5.0,
            multiplier in 1.1f64..3.0
        ) {
            let rules = StakeRules {
                base_stake: base,
                martingale: true,
                martingale_multiplier: multiplier,
                martingale_cap: Some(base * 50.0),
                compounding: false,
            };
            let risk = RiskManager::new(RiskConfig::default(), crate::events::EventSink::disabled());
            let mut state = StakeState::new(base);

            for won in outcomes {
                let prev = state.current_stake;
                let profit = if won { prev * 0.95 } else { -prev };
                risk.record_result(&rules, &mut state, won, profit);
                if won {
                    prop_assert!((state.current_stake - base).abs() < 1e-9);
                } else {
                    let expected = (prev * multiplier).min(base * 50.0);
                    prop_assert!((state.current_stake - expected).abs() < 1e-9);
                }
                prop_assert!(state.current_stake >= base - 1e-9);
                prop_assert!(state.current_stake <= base * 50.0 + 1e-9);
            }
        }
    }

    // Property 4: Backoff Shape
    proptest! {
        #[test]
        fn prop_backoff_is_monotone_and_capped(max_attempts in 1u32..20) {
            let policy = ReconnectPolicy {
                max_attempts,
                ..ReconnectPolicy::default()
            };
            let mut previous = 0u128;
            for attempt in 0..max_attempts {
                let delay = policy.backoff_delay(attempt).expect("within budget");
                prop_assert!(delay.as_millis() >= previous);
                prop_assert!(delay.as_millis() <= 10_000);
                previous = delay.as_millis();
            }
            prop_assert!(policy.backoff_delay(max_attempts).is_none());
        }
    }
}
