//! Tick ingestion and per-digit statistics over a bounded rolling window.
//!
//! Pure and deterministic: no network, no timers. The histogram is recomputed
//! from scratch on every ingest rather than maintained incrementally, so the
//! counts can never drift from the window contents.

use std::collections::VecDeque;

use serde::Serialize;

pub const DEFAULT_SAMPLE_SIZE: usize = 100;
pub const MAX_SAMPLE_SIZE: usize = 1_000;

/// Sub-windows the momentum signal compares.
const POWER_RECENT_TICKS: usize = 10;
const POWER_BASE_TICKS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    pub quote: f64,
    pub last_digit: u8,
    pub epoch: i64,
}

impl Tick {
    pub fn is_even(&self) -> bool {
        self.last_digit % 2 == 0
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DigitStatistic {
    pub digit: u8,
    pub count: u32,
    pub percentage: f64,
    /// Dense rank by count descending; equal counts rank the lower digit first.
    pub rank: u8,
    /// Recent-window frequency minus base-window frequency, in percentage points.
    pub power: f64,
    pub is_increasing: bool,
}

/// Last digit of `quote` formatted at the instrument's pip precision.
///
/// `None` means the formatted quote did not end in a digit; callers surface
/// that as a degraded-quote event instead of failing the stream.
pub fn last_digit(quote: f64, decimals: u32) -> Option<u8> {
    if !quote.is_finite() {
        return None;
    }
    let formatted = format!("{:.*}", decimals as usize, quote);
    formatted
        .chars()
        .next_back()
        .and_then(|c| c.to_digit(10))
        .map(|d| d as u8)
}

pub struct DigitStatsPipeline {
    window: VecDeque<Tick>,
    sample_size: usize,
    degraded_quotes: u64,
}

impl DigitStatsPipeline {
    pub fn new(sample_size: usize) -> Self {
        let sample_size = sample_size.clamp(1, MAX_SAMPLE_SIZE);
        Self {
            window: VecDeque::with_capacity(sample_size),
            sample_size,
            degraded_quotes: 0,
        }
    }

    /// Append ticks, evict the oldest beyond capacity, and return fresh
    /// statistics for the resulting window.
    pub fn ingest(&mut self, ticks: &[Tick]) -> [DigitStatistic; 10] {
        for tick in ticks {
            if self.window.len() == self.sample_size {
                self.window.pop_front();
            }
            self.window.push_back(*tick);
        }
        self.compute()
    }

    /// Record that a quote failed digit extraction and was defaulted to 0.
    pub fn note_degraded_quote(&mut self) {
        self.degraded_quotes += 1;
    }

    pub fn degraded_quotes(&self) -> u64 {
        self.degraded_quotes
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    /// Most recent `n` ticks, oldest first.
    pub fn recent(&self, n: usize) -> Vec<Tick> {
        let start = self.window.len().saturating_sub(n);
        self.window.iter().skip(start).copied().collect()
    }

    /// Recompute all ten digit records from the current window.
    pub fn compute(&self) -> [DigitStatistic; 10] {
        let len = self.window.len();
        let mut stats: [DigitStatistic; 10] = std::array::from_fn(|d| DigitStatistic {
            digit: d as u8,
            ..DigitStatistic::default()
        });

        for tick in &self.window {
            stats[tick.last_digit as usize].count += 1;
        }
        if len > 0 {
            for stat in stats.iter_mut() {
                stat.percentage = stat.count as f64 * 100.0 / len as f64;
            }
        }

        // Dense ranking: count descending, lowest digit wins ties.
        let mut order: Vec<usize> = (0..10).collect();
        order.sort_by(|&a, &b| {
            stats[b]
                .count
                .cmp(&stats[a].count)
                .then_with(|| a.cmp(&b))
        });
        for (position, &digit) in order.iter().enumerate() {
            stats[digit].rank = position as u8 + 1;
        }

        // Momentum: frequency over the trailing ~10 ticks vs ~50 ticks.
        let recent_len = len.min(POWER_RECENT_TICKS);
        let base_len = len.min(POWER_BASE_TICKS);
        if recent_len > 0 && base_len > 0 {
            let mut recent_counts = [0u32; 10];
            let mut base_counts = [0u32; 10];
            for (i, tick) in self.window.iter().enumerate() {
                if i >= len - base_len {
                    base_counts[tick.last_digit as usize] += 1;
                }
                if i >= len - recent_len {
                    recent_counts[tick.last_digit as usize] += 1;
                }
            }
            for stat in stats.iter_mut() {
                let recent_freq = recent_counts[stat.digit as usize] as f64 / recent_len as f64;
                let base_freq = base_counts[stat.digit as usize] as f64 / base_len as f64;
                stat.power = (recent_freq - base_freq) * 100.0;
                stat.is_increasing = recent_freq > base_freq;
            }
        }

        stats
    }
}
