//! Instrument metadata: pip size per symbol, reduced to the decimal
//! precision the digit extractor formats quotes with.

use std::collections::HashMap;

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::protocol::SymbolInfo;

/// Used when an instrument's pip size is unknown.
pub const DEFAULT_DECIMALS: u32 = 2;

/// Known precision for the common volatility indices, so digit extraction is
/// right even before the instrument listing has loaded.
static BUILTIN_DECIMALS: Lazy<HashMap<&'static str, u32>> = Lazy::new(|| {
    let mut map = HashMap::new();
    map.insert("R_10", 3);
    map.insert("R_25", 3);
    map.insert("R_50", 4);
    map.insert("R_75", 4);
    map.insert("R_100", 2);
    map
});

/// Derive decimal places from a pip size (0.001 -> 3). Pip sizes arrive as
/// floats, so round before truncating.
pub fn pip_decimals(pip: f64) -> u32 {
    if pip <= 0.0 || pip >= 1.0 {
        return DEFAULT_DECIMALS;
    }
    let places = -pip.log10();
    places.round() as u32
}

#[derive(Default)]
pub struct MarketRegistry {
    decimals: DashMap<String, u32>,
}

impl MarketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decimals_for(&self, symbol: &str) -> u32 {
        if let Some(entry) = self.decimals.get(symbol) {
            return *entry.value();
        }
        BUILTIN_DECIMALS
            .get(symbol)
            .copied()
            .unwrap_or(DEFAULT_DECIMALS)
    }

    pub fn insert(&self, symbol: &str, decimals: u32) {
        self.decimals.insert(symbol.to_string(), decimals);
    }

    /// Load precision for every tradable instrument from the instrument
    /// listing response.
    pub fn load_symbols(&self, symbols: &[SymbolInfo]) {
        for info in symbols {
            self.decimals
                .insert(info.symbol.clone(), pip_decimals(info.pip));
        }
    }

    pub fn len(&self) -> usize {
        self.decimals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decimals.is_empty()
    }
}
