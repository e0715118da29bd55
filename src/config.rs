//! Environment-driven configuration. A `.env` file is honored when present;
//! only the API token is mandatory.

use std::time::Duration;

use crate::connection::ReconnectPolicy;
use crate::risk::{RiskConfig, StakeRules, StrategyLimits};
use crate::stats::DEFAULT_SAMPLE_SIZE;
use crate::strategy::types::{
    EvenOddConfig, MatchesDiffersConfig, OverUnderConfig, RiseFallConfig, StrategyConfig,
    StrategyKind,
};
use crate::DynError;

const DEFAULT_ENDPOINT: &str = "wss://ws.derivws.com/websockets/v3?app_id=1089";
const DEFAULT_SYMBOLS: &str = "R_100";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub endpoint: String,
    pub api_token: String,
    pub symbols: Vec<String>,
    pub sample_size: usize,
    pub call_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub risk: RiskConfig,
    pub stake: StakeRules,
    pub limits: StrategyLimits,
    pub duration_ticks: u32,
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_opt_f64(name: &str) -> Option<f64> {
    std::env::var(name).ok().and_then(|v| v.parse::<f64>().ok())
}

impl AppConfig {
    pub fn from_env() -> Result<Self, DynError> {
        let api_token = std::env::var("DIGITBOT_API_TOKEN")
            .map_err(|_| "DIGITBOT_API_TOKEN must be set")?;
        if api_token.trim().is_empty() {
            return Err("DIGITBOT_API_TOKEN must not be empty".into());
        }

        let endpoint =
            std::env::var("DIGITBOT_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());

        let symbols: Vec<String> = std::env::var("DIGITBOT_SYMBOLS")
            .unwrap_or_else(|_| DEFAULT_SYMBOLS.to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if symbols.is_empty() {
            return Err("DIGITBOT_SYMBOLS must name at least one instrument".into());
        }

        let stake = StakeRules {
            base_stake: env_parse("DIGITBOT_STAKE", 1.0),
            martingale: env_parse("DIGITBOT_MARTINGALE", false),
            martingale_multiplier: env_parse("DIGITBOT_MARTINGALE_MULTIPLIER", 2.1),
            martingale_cap: env_opt_f64("DIGITBOT_MARTINGALE_CAP"),
            compounding: env_parse("DIGITBOT_COMPOUNDING", false),
        };
        if stake.base_stake <= 0.0 {
            return Err("DIGITBOT_STAKE must be positive".into());
        }
        if stake.martingale_multiplier <= 1.0 {
            return Err("DIGITBOT_MARTINGALE_MULTIPLIER must be greater than 1".into());
        }

        let limits = StrategyLimits {
            take_profit: env_opt_f64("DIGITBOT_TAKE_PROFIT"),
            stop_loss: env_opt_f64("DIGITBOT_STOP_LOSS"),
            max_consecutive_losses: std::env::var("DIGITBOT_MAX_CONSECUTIVE_LOSSES")
                .ok()
                .and_then(|v| v.parse::<u32>().ok()),
        };

        let risk = RiskConfig {
            max_stake: env_parse("DIGITBOT_MAX_STAKE", 100.0),
            breaker_loss_threshold: env_parse("DIGITBOT_BREAKER_LOSSES", 3),
            breaker_window: Duration::from_secs(env_parse("DIGITBOT_BREAKER_WINDOW_SECS", 30)),
            breaker_cooldown: Duration::from_secs(env_parse(
                "DIGITBOT_BREAKER_COOLDOWN_SECS",
                120,
            )),
        };

        Ok(Self {
            endpoint,
            api_token,
            symbols,
            sample_size: env_parse("DIGITBOT_SAMPLE_SIZE", DEFAULT_SAMPLE_SIZE),
            call_timeout: Duration::from_secs(env_parse("DIGITBOT_CALL_TIMEOUT_SECS", 10)),
            reconnect: ReconnectPolicy::default(),
            risk,
            stake,
            limits,
            duration_ticks: env_parse("DIGITBOT_DURATION_TICKS", 1),
        })
    }

    /// One instance of every strategy kind per configured instrument, all
    /// sharing the env-provided stake rules and limits.
    pub fn build_strategies(&self) -> Vec<StrategyConfig> {
        let mut strategies = Vec::with_capacity(self.symbols.len() * 4);
        for symbol in &self.symbols {
            let kinds = [
                StrategyKind::EvenOdd(EvenOddConfig::default()),
                StrategyKind::OverUnder(OverUnderConfig::default()),
                StrategyKind::MatchesDiffers(MatchesDiffersConfig::default()),
                StrategyKind::RiseFall(RiseFallConfig::default()),
            ];
            for kind in kinds {
                strategies.push(StrategyConfig {
                    id: format!("{}-{}", kind.name(), symbol),
                    symbol: symbol.clone(),
                    kind,
                    stake: self.stake.clone(),
                    limits: self.limits.clone(),
                    duration_ticks: self.duration_ticks,
                });
            }
        }
        strategies
    }
}
