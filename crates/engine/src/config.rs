//! Engine configuration
//!
//! Mirrors the configuration document consumed by the signal pipeline:
//! indicator periods, voting settings, per-strategy thresholds, risk and
//! execution costs. Every block has defaults so partial JSON documents load.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::combiner::TieBreakMethod;
use crate::error::{EngineError, EngineResult};
use crate::strategy::StrategyKind;

/// Full engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub indicators: IndicatorParams,
    pub strategy: StrategySettings,
    pub strategies: StrategyThresholds,
    pub risk: RiskConfig,
    pub execution: ExecutionConfig,
    /// Leading bars dropped after indicator computation
    pub warmup_bars: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            indicators: IndicatorParams::default(),
            strategy: StrategySettings::default(),
            strategies: StrategyThresholds::default(),
            risk: RiskConfig::default(),
            execution: ExecutionConfig::default(),
            warmup_bars: 100,
        }
    }
}

/// Indicator periods. MACD reuses `ema_fast`/`ema_slow` as its two legs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorParams {
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub macd_signal: usize,
    pub rsi_period: usize,
    pub atr_period: usize,
    pub bb_period: usize,
    pub bb_k: f64,
    pub stoch_k: usize,
    pub stoch_d: usize,
    pub williams_period: usize,
    pub adx_period: usize,
    pub cci_period: usize,
    pub momentum_period: usize,
    pub roc_period: usize,
}

impl Default for IndicatorParams {
    fn default() -> Self {
        Self {
            ema_fast: 12,
            ema_slow: 26,
            macd_signal: 9,
            rsi_period: 14,
            atr_period: 14,
            bb_period: 20,
            bb_k: 2.0,
            stoch_k: 14,
            stoch_d: 3,
            williams_period: 14,
            adx_period: 14,
            cci_period: 20,
            momentum_period: 10,
            roc_period: 10,
        }
    }
}

impl IndicatorParams {
    /// Fast-reacting 3/8 EMA profile for intraday charts
    pub fn fast_profile() -> Self {
        Self {
            ema_fast: 3,
            ema_slow: 8,
            ..Self::default()
        }
    }

    /// Bars needed before every indicator has a fully populated window
    pub fn longest_window(&self) -> usize {
        [
            self.ema_slow,
            self.rsi_period,
            self.atr_period,
            self.bb_period,
            self.stoch_k + self.stoch_d - 1,
            self.williams_period,
            self.adx_period,
            self.cci_period,
            self.momentum_period + 1,
            self.roc_period + 1,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }

    /// Periods must be positive and `bb_k` a non-negative number
    pub fn validate(&self) -> EngineResult<()> {
        let periods = [
            ("ema_fast", self.ema_fast),
            ("ema_slow", self.ema_slow),
            ("macd_signal", self.macd_signal),
            ("rsi_period", self.rsi_period),
            ("atr_period", self.atr_period),
            ("bb_period", self.bb_period),
            ("stoch_k", self.stoch_k),
            ("stoch_d", self.stoch_d),
            ("williams_period", self.williams_period),
            ("adx_period", self.adx_period),
            ("cci_period", self.cci_period),
            ("momentum_period", self.momentum_period),
            ("roc_period", self.roc_period),
        ];
        for (name, value) in periods {
            if value == 0 {
                return Err(EngineError::Configuration(format!(
                    "indicators.{} must be greater than zero",
                    name
                )));
            }
        }
        if !self.bb_k.is_finite() || self.bb_k < 0.0 {
            return Err(EngineError::Configuration(format!(
                "indicators.bb_k must be a non-negative number, got {}",
                self.bb_k
            )));
        }
        Ok(())
    }
}

/// Voting and EMA-crossover settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategySettings {
    /// Strategy used when `combine_strategies` is off
    pub active_strategy: StrategyKind,
    pub combine_strategies: bool,
    pub enabled_strategies: Vec<StrategyKind>,
    /// Votes needed for a decisive outcome; majority of the enabled set when unset
    pub min_strategy_votes: Option<usize>,
    pub tie_break_method: TieBreakMethod,
    pub rsi_long_min: f64,
    pub rsi_short_max: f64,
    pub min_atr_pct: f64,
    pub regime_threshold: f64,
    pub macd_confirm: bool,
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            active_strategy: StrategyKind::EmaCrossover,
            combine_strategies: true,
            enabled_strategies: StrategyKind::ALL.to_vec(),
            min_strategy_votes: None,
            tie_break_method: TieBreakMethod::Score,
            rsi_long_min: 40.0,
            rsi_short_max: 60.0,
            min_atr_pct: 0.001,
            regime_threshold: 0.0005,
            macd_confirm: true,
        }
    }
}

impl StrategySettings {
    /// Strategies taking part in this run, in configuration order
    pub fn participating(&self) -> Vec<StrategyKind> {
        if self.combine_strategies {
            self.enabled_strategies.clone()
        } else {
            vec![self.active_strategy]
        }
    }

    /// `min_strategy_votes`, or floor(n/2)+1 when unset
    pub fn min_votes(&self, n: usize) -> usize {
        self.min_strategy_votes.unwrap_or(n / 2 + 1)
    }

    fn validate(&self) -> EngineResult<()> {
        if self.combine_strategies {
            if self.enabled_strategies.is_empty() {
                return Err(EngineError::Configuration(
                    "strategy.enabled_strategies is empty".to_string(),
                ));
            }
            for (i, kind) in self.enabled_strategies.iter().enumerate() {
                if self.enabled_strategies[..i].contains(kind) {
                    return Err(EngineError::Configuration(format!(
                        "strategy.enabled_strategies lists {} twice",
                        kind
                    )));
                }
            }
            let n = self.enabled_strategies.len();
            if let Some(min) = self.min_strategy_votes {
                if min == 0 || min > n {
                    return Err(EngineError::Configuration(format!(
                        "strategy.min_strategy_votes must be within 1..={}, got {}",
                        n, min
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Per-strategy thresholds
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyThresholds {
    pub rsi_reversal: RsiReversalParams,
    pub macd_crossover: MacdCrossoverParams,
    pub bollinger_breakout: BollingerBreakoutParams,
    pub tie_breaker: TieBreakerParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RsiReversalParams {
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub stoch_oversold: f64,
    pub stoch_overbought: f64,
    pub williams_oversold: f64,
    pub williams_overbought: f64,
    /// Reversals are only taken while ADX stays below this ceiling
    pub adx_max: f64,
}

impl Default for RsiReversalParams {
    fn default() -> Self {
        Self {
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            stoch_oversold: 20.0,
            stoch_overbought: 80.0,
            williams_oversold: -80.0,
            williams_overbought: -20.0,
            adx_max: 40.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MacdCrossoverParams {
    pub cci_long_threshold: f64,
    pub cci_short_threshold: f64,
    pub roc_threshold: f64,
    /// Crossovers are only taken while ADX stays above this floor
    pub adx_min: f64,
}

impl Default for MacdCrossoverParams {
    fn default() -> Self {
        Self {
            cci_long_threshold: 0.0,
            cci_short_threshold: 0.0,
            roc_threshold: 0.0,
            adx_min: 20.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BollingerBreakoutParams {
    pub adx_strong: f64,
    pub momentum_threshold: f64,
    /// Minimum |close - mid| / mid to count as a significant move
    pub bb_distance_pct: f64,
}

impl Default for BollingerBreakoutParams {
    fn default() -> Self {
        Self {
            adx_strong: 25.0,
            momentum_threshold: 0.0,
            bb_distance_pct: 0.01,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TieBreakerParams {
    pub adx_threshold: f64,
    pub momentum_threshold: f64,
    /// Highest priority first
    pub priority: Vec<StrategyKind>,
}

impl Default for TieBreakerParams {
    fn default() -> Self {
        Self {
            adx_threshold: 25.0,
            momentum_threshold: 0.0,
            priority: vec![
                StrategyKind::EmaCrossover,
                StrategyKind::MacdCrossover,
                StrategyKind::BollingerBreakout,
                StrategyKind::RsiReversal,
            ],
        }
    }
}

/// Sizing and protective-level settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub capital: f64,
    /// Fraction of equity risked per trade (0.01 = 1%)
    pub risk_per_trade: f64,
    pub atr_sl_mult: f64,
    pub atr_tp_mult: f64,
    /// Realized loss per UTC day, as a fraction of capital, that blocks new entries
    pub max_daily_loss_pct: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            capital: 10_000.0,
            risk_per_trade: 0.01,
            atr_sl_mult: 1.5,
            atr_tp_mult: 2.0,
            max_daily_loss_pct: 0.02,
        }
    }
}

/// Simulated execution costs in price units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub simulate_spread: f64,
    pub simulate_slippage: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            simulate_spread: 0.0001,
            simulate_slippage: 0.00005,
        }
    }
}

impl Config {
    pub fn from_json_str(json: &str) -> EngineResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| EngineError::Configuration(format!("invalid config document: {}", e)))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Fail fast on settings the pipeline cannot honour
    pub fn validate(&self) -> EngineResult<()> {
        self.indicators.validate()?;
        self.strategy.validate()?;

        if self.strategies.tie_breaker.priority.is_empty()
            && self.strategy.tie_break_method == TieBreakMethod::Priority
        {
            return Err(EngineError::Configuration(
                "strategies.tie_breaker.priority is required by the priority tie-break"
                    .to_string(),
            ));
        }

        let risk = &self.risk;
        if !(risk.capital.is_finite() && risk.capital > 0.0) {
            return Err(EngineError::Configuration(format!(
                "risk.capital must be positive, got {}",
                risk.capital
            )));
        }
        for (name, value) in [
            ("risk_per_trade", risk.risk_per_trade),
            ("atr_sl_mult", risk.atr_sl_mult),
            ("atr_tp_mult", risk.atr_tp_mult),
            ("max_daily_loss_pct", risk.max_daily_loss_pct),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(EngineError::Configuration(format!(
                    "risk.{} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }

        let ex = &self.execution;
        for (name, value) in [
            ("simulate_spread", ex.simulate_spread),
            ("simulate_slippage", ex.simulate_slippage),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(EngineError::Configuration(format!(
                    "execution.{} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.strategy.min_votes(4), 3);
        assert_eq!(config.strategy.min_votes(3), 2);
        assert_eq!(config.strategy.participating().len(), 4);
    }

    #[test]
    fn test_partial_document_keeps_defaults() {
        let config = Config::from_json_str(
            r#"{"strategy": {"tie_break_method": "conservative"}, "warmup_bars": 5}"#,
        )
        .unwrap();
        assert_eq!(config.strategy.tie_break_method, TieBreakMethod::Conservative);
        assert_eq!(config.warmup_bars, 5);
        assert_eq!(config.indicators.rsi_period, 14);
        assert_eq!(config.risk.atr_tp_mult, 2.0);
    }

    #[test]
    fn test_unknown_strategy_name_is_configuration_error() {
        let err = Config::from_json_str(r#"{"strategy": {"enabled_strategies": ["ichimoku"]}}"#)
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn test_unknown_tie_break_method_is_configuration_error() {
        let err = Config::from_json_str(r#"{"strategy": {"tie_break_method": "coin_flip"}}"#)
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn test_min_votes_out_of_range() {
        let mut config = Config::default();
        config.strategy.min_strategy_votes = Some(5);
        assert!(matches!(
            config.validate(),
            Err(EngineError::Configuration(_))
        ));
        config.strategy.min_strategy_votes = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_period_rejected() {
        let mut config = Config::default();
        config.indicators.cci_period = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_single_strategy_mode_ignores_enabled_set() {
        let mut config = Config::default();
        config.strategy.combine_strategies = false;
        config.strategy.enabled_strategies.clear();
        config.strategy.active_strategy = StrategyKind::RsiReversal;
        assert!(config.validate().is_ok());
        assert_eq!(
            config.strategy.participating(),
            vec![StrategyKind::RsiReversal]
        );
    }

    #[test]
    fn test_longest_window() {
        let params = IndicatorParams::default();
        assert_eq!(params.longest_window(), 26);
        assert_eq!(IndicatorParams::fast_profile().ema_slow, 8);
    }
}
