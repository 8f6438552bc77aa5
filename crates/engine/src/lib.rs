//! Trading signal engine
//!
//! Deterministic batch pipeline over OHLCV bars:
//! - Technical indicators (EMA, RSI, MACD, ATR, Bollinger, Stochastic,
//!   Williams %R, ADX/DI, CCI, momentum, ROC)
//! - Four rule-based strategies combined by majority vote with tie-breaking
//! - Bar-by-bar backtest simulator with ATR stops, spread and slippage
//! - Performance statistics, reports and rule-based signal explanations
//! - Bar sources (JSON files, Binance public klines)

pub mod api;
pub mod combiner;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod explain;
pub mod indicators;
pub mod metrics;
pub mod pipeline;
pub mod risk;
pub mod source;
pub mod strategy;
pub mod types;

// Re-exports for convenience
pub use api::BinanceClient;
pub use combiner::{
    evaluate_all_strategies, generate_signals, SignalBar, SignalFrame, StrategyComparison,
    TieBreakMethod,
};
pub use config::Config;
pub use data::{normalize_bars, validate_bars};
pub use engine::{BacktestEngine, BacktestResult};
pub use error::{EngineError, EngineResult, StrategyError};
pub use explain::{
    explain_indicators, explain_signal, risk_warnings, Alignment, IndicatorExplanation, RiskLevel,
    RiskWarning, SignalExplanation,
};
pub use indicators::{compute_indicators, IndicatorFrame, IndicatorRow};
pub use metrics::{BacktestReport, BacktestStats, EquityMetrics};
pub use pipeline::{build_frame, run_backtest, run_signals};
pub use source::{BarSource, JsonFileSource};
pub use strategy::{StrategyKind, VoteCounts};
pub use types::*;
