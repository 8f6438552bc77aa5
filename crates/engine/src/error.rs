//! Error types for the signal engine

use thiserror::Error;

use crate::strategy::StrategyKind;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Empty, unordered or malformed bar sequence
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Missing or unusable configuration for a selected strategy or tie-break method
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A single strategy could not be evaluated
    #[error("Strategy {kind} failed: {source}")]
    StrategyEvaluation {
        kind: StrategyKind,
        #[source]
        source: StrategyError,
    },

    /// The simulator was handed a state it must never see
    #[error("Backtest invariant violated: {0}")]
    BacktestInvariant(String),

    /// Market data provider answered with an error or unusable payload
    #[error("Market data error: {0}")]
    MarketData(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Failure of one strategy evaluator. Never aborts a signal-generation pass.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StrategyError {
    #[error("parameter `{name}` is not usable: {value}")]
    InvalidParameter { name: &'static str, value: f64 },

    #[error("indicator frame is empty")]
    EmptyFrame,
}

impl From<ta::errors::TaError> for EngineError {
    fn from(err: ta::errors::TaError) -> Self {
        EngineError::Configuration(format!("indicator parameters rejected: {:?}", err))
    }
}
