//! End-to-end entry points: bars in, signals or a backtest out

use tracing::debug;

use crate::combiner::{generate_signals, SignalFrame};
use crate::config::Config;
use crate::data::{normalize_bars, validate_bars};
use crate::engine::{BacktestEngine, BacktestResult};
use crate::error::EngineResult;
use crate::indicators::{compute_indicators, IndicatorFrame};
use crate::types::Bar;

/// Normalize and validate `bars`, compute indicators and drop the warmup
/// rows when the series is long enough
pub fn build_frame(bars: Vec<Bar>, config: &Config) -> EngineResult<IndicatorFrame> {
    config.validate()?;

    let bars = normalize_bars(bars);
    validate_bars(&bars)?;

    Ok(compute_indicators(&bars, &config.indicators)?.skip_warmup(config.warmup_bars))
}

/// [`build_frame`] followed by combined signal generation
pub fn run_signals(bars: Vec<Bar>, config: &Config) -> EngineResult<SignalFrame> {
    let frame = build_frame(bars, config)?;
    generate_signals(&frame, config)
}

/// [`run_signals`] followed by a simulation over the resulting frame
pub fn run_backtest(bars: Vec<Bar>, config: &Config) -> EngineResult<BacktestResult> {
    let signals = run_signals(bars, config)?;
    let result = BacktestEngine::run(config, &signals)?;
    debug!(
        bars = signals.len(),
        trades = result.trades.len(),
        final_equity = result.final_equity(),
        "Pipeline finished"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::types::Direction;
    use chrono::{Duration, TimeZone, Utc};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_walk_bars(seed: u64, n: usize) -> Vec<Bar> {
        let mut rng = StdRng::seed_from_u64(seed);
        let start = Utc.with_ymd_and_hms(2024, 5, 6, 0, 0, 0).unwrap();
        let mut price: f64 = 1.0850;
        (0..n)
            .map(|i| {
                let open = price;
                price += rng.gen_range(-0.0015..0.0015);
                let high = open.max(price) + rng.gen_range(0.0..0.0008);
                let low = open.min(price) - rng.gen_range(0.0..0.0008);
                Bar::new(start + Duration::minutes(15 * i as i64), open, high, low, price)
            })
            .collect()
    }

    #[test]
    fn test_run_signals_is_idempotent() {
        let config = Config::default();
        let bars = random_walk_bars(11, 400);
        let first = run_signals(bars.clone(), &config).unwrap();
        let second = run_signals(bars, &config).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 300);
    }

    #[test]
    fn test_unordered_input_matches_sorted() {
        let config = Config::default();
        let bars = random_walk_bars(12, 250);
        let mut shuffled = bars.clone();
        shuffled.reverse();
        assert_eq!(
            run_signals(bars, &config).unwrap(),
            run_signals(shuffled, &config).unwrap()
        );
    }

    #[test]
    fn test_short_series_keeps_warmup_rows() {
        let config = Config::default();
        let signals = run_signals(random_walk_bars(13, 60), &config).unwrap();
        assert_eq!(signals.len(), 60);
    }

    #[test]
    fn test_decisive_bars_carry_sided_levels() {
        let config = Config::default();
        let signals = run_signals(random_walk_bars(14, 1500), &config).unwrap();
        for bar in &signals.bars {
            let close = bar.row.close();
            match bar.combined.signal {
                Direction::Long => {
                    assert!(bar.combined.stop_loss.unwrap() < close);
                    assert!(bar.combined.take_profit.unwrap() > close);
                }
                Direction::Short => {
                    assert!(bar.combined.stop_loss.unwrap() > close);
                    assert!(bar.combined.take_profit.unwrap() < close);
                }
                Direction::Neutral => assert!(bar.combined.stop_loss.is_none()),
            }
        }
    }

    #[test]
    fn test_run_backtest_end_to_end() {
        let config = Config::default();
        let result = run_backtest(random_walk_bars(15, 800), &config).unwrap();
        assert_eq!(result.equity_curve.len(), 700);
        assert!(result.open_trades().count() <= 1);
        let closed = result.trades.iter().filter(|t| t.is_closed()).count();
        assert_eq!(result.stats.total_trades, closed);
    }

    #[test]
    fn test_empty_input_rejected() {
        let err = run_signals(Vec::new(), &Config::default()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[test]
    fn test_invalid_config_rejected_before_bars() {
        let mut config = Config::default();
        config.risk.capital = 0.0;
        let err = run_signals(random_walk_bars(16, 10), &config).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }
}
