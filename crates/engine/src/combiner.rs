//! Majority-vote signal combiner
//!
//! Runs the participating strategies over an indicator frame, tallies their
//! votes per bar and resolves each bar into one [`CombinedSignal`]. Split votes
//! go through the configured [`TieBreakMethod`]. Decisive bars get ATR-based
//! stop-loss and take-profit levels.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{Config, RiskConfig};
use crate::error::{EngineError, EngineResult};
use crate::indicators::{IndicatorFrame, IndicatorRow};
use crate::strategy::{StrategyKind, StrategyOutput, VoteCounts};
use crate::types::{CombinedSignal, Direction, StrategyVote};

// ============================================================================
// Tie-breaking
// ============================================================================

/// How an equal LONG/SHORT vote count is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreakMethod {
    /// Higher average score wins, averaged over every participating strategy
    #[default]
    Score,
    /// The highest-ranked strategy with a directional vote decides
    Priority,
    /// Follow +DI/-DI while ADX shows a trend
    AdxTrend,
    /// Follow the sign of momentum beyond a threshold
    Momentum,
    /// Never trade a tie
    Conservative,
}

impl std::fmt::Display for TieBreakMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TieBreakMethod::Score => "score",
            TieBreakMethod::Priority => "priority",
            TieBreakMethod::AdxTrend => "adx_trend",
            TieBreakMethod::Momentum => "momentum",
            TieBreakMethod::Conservative => "conservative",
        };
        f.write_str(name)
    }
}

/// Explicit strategy ranking, highest priority first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityTable {
    order: Vec<StrategyKind>,
}

impl PriorityTable {
    pub fn new(order: Vec<StrategyKind>) -> Self {
        Self { order }
    }

    /// Position in the ranking; unranked strategies come last
    pub fn rank(&self, kind: StrategyKind) -> usize {
        self.order
            .iter()
            .position(|k| *k == kind)
            .unwrap_or(self.order.len())
    }

    /// Best-ranked directional vote. Earlier votes win among equal ranks.
    pub fn pick<'a>(&self, votes: &'a [StrategyVote]) -> Option<&'a StrategyVote> {
        votes
            .iter()
            .filter(|v| !v.signal.is_neutral())
            .fold(None::<&'a StrategyVote>, |best, vote| match best {
                Some(b) if self.rank(b.strategy) <= self.rank(vote.strategy) => Some(b),
                _ => Some(vote),
            })
    }
}

/// A tie-break method bound to its parameters
#[derive(Debug, Clone)]
pub struct TieBreaker {
    pub method: TieBreakMethod,
    pub priority: PriorityTable,
    pub adx_threshold: f64,
    pub momentum_threshold: f64,
}

impl TieBreaker {
    pub fn from_config(config: &Config) -> Self {
        let tb = &config.strategies.tie_breaker;
        Self {
            method: config.strategy.tie_break_method,
            priority: PriorityTable::new(tb.priority.clone()),
            adx_threshold: tb.adx_threshold,
            momentum_threshold: tb.momentum_threshold,
        }
    }

    /// Resolve a tied bar into a direction and raw score
    pub fn resolve(&self, votes: &[StrategyVote], row: &IndicatorRow) -> (Direction, f64) {
        match self.method {
            TieBreakMethod::Score => {
                let n = votes.len().max(1) as f64;
                let side_avg = |side: Direction| {
                    votes
                        .iter()
                        .filter(|v| v.signal == side)
                        .map(|v| v.score)
                        .sum::<f64>()
                        / n
                };
                let long = side_avg(Direction::Long);
                let short = side_avg(Direction::Short);
                if long > short {
                    (Direction::Long, long)
                } else if short > long {
                    (Direction::Short, short)
                } else {
                    (Direction::Neutral, 0.0)
                }
            }
            TieBreakMethod::Priority => match self.priority.pick(votes) {
                Some(vote) => (vote.signal, vote.score),
                None => (Direction::Neutral, 0.0),
            },
            TieBreakMethod::AdxTrend => {
                if row.adx <= self.adx_threshold {
                    (Direction::Neutral, 0.0)
                } else if row.plus_di > row.minus_di {
                    (Direction::Long, row.adx / 100.0)
                } else if row.minus_di > row.plus_di {
                    (Direction::Short, row.adx / 100.0)
                } else {
                    (Direction::Neutral, 0.0)
                }
            }
            TieBreakMethod::Momentum => {
                let strength = (row.momentum.abs() / row.close()).clamp(0.0, 1.0);
                if row.momentum < -self.momentum_threshold {
                    (Direction::Short, strength)
                } else if row.momentum > self.momentum_threshold {
                    (Direction::Long, strength)
                } else {
                    (Direction::Neutral, 0.0)
                }
            }
            TieBreakMethod::Conservative => (Direction::Neutral, 0.0),
        }
    }
}

// ============================================================================
// Per-bar combination
// ============================================================================

/// Clamp into [0, 1]; NaN becomes 0
pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

/// ATR-based (stop_loss, take_profit) around the close
pub fn protective_levels(
    direction: Direction,
    row: &IndicatorRow,
    risk: &RiskConfig,
) -> Option<(f64, f64)> {
    let close = row.close();
    let sl_dist = risk.atr_sl_mult * row.atr;
    let tp_dist = risk.atr_tp_mult * row.atr;
    match direction {
        Direction::Long => Some((close - sl_dist, close + tp_dist)),
        Direction::Short => Some((close + sl_dist, close - tp_dist)),
        Direction::Neutral => None,
    }
}

/// Combine one bar's votes
pub fn combine_votes(
    votes: &[StrategyVote],
    row: &IndicatorRow,
    min_votes: usize,
    tie_breaker: &TieBreaker,
    risk: &RiskConfig,
) -> CombinedSignal {
    let counts = VoteCounts::tally(votes.iter().map(|v| v.signal));
    let is_tie = counts.long == counts.short && counts.long >= 1;

    let agreeing_mean = |side: Direction| {
        let scores: Vec<f64> = votes
            .iter()
            .filter(|v| v.signal == side)
            .map(|v| v.score)
            .collect();
        if scores.is_empty() {
            0.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        }
    };

    let (signal, score) = if counts.long >= min_votes && counts.long > counts.short {
        (Direction::Long, agreeing_mean(Direction::Long))
    } else if counts.short >= min_votes && counts.short > counts.long {
        (Direction::Short, agreeing_mean(Direction::Short))
    } else if is_tie {
        tie_breaker.resolve(votes, row)
    } else {
        (Direction::Neutral, 0.0)
    };

    finish(signal, score, counts, is_tie, row, risk)
}

fn finish(
    signal: Direction,
    score: f64,
    counts: VoteCounts,
    is_tie: bool,
    row: &IndicatorRow,
    risk: &RiskConfig,
) -> CombinedSignal {
    let levels = protective_levels(signal, row, risk);
    CombinedSignal {
        signal,
        score: if signal.is_neutral() { 0.0 } else { clamp_score(score) },
        stop_loss: levels.map(|l| l.0),
        take_profit: levels.map(|l| l.1),
        long_votes: counts.long,
        short_votes: counts.short,
        neutral_votes: counts.neutral,
        is_tie,
    }
}

// ============================================================================
// Signal frame
// ============================================================================

/// One bar with its combined decision and the votes behind it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalBar {
    pub row: IndicatorRow,
    pub combined: CombinedSignal,
    pub votes: Vec<StrategyVote>,
}

/// Output of a signal-generation pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalFrame {
    /// "combined" or the single active strategy's name
    pub label: String,
    pub participants: Vec<StrategyKind>,
    /// Strategies that failed and voted neutral throughout
    pub failed_strategies: Vec<StrategyKind>,
    pub bars: Vec<SignalBar>,
}

impl SignalFrame {
    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn decisive(&self) -> impl Iterator<Item = &SignalBar> {
        self.bars.iter().filter(|b| !b.combined.signal.is_neutral())
    }

    pub fn counts(&self) -> VoteCounts {
        VoteCounts::tally(self.bars.iter().map(|b| b.combined.signal))
    }

    pub fn ties(&self) -> usize {
        self.bars.iter().filter(|b| b.combined.is_tie).count()
    }
}

/// Run one strategy, reducing a failure to an all-neutral output
fn evaluate_isolated(
    kind: StrategyKind,
    frame: &IndicatorFrame,
    config: &Config,
) -> (StrategyOutput, Option<EngineError>) {
    match kind.evaluate(frame, config) {
        Ok(output) => (output, None),
        Err(source) => {
            let err = EngineError::StrategyEvaluation { kind, source };
            warn!(strategy = %kind, error = %err, "Strategy failed, counting it as neutral");
            (StrategyOutput::neutral(kind, frame.len()), Some(err))
        }
    }
}

/// Generate the combined signal for every bar of `frame`.
///
/// Fails only on configuration errors. A strategy that cannot be evaluated
/// votes NEUTRAL with score 0 on every bar.
pub fn generate_signals(frame: &IndicatorFrame, config: &Config) -> EngineResult<SignalFrame> {
    config.validate()?;

    let settings = &config.strategy;
    let participants = settings.participating();
    let combine = settings.combine_strategies;
    info!(
        bars = frame.len(),
        strategies = participants.len(),
        combine,
        tie_break = %settings.tie_break_method,
        "Generating signals"
    );

    let mut outputs = Vec::with_capacity(participants.len());
    let mut failed_strategies = Vec::new();
    for kind in &participants {
        let (output, err) = evaluate_isolated(*kind, frame, config);
        if err.is_some() {
            failed_strategies.push(*kind);
        }
        outputs.push(output);
    }

    let min_votes = settings.min_votes(participants.len());
    let tie_breaker = TieBreaker::from_config(config);

    let bars: Vec<SignalBar> = frame
        .rows()
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let votes: Vec<StrategyVote> = outputs.iter().map(|o| o.votes[i]).collect();
            let combined = if combine {
                combine_votes(&votes, row, min_votes, &tie_breaker, &config.risk)
            } else {
                let vote = votes[0];
                let counts = VoteCounts::tally([vote.signal]);
                finish(vote.signal, vote.score, counts, false, row, &config.risk)
            };
            SignalBar {
                row: row.clone(),
                combined,
                votes,
            }
        })
        .collect();

    let label = if combine {
        "combined".to_string()
    } else {
        settings.active_strategy.to_string()
    };
    let signal_frame = SignalFrame {
        label,
        participants,
        failed_strategies,
        bars,
    };

    let counts = signal_frame.counts();
    debug!(
        long = counts.long,
        short = counts.short,
        neutral = counts.neutral,
        ties = signal_frame.ties(),
        "Signals generated"
    );
    Ok(signal_frame)
}

// ============================================================================
// Strategy comparison
// ============================================================================

/// One strategy's standalone result over a frame
#[derive(Debug, Clone, Serialize)]
pub struct StrategyComparison {
    pub kind: StrategyKind,
    pub counts: VoteCounts,
    /// Set when the strategy failed and was replaced by neutral votes
    pub error: Option<String>,
    #[serde(skip)]
    pub output: StrategyOutput,
}

/// Run all four strategies regardless of the enabled set
pub fn evaluate_all_strategies(frame: &IndicatorFrame, config: &Config) -> Vec<StrategyComparison> {
    StrategyKind::ALL
        .into_iter()
        .map(|kind| {
            let (output, err) = evaluate_isolated(kind, frame, config);
            StrategyComparison {
                kind,
                counts: output.counts(),
                error: err.map(|e| e.to_string()),
                output,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::compute_indicators;
    use crate::types::Bar;
    use chrono::{Duration, TimeZone, Utc};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn make_row(close: f64) -> IndicatorRow {
        let ts = Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap();
        let mut row = IndicatorRow::neutral(Bar::new(ts, close, close + 1.0, close - 1.0, close));
        row.atr = 2.0;
        row
    }

    fn vote(strategy: StrategyKind, signal: Direction, score: f64) -> StrategyVote {
        StrategyVote {
            strategy,
            signal,
            score,
        }
    }

    fn tie_votes() -> Vec<StrategyVote> {
        vec![
            vote(StrategyKind::EmaCrossover, Direction::Long, 0.8),
            vote(StrategyKind::RsiReversal, Direction::Short, 0.4),
            vote(StrategyKind::MacdCrossover, Direction::Long, 0.6),
            vote(StrategyKind::BollingerBreakout, Direction::Short, 0.4),
        ]
    }

    fn breaker(method: TieBreakMethod) -> TieBreaker {
        let mut config = Config::default();
        config.strategy.tie_break_method = method;
        TieBreaker::from_config(&config)
    }

    fn combine(
        votes: &[StrategyVote],
        row: &IndicatorRow,
        method: TieBreakMethod,
    ) -> CombinedSignal {
        combine_votes(votes, row, 3, &breaker(method), &RiskConfig::default())
    }

    fn random_walk_bars(seed: u64, n: usize) -> Vec<Bar> {
        let mut rng = StdRng::seed_from_u64(seed);
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut price: f64 = 1.1000;
        (0..n)
            .map(|i| {
                let open = price;
                price += rng.gen_range(-0.002..0.002);
                let high = open.max(price) + rng.gen_range(0.0..0.001);
                let low = open.min(price) - rng.gen_range(0.0..0.001);
                Bar::new(start + Duration::minutes(5 * i as i64), open, high, low, price)
            })
            .collect()
    }

    #[test]
    fn test_conservative_tie_is_neutral() {
        let row = make_row(100.0);
        let combined = combine(&tie_votes(), &row, TieBreakMethod::Conservative);
        assert!(combined.is_tie);
        assert_eq!(combined.signal, Direction::Neutral);
        assert_eq!(combined.score, 0.0);
        assert_eq!(combined.stop_loss, None);
        assert_eq!(combined.take_profit, None);
        assert_eq!((combined.long_votes, combined.short_votes), (2, 2));
    }

    #[test]
    fn test_score_tie_break_averages_over_all_voters() {
        let row = make_row(100.0);
        let combined = combine(&tie_votes(), &row, TieBreakMethod::Score);
        assert_eq!(combined.signal, Direction::Long);
        // (0.8 + 0.6) / 4
        assert!((combined.score - 0.35).abs() < 1e-12);
    }

    #[test]
    fn test_score_tie_break_exact_equality_is_neutral() {
        let row = make_row(100.0);
        let votes = vec![
            vote(StrategyKind::EmaCrossover, Direction::Long, 0.5),
            vote(StrategyKind::RsiReversal, Direction::Short, 0.5),
        ];
        let combined = combine_votes(
            &votes,
            &row,
            2,
            &breaker(TieBreakMethod::Score),
            &RiskConfig::default(),
        );
        assert!(combined.is_tie);
        assert_eq!(combined.signal, Direction::Neutral);
    }

    #[test]
    fn test_priority_tie_break_uses_ranking() {
        let row = make_row(100.0);
        let votes = vec![
            vote(StrategyKind::RsiReversal, Direction::Long, 1.0),
            vote(StrategyKind::MacdCrossover, Direction::Short, 0.5),
            vote(StrategyKind::EmaCrossover, Direction::Neutral, 0.0),
            vote(StrategyKind::BollingerBreakout, Direction::Neutral, 0.0),
        ];
        let combined = combine(&votes, &row, TieBreakMethod::Priority);
        assert_eq!(combined.signal, Direction::Short);
        assert_eq!(combined.score, 0.5);

        let table = PriorityTable::new(vec![StrategyKind::RsiReversal]);
        assert_eq!(table.pick(&votes).unwrap().strategy, StrategyKind::RsiReversal);
        assert_eq!(table.rank(StrategyKind::EmaCrossover), 1);
    }

    #[test]
    fn test_adx_trend_tie_break() {
        let mut row = make_row(100.0);
        row.adx = 30.0;
        row.plus_di = 28.0;
        row.minus_di = 12.0;
        let combined = combine(&tie_votes(), &row, TieBreakMethod::AdxTrend);
        assert_eq!(combined.signal, Direction::Long);
        assert!((combined.score - 0.3).abs() < 1e-12);

        row.adx = 20.0;
        let combined = combine(&tie_votes(), &row, TieBreakMethod::AdxTrend);
        assert_eq!(combined.signal, Direction::Neutral);
    }

    #[test]
    fn test_momentum_tie_break() {
        let mut row = make_row(100.0);
        row.momentum = -2.0;
        let combined = combine(&tie_votes(), &row, TieBreakMethod::Momentum);
        assert_eq!(combined.signal, Direction::Short);
        assert!((combined.score - 0.02).abs() < 1e-12);

        row.momentum = 0.0;
        let combined = combine(&tie_votes(), &row, TieBreakMethod::Momentum);
        assert_eq!(combined.signal, Direction::Neutral);
    }

    #[test]
    fn test_clear_majority_and_levels() {
        let row = make_row(100.0);
        let votes = vec![
            vote(StrategyKind::EmaCrossover, Direction::Short, 0.8),
            vote(StrategyKind::RsiReversal, Direction::Short, 0.5),
            vote(StrategyKind::MacdCrossover, Direction::Short, 0.5),
            vote(StrategyKind::BollingerBreakout, Direction::Long, 1.0),
        ];
        let combined = combine(&votes, &row, TieBreakMethod::Score);
        assert_eq!(combined.signal, Direction::Short);
        assert!(!combined.is_tie);
        assert!((combined.score - 0.6).abs() < 1e-12);
        // atr 2.0, sl 1.5x, tp 2.0x
        assert_eq!(combined.stop_loss, Some(103.0));
        assert_eq!(combined.take_profit, Some(96.0));
    }

    #[test]
    fn test_below_min_votes_is_neutral() {
        let row = make_row(100.0);
        let votes = vec![
            vote(StrategyKind::EmaCrossover, Direction::Long, 0.8),
            vote(StrategyKind::RsiReversal, Direction::Long, 0.8),
            vote(StrategyKind::MacdCrossover, Direction::Neutral, 0.0),
            vote(StrategyKind::BollingerBreakout, Direction::Neutral, 0.0),
        ];
        let combined = combine(&votes, &row, TieBreakMethod::Score);
        assert_eq!(combined.signal, Direction::Neutral);
        assert!(!combined.is_tie);
        assert_eq!(combined.neutral_votes, 2);

        let relaxed = combine_votes(
            &votes,
            &row,
            2,
            &breaker(TieBreakMethod::Score),
            &RiskConfig::default(),
        );
        assert_eq!(relaxed.signal, Direction::Long);
    }

    #[test]
    fn test_clamp_score() {
        assert_eq!(clamp_score(f64::NAN), 0.0);
        assert_eq!(clamp_score(1.7), 1.0);
        assert_eq!(clamp_score(-0.2), 0.0);
    }

    #[test]
    fn test_generated_signals_hold_invariants() {
        let config = Config::default();
        let bars = random_walk_bars(42, 600);
        let frame = compute_indicators(&bars, &config.indicators)
            .unwrap()
            .skip_warmup(config.warmup_bars);
        let signals = generate_signals(&frame, &config).unwrap();

        assert_eq!(signals.len(), 500);
        assert_eq!(signals.label, "combined");
        for bar in &signals.bars {
            let c = &bar.combined;
            assert_eq!(c.long_votes + c.short_votes + c.neutral_votes, 4);
            assert_eq!(bar.votes.len(), 4);
            assert!((0.0..=1.0).contains(&c.score));
            let close = bar.row.close();
            match c.signal {
                Direction::Long => {
                    assert!(c.stop_loss.unwrap() < close);
                    assert!(c.take_profit.unwrap() > close);
                }
                Direction::Short => {
                    assert!(c.stop_loss.unwrap() > close);
                    assert!(c.take_profit.unwrap() < close);
                }
                Direction::Neutral => {
                    assert!(c.stop_loss.is_none() && c.take_profit.is_none());
                    assert_eq!(c.score, 0.0);
                }
            }
        }

        let again = generate_signals(&frame, &config).unwrap();
        assert_eq!(signals, again);
    }

    #[test]
    fn test_failed_strategy_votes_neutral() {
        let mut config = Config::default();
        config.strategies.bollinger_breakout.adx_strong = f64::INFINITY;
        let bars = random_walk_bars(3, 300);
        let frame = compute_indicators(&bars, &config.indicators)
            .unwrap()
            .skip_warmup(config.warmup_bars);

        let signals = generate_signals(&frame, &config).unwrap();
        assert_eq!(signals.failed_strategies, vec![StrategyKind::BollingerBreakout]);
        for bar in &signals.bars {
            let bb = bar
                .votes
                .iter()
                .find(|v| v.strategy == StrategyKind::BollingerBreakout)
                .unwrap();
            assert!(bb.signal.is_neutral());
            let c = &bar.combined;
            assert_eq!(c.long_votes + c.short_votes + c.neutral_votes, 4);
        }
    }

    #[test]
    fn test_single_strategy_mode_passes_vote_through() {
        let mut config = Config::default();
        config.strategy.combine_strategies = false;
        config.strategy.active_strategy = StrategyKind::MacdCrossover;
        let bars = random_walk_bars(11, 400);
        let frame = compute_indicators(&bars, &config.indicators)
            .unwrap()
            .skip_warmup(config.warmup_bars);

        let signals = generate_signals(&frame, &config).unwrap();
        let standalone = StrategyKind::MacdCrossover.evaluate(&frame, &config).unwrap();
        assert_eq!(signals.label, "macd_crossover");
        for (bar, vote) in signals.bars.iter().zip(&standalone.votes) {
            assert_eq!(bar.votes.len(), 1);
            assert_eq!(bar.combined.signal, vote.signal);
            assert_eq!(bar.combined.score, vote.score);
            assert!(!bar.combined.is_tie);
        }
    }

    #[test]
    fn test_evaluate_all_strategies_ignores_enabled_set() {
        let mut config = Config::default();
        config.strategy.enabled_strategies = vec![StrategyKind::EmaCrossover];
        let bars = random_walk_bars(5, 250);
        let frame = compute_indicators(&bars, &config.indicators).unwrap();

        let results = evaluate_all_strategies(&frame, &config);
        assert_eq!(results.len(), 4);
        for result in results {
            assert!(result.error.is_none());
            assert_eq!(result.counts.total(), 250);
        }
    }
}
