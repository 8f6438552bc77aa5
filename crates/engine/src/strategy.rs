//! Rule-based strategy evaluators
//!
//! Four independent strategies read the same [`IndicatorFrame`] and emit one
//! [`StrategyVote`] per bar. A strategy scores each bar as the fraction of its
//! sub-conditions that hold for the direction it calls. Neutral bars always
//! carry a zero score.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::Config;
use crate::error::StrategyError;
use crate::indicators::{IndicatorFrame, IndicatorRow};
use crate::types::{Direction, StrategyVote};

// ============================================================================
// Registry
// ============================================================================

/// The available strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    EmaCrossover,
    RsiReversal,
    MacdCrossover,
    BollingerBreakout,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 4] = [
        StrategyKind::EmaCrossover,
        StrategyKind::RsiReversal,
        StrategyKind::MacdCrossover,
        StrategyKind::BollingerBreakout,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StrategyKind::EmaCrossover => "ema_crossover",
            StrategyKind::RsiReversal => "rsi_reversal",
            StrategyKind::MacdCrossover => "macd_crossover",
            StrategyKind::BollingerBreakout => "bollinger_breakout",
        }
    }

    /// Number of sub-conditions behind the score denominator
    pub fn condition_count(self) -> usize {
        match self {
            StrategyKind::EmaCrossover => 5,
            StrategyKind::RsiReversal => 4,
            StrategyKind::MacdCrossover => 6,
            StrategyKind::BollingerBreakout => 5,
        }
    }

    /// Evaluate every bar of `frame`
    pub fn evaluate(
        self,
        frame: &IndicatorFrame,
        config: &Config,
    ) -> Result<StrategyOutput, StrategyError> {
        if frame.is_empty() {
            return Err(StrategyError::EmptyFrame);
        }
        self.check_parameters(config)?;

        let rows = frame.rows();
        let votes = (0..rows.len())
            .map(|i| self.conditions(rows, i, config).vote(self))
            .collect();
        Ok(StrategyOutput { kind: self, votes })
    }

    /// Sub-condition breakdown for bar `i`. Panics if `i` is out of range.
    pub fn conditions(self, rows: &[IndicatorRow], i: usize, config: &Config) -> BarConditions {
        match self {
            StrategyKind::EmaCrossover => ema_crossover(rows, i, config),
            StrategyKind::RsiReversal => rsi_reversal(rows, i, config),
            StrategyKind::MacdCrossover => macd_crossover(rows, i, config),
            StrategyKind::BollingerBreakout => bollinger_breakout(rows, i, config),
        }
    }

    fn check_parameters(self, config: &Config) -> Result<(), StrategyError> {
        let params: Vec<(&'static str, f64)> = match self {
            StrategyKind::EmaCrossover => {
                let st = &config.strategy;
                vec![
                    ("rsi_long_min", st.rsi_long_min),
                    ("rsi_short_max", st.rsi_short_max),
                    ("min_atr_pct", st.min_atr_pct),
                    ("regime_threshold", st.regime_threshold),
                ]
            }
            StrategyKind::RsiReversal => {
                let p = &config.strategies.rsi_reversal;
                vec![
                    ("rsi_oversold", p.rsi_oversold),
                    ("rsi_overbought", p.rsi_overbought),
                    ("stoch_oversold", p.stoch_oversold),
                    ("stoch_overbought", p.stoch_overbought),
                    ("williams_oversold", p.williams_oversold),
                    ("williams_overbought", p.williams_overbought),
                    ("adx_max", p.adx_max),
                ]
            }
            StrategyKind::MacdCrossover => {
                let p = &config.strategies.macd_crossover;
                vec![
                    ("cci_long_threshold", p.cci_long_threshold),
                    ("cci_short_threshold", p.cci_short_threshold),
                    ("roc_threshold", p.roc_threshold),
                    ("adx_min", p.adx_min),
                ]
            }
            StrategyKind::BollingerBreakout => {
                let p = &config.strategies.bollinger_breakout;
                vec![
                    ("adx_strong", p.adx_strong),
                    ("momentum_threshold", p.momentum_threshold),
                    ("bb_distance_pct", p.bb_distance_pct),
                ]
            }
        };

        match params.into_iter().find(|(_, value)| !value.is_finite()) {
            Some((name, value)) => Err(StrategyError::InvalidParameter { name, value }),
            None => Ok(()),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StrategyKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| format!("unknown strategy: {}", s))
    }
}

// ============================================================================
// Outputs
// ============================================================================

/// One sub-condition evaluated for both directions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConditionCheck {
    pub name: &'static str,
    pub long: bool,
    pub short: bool,
}

/// Everything a strategy decided about one bar
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BarConditions {
    pub checks: Vec<ConditionCheck>,
    pub enter_long: bool,
    pub enter_short: bool,
}

impl BarConditions {
    /// SHORT wins when both entry rules fire
    pub fn direction(&self) -> Direction {
        if self.enter_short {
            Direction::Short
        } else if self.enter_long {
            Direction::Long
        } else {
            Direction::Neutral
        }
    }

    /// Fraction of sub-conditions met for `direction`; 0 for neutral
    pub fn score_for(&self, direction: Direction) -> f64 {
        if self.checks.is_empty() {
            return 0.0;
        }
        let met = self
            .checks
            .iter()
            .filter(|c| match direction {
                Direction::Long => c.long,
                Direction::Short => c.short,
                Direction::Neutral => false,
            })
            .count();
        met as f64 / self.checks.len() as f64
    }

    pub fn vote(&self, kind: StrategyKind) -> StrategyVote {
        let signal = self.direction();
        StrategyVote {
            strategy: kind,
            signal,
            score: self.score_for(signal),
        }
    }
}

/// Per-bar votes of one strategy, aligned with the frame rows
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyOutput {
    pub kind: StrategyKind,
    pub votes: Vec<StrategyVote>,
}

impl StrategyOutput {
    /// All-neutral output, used in place of a failed strategy
    pub fn neutral(kind: StrategyKind, len: usize) -> Self {
        Self {
            kind,
            votes: vec![StrategyVote::neutral(kind); len],
        }
    }

    pub fn counts(&self) -> VoteCounts {
        VoteCounts::tally(self.votes.iter().map(|v| v.signal))
    }
}

/// LONG / SHORT / NEUTRAL tallies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VoteCounts {
    pub long: usize,
    pub short: usize,
    pub neutral: usize,
}

impl VoteCounts {
    pub fn tally(signals: impl IntoIterator<Item = Direction>) -> Self {
        let mut counts = Self::default();
        for signal in signals {
            match signal {
                Direction::Long => counts.long += 1,
                Direction::Short => counts.short += 1,
                Direction::Neutral => counts.neutral += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.long + self.short + self.neutral
    }
}

// ============================================================================
// Shared helpers
// ============================================================================

/// `a` moved above `b` on bar `i`; never true on the first bar
fn crosses_above(
    rows: &[IndicatorRow],
    i: usize,
    a: fn(&IndicatorRow) -> f64,
    b: fn(&IndicatorRow) -> f64,
) -> bool {
    i > 0 && a(&rows[i]) > b(&rows[i]) && a(&rows[i - 1]) <= b(&rows[i - 1])
}

/// `a` moved below `b` on bar `i`; never true on the first bar
fn crosses_below(
    rows: &[IndicatorRow],
    i: usize,
    a: fn(&IndicatorRow) -> f64,
    b: fn(&IndicatorRow) -> f64,
) -> bool {
    i > 0 && a(&rows[i]) < b(&rows[i]) && a(&rows[i - 1]) >= b(&rows[i - 1])
}

fn check(name: &'static str, long: bool, short: bool) -> ConditionCheck {
    ConditionCheck { name, long, short }
}

// ============================================================================
// EMA crossover
// ============================================================================

/// Trend entry on an EMA fast/slow cross, filtered by RSI, MACD, volatility
/// and a trending regime.
fn ema_crossover(rows: &[IndicatorRow], i: usize, config: &Config) -> BarConditions {
    let st = &config.strategy;
    let row = &rows[i];

    let cross_up = crosses_above(rows, i, |r| r.ema_fast, |r| r.ema_slow);
    let cross_down = crosses_below(rows, i, |r| r.ema_fast, |r| r.ema_slow);
    let rsi_long = row.rsi >= st.rsi_long_min;
    let rsi_short = row.rsi <= st.rsi_short_max;
    let (macd_long, macd_short) = if st.macd_confirm {
        (row.macd >= row.macd_signal, row.macd <= row.macd_signal)
    } else {
        (true, true)
    };
    let volatile = row.atr / row.close().abs() >= st.min_atr_pct;
    let trending = (row.ema_fast - row.ema_slow).abs() / row.close().abs() >= st.regime_threshold;

    BarConditions {
        enter_long: cross_up && rsi_long && macd_long && volatile && trending,
        enter_short: cross_down && rsi_short && macd_short && volatile && trending,
        checks: vec![
            check("ema_cross", cross_up, cross_down),
            check("rsi", rsi_long, rsi_short),
            check("macd", macd_long, macd_short),
            check("volatility", volatile, volatile),
            check("regime", trending, trending),
        ],
    }
}

// ============================================================================
// RSI reversal
// ============================================================================

/// Mean reversion out of oversold/overbought zones while the market ranges
fn rsi_reversal(rows: &[IndicatorRow], i: usize, config: &Config) -> BarConditions {
    let p = &config.strategies.rsi_reversal;
    let row = &rows[i];
    let prev_rsi = if i > 0 { Some(rows[i - 1].rsi) } else { None };

    let oversold_exit = row.rsi > p.rsi_oversold && prev_rsi.map_or(false, |r| r <= p.rsi_oversold);
    let overbought_exit =
        row.rsi < p.rsi_overbought && prev_rsi.map_or(false, |r| r >= p.rsi_overbought);

    let stoch_oversold = row.stoch_k < p.stoch_oversold;
    let stoch_overbought = row.stoch_k > p.stoch_overbought;
    let stoch_up = crosses_above(rows, i, |r| r.stoch_k, |r| r.stoch_d);
    let stoch_down = crosses_below(rows, i, |r| r.stoch_k, |r| r.stoch_d);

    let wr_oversold = row.williams_r < p.williams_oversold;
    let wr_overbought = row.williams_r > p.williams_overbought;
    let ranging = row.adx < p.adx_max;

    BarConditions {
        enter_long: (oversold_exit || (stoch_oversold && stoch_up)) && wr_oversold && ranging,
        enter_short: (overbought_exit || (stoch_overbought && stoch_down)) && wr_overbought && ranging,
        checks: vec![
            check("rsi_exit", oversold_exit, overbought_exit),
            check("stoch_cross", stoch_up, stoch_down),
            check("williams_r", wr_oversold, wr_overbought),
            check("adx_ranging", ranging, ranging),
        ],
    }
}

// ============================================================================
// MACD crossover
// ============================================================================

/// Trend entry on a MACD/signal cross with an expanding histogram
fn macd_crossover(rows: &[IndicatorRow], i: usize, config: &Config) -> BarConditions {
    let p = &config.strategies.macd_crossover;
    let row = &rows[i];

    let cross_up = crosses_above(rows, i, |r| r.macd, |r| r.macd_signal);
    let cross_down = crosses_below(rows, i, |r| r.macd, |r| r.macd_signal);
    let hist_rising = i > 0 && row.macd_hist > rows[i - 1].macd_hist;
    let hist_falling = i > 0 && row.macd_hist < rows[i - 1].macd_hist;
    let cci_bull = row.cci > p.cci_long_threshold;
    let cci_bear = row.cci < p.cci_short_threshold;
    let mom_up = row.momentum > 0.0;
    let mom_down = row.momentum < 0.0;
    let roc_up = row.roc > p.roc_threshold;
    let roc_down = row.roc < -p.roc_threshold;
    let trending = row.adx > p.adx_min;

    BarConditions {
        enter_long: cross_up && hist_rising && (cci_bull || mom_up) && trending,
        enter_short: cross_down && hist_falling && (cci_bear || mom_down) && trending,
        checks: vec![
            check("macd_cross", cross_up, cross_down),
            check("histogram", hist_rising, hist_falling),
            check("cci", cci_bull, cci_bear),
            check("momentum", mom_up, mom_down),
            check("roc", roc_up, roc_down),
            check("adx_trending", trending, trending),
        ],
    }
}

// ============================================================================
// Bollinger breakout
// ============================================================================

/// Breakout beyond the bands backed by a strong directional trend
fn bollinger_breakout(rows: &[IndicatorRow], i: usize, config: &Config) -> BarConditions {
    let p = &config.strategies.bollinger_breakout;
    let row = &rows[i];
    let close = row.close();
    let prev = if i > 0 { Some(&rows[i - 1]) } else { None };

    let above_upper = row.bb_upper.map_or(false, |u| close > u);
    let below_lower = row.bb_lower.map_or(false, |l| close < l);
    let upper_break = above_upper
        && prev.map_or(false, |pr| pr.bb_upper.map_or(false, |u| pr.close() <= u));
    let lower_break = below_lower
        && prev.map_or(false, |pr| pr.bb_lower.map_or(false, |l| pr.close() >= l));

    let strong = row.adx > p.adx_strong;
    let bullish_di = row.plus_di > row.minus_di;
    let bearish_di = row.minus_di > row.plus_di;
    let mom_long = row.momentum > p.momentum_threshold;
    let mom_short = row.momentum < -p.momentum_threshold;
    let significant = row
        .bb_mid
        .map_or(false, |mid| (close - mid).abs() / mid > p.bb_distance_pct);

    BarConditions {
        enter_long: (upper_break || above_upper) && strong && bullish_di && mom_long,
        enter_short: (lower_break || below_lower) && strong && bearish_di && mom_short,
        checks: vec![
            check("band_break", upper_break, lower_break),
            check("adx_strong", strong, strong),
            check("directional_index", bullish_di, bearish_di),
            check("momentum", mom_long, mom_short),
            check("band_distance", significant, significant),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::compute_indicators;
    use crate::types::Bar;
    use chrono::{Duration, TimeZone, Utc};

    fn make_row(minute: i64, close: f64) -> IndicatorRow {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap() + Duration::minutes(minute);
        IndicatorRow::neutral(Bar::new(ts, close, close + 0.5, close - 0.5, close))
    }

    fn frame(rows: Vec<IndicatorRow>) -> IndicatorFrame {
        IndicatorFrame::from_rows(rows)
    }

    #[test]
    fn test_strategy_names_round_trip() {
        for kind in StrategyKind::ALL {
            assert_eq!(kind.name().parse::<StrategyKind>().unwrap(), kind);
            assert_eq!(
                serde_json::to_string(&kind).unwrap(),
                format!("\"{}\"", kind.name())
            );
        }
        assert!("ichimoku".parse::<StrategyKind>().is_err());
    }

    #[test]
    fn test_flat_series_stays_neutral() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let bars: Vec<Bar> = (0..150)
            .map(|i| Bar::new(start + Duration::minutes(i), 100.0, 101.0, 99.0, 100.0))
            .collect();
        let config = Config::default();
        let frame = compute_indicators(&bars, &config.indicators).unwrap();

        for kind in StrategyKind::ALL {
            let output = kind.evaluate(&frame, &config).unwrap();
            assert_eq!(output.votes.len(), 150);
            assert!(
                output.votes.iter().all(|v| v.signal.is_neutral() && v.score == 0.0),
                "{} fired on a flat series",
                kind
            );
        }
    }

    #[test]
    fn test_ema_crossover_all_conditions_met() {
        let mut prev = make_row(0, 100.0);
        prev.ema_fast = 99.9;
        prev.ema_slow = 100.0;

        let mut cur = make_row(1, 100.0);
        cur.ema_fast = 100.5;
        cur.ema_slow = 100.0;
        cur.rsi = 55.0;
        cur.macd = 0.5;
        cur.macd_signal = 0.2;
        cur.atr = 1.0;

        let output = StrategyKind::EmaCrossover
            .evaluate(&frame(vec![prev, cur]), &Config::default())
            .unwrap();
        assert_eq!(output.votes[0].signal, Direction::Neutral);
        assert_eq!(output.votes[1].signal, Direction::Long);
        assert!((output.votes[1].score - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_ema_crossover_partial_score_short() {
        let mut prev = make_row(0, 100.0);
        prev.ema_fast = 100.2;
        prev.ema_slow = 100.0;

        let mut cur = make_row(1, 100.0);
        cur.ema_fast = 99.5;
        cur.ema_slow = 100.0;
        cur.rsi = 45.0;
        cur.macd = -0.3;
        cur.macd_signal = -0.1;
        cur.atr = 1.0;

        let conditions = StrategyKind::EmaCrossover.conditions(
            &[prev.clone(), cur.clone()],
            1,
            &Config::default(),
        );
        assert_eq!(conditions.direction(), Direction::Short);
        assert_eq!(conditions.score_for(Direction::Short), 1.0);

        // Without the volatility filter the cross is not taken
        cur.atr = 0.01;
        let conditions = StrategyKind::EmaCrossover.conditions(&[prev, cur], 1, &Config::default());
        assert_eq!(conditions.direction(), Direction::Neutral);
        assert!((conditions.score_for(Direction::Short) - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_rsi_reversal_long_on_oversold_exit() {
        let mut prev = make_row(0, 100.0);
        prev.rsi = 28.0;
        let mut cur = make_row(1, 100.0);
        cur.rsi = 32.0;
        cur.williams_r = -90.0;
        cur.adx = 18.0;

        let output = StrategyKind::RsiReversal
            .evaluate(&frame(vec![prev, cur]), &Config::default())
            .unwrap();
        assert_eq!(output.votes[1].signal, Direction::Long);
        // rsi exit, williams, adx met; no stochastic cross
        assert!((output.votes[1].score - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_rsi_reversal_blocked_in_trend() {
        let mut prev = make_row(0, 100.0);
        prev.rsi = 72.0;
        let mut cur = make_row(1, 100.0);
        cur.rsi = 68.0;
        cur.williams_r = -10.0;
        cur.adx = 45.0;

        let output = StrategyKind::RsiReversal
            .evaluate(&frame(vec![prev.clone(), cur.clone()]), &Config::default())
            .unwrap();
        assert_eq!(output.votes[1].signal, Direction::Neutral);

        cur.adx = 30.0;
        let output = StrategyKind::RsiReversal
            .evaluate(&frame(vec![prev, cur]), &Config::default())
            .unwrap();
        assert_eq!(output.votes[1].signal, Direction::Short);
    }

    #[test]
    fn test_macd_crossover_needs_trend() {
        let mut prev = make_row(0, 100.0);
        prev.macd = -0.1;
        prev.macd_signal = 0.0;
        prev.macd_hist = -0.1;

        let mut cur = make_row(1, 100.0);
        cur.macd = 0.2;
        cur.macd_signal = 0.05;
        cur.macd_hist = 0.15;
        cur.momentum = 1.0;
        cur.cci = -10.0;
        cur.roc = 0.5;
        cur.adx = 15.0;

        let rows = vec![prev, cur];
        let conditions = StrategyKind::MacdCrossover.conditions(&rows, 1, &Config::default());
        assert_eq!(conditions.direction(), Direction::Neutral);

        let mut rows = rows;
        rows[1].adx = 30.0;
        let output = StrategyKind::MacdCrossover
            .evaluate(&frame(rows), &Config::default())
            .unwrap();
        assert_eq!(output.votes[1].signal, Direction::Long);
        // cross, histogram, momentum, roc, adx met; cci failed
        assert!((output.votes[1].score - 5.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_bollinger_breakout_short() {
        let mut prev = make_row(0, 100.0);
        prev.bb_mid = Some(100.0);
        prev.bb_upper = Some(102.0);
        prev.bb_lower = Some(98.0);

        let mut cur = make_row(1, 96.0);
        cur.bb_mid = Some(100.0);
        cur.bb_upper = Some(102.0);
        cur.bb_lower = Some(98.0);
        cur.adx = 35.0;
        cur.plus_di = 10.0;
        cur.minus_di = 30.0;
        cur.momentum = -3.0;

        let output = StrategyKind::BollingerBreakout
            .evaluate(&frame(vec![prev, cur]), &Config::default())
            .unwrap();
        assert_eq!(output.votes[1].signal, Direction::Short);
        assert_eq!(output.votes[1].score, 1.0);
    }

    #[test]
    fn test_bollinger_ignores_undefined_bands() {
        let mut row = make_row(0, 150.0);
        row.bb_mid = None;
        row.bb_upper = None;
        row.bb_lower = None;
        row.adx = 50.0;
        row.plus_di = 40.0;
        row.minus_di = 5.0;
        row.momentum = 10.0;

        let output = StrategyKind::BollingerBreakout
            .evaluate(&frame(vec![row]), &Config::default())
            .unwrap();
        assert_eq!(output.votes[0].signal, Direction::Neutral);
    }

    #[test]
    fn test_short_wins_when_both_rules_fire() {
        let conditions = BarConditions {
            checks: vec![check("a", true, true), check("b", false, true)],
            enter_long: true,
            enter_short: true,
        };
        let vote = conditions.vote(StrategyKind::EmaCrossover);
        assert_eq!(vote.signal, Direction::Short);
        assert_eq!(vote.score, 1.0);
    }

    #[test]
    fn test_invalid_parameter_and_empty_frame() {
        let mut config = Config::default();
        config.strategies.macd_crossover.adx_min = f64::NAN;
        let rows = frame(vec![make_row(0, 100.0)]);

        let err = StrategyKind::MacdCrossover.evaluate(&rows, &config).unwrap_err();
        assert!(matches!(err, StrategyError::InvalidParameter { name: "adx_min", .. }));
        assert!(StrategyKind::EmaCrossover.evaluate(&rows, &config).is_ok());

        assert_eq!(
            StrategyKind::EmaCrossover
                .evaluate(&IndicatorFrame::default(), &config)
                .unwrap_err(),
            StrategyError::EmptyFrame
        );
    }

    #[test]
    fn test_scores_bounded_and_zero_when_neutral() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(7);
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut price: f64 = 100.0;
        let bars: Vec<Bar> = (0..400)
            .map(|i| {
                let open = price;
                price += rng.gen_range(-1.0..1.0);
                let high = open.max(price) + rng.gen_range(0.0..0.5);
                let low = open.min(price) - rng.gen_range(0.0..0.5);
                Bar::new(start + Duration::minutes(i), open, high, low, price)
            })
            .collect();
        let config = Config::default();
        let frame = compute_indicators(&bars, &config.indicators)
            .unwrap()
            .skip_warmup(config.warmup_bars);

        for kind in StrategyKind::ALL {
            let output = kind.evaluate(&frame, &config).unwrap();
            let counts = output.counts();
            assert_eq!(counts.total(), frame.len());
            for vote in &output.votes {
                assert!((0.0..=1.0).contains(&vote.score));
                if vote.signal.is_neutral() {
                    assert_eq!(vote.score, 0.0);
                }
            }
        }
    }
}
