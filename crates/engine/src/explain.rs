//! Rule-based signal explanations
//!
//! Builds a structured, deterministic account of one bar's decision: which
//! strategy conditions held, which risk warnings apply and an overall risk
//! grade. The payload is meant to feed an external text generator or to be
//! printed as is.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::combiner::SignalFrame;
use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::indicators::IndicatorRow;
use crate::strategy::{ConditionCheck, StrategyKind};
use crate::types::{Direction, StrategyVote};

const ADX_NO_TREND: f64 = 20.0;
const ADX_WEAK_TREND: f64 = 25.0;
const RSI_OVERBOUGHT: f64 = 70.0;
const RSI_OVERSOLD: f64 = 30.0;
const STOCH_OVERBOUGHT: f64 = 80.0;
const STOCH_OVERSOLD: f64 = 20.0;
const ATR_PCT_HIGH: f64 = 3.0;
const ATR_PCT_LOW: f64 = 0.3;
const RSI_EXTREME_LOW: f64 = 20.0;
const RSI_EXTREME_HIGH: f64 = 80.0;
const RSI_NEUTRAL_LOW: f64 = 40.0;
const RSI_NEUTRAL_HIGH: f64 = 60.0;
const ADX_MODERATE_TREND: f64 = 40.0;
const ADX_STRONG_TREND: f64 = 50.0;
const CCI_OVERSOLD: f64 = -100.0;
const CCI_OVERBOUGHT: f64 = 100.0;

/// Severity of a warning, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskWarning {
    pub code: &'static str,
    pub level: RiskLevel,
    pub message: String,
}

impl RiskWarning {
    fn new(code: &'static str, level: RiskLevel, message: String) -> Self {
        Self {
            code,
            level,
            message,
        }
    }
}

// ============================================================================
// Risk warnings
// ============================================================================

/// Evaluate the warning rules for a bar and a proposed direction, most
/// severe first
pub fn risk_warnings(
    row: &IndicatorRow,
    direction: Direction,
    votes: &[StrategyVote],
) -> Vec<RiskWarning> {
    let mut warnings = Vec::new();
    let long = direction == Direction::Long;
    let short = direction == Direction::Short;

    if row.adx < ADX_NO_TREND {
        warnings.push(RiskWarning::new(
            "ADX_NO_TREND",
            RiskLevel::High,
            format!("ADX at {:.2} shows no trend; trend signals are unreliable", row.adx),
        ));
    } else if row.adx < ADX_WEAK_TREND {
        warnings.push(RiskWarning::new(
            "ADX_WEAK_TREND",
            RiskLevel::Medium,
            format!("ADX at {:.2} shows only a weak trend", row.adx),
        ));
    }

    if !votes.is_empty() {
        let agreeing = votes.iter().filter(|v| v.signal == direction).count();
        if agreeing <= votes.len() / 2 {
            warnings.push(RiskWarning::new(
                "LOW_CONSENSUS",
                RiskLevel::Medium,
                format!(
                    "only {} of {} strategies vote {}",
                    agreeing,
                    votes.len(),
                    direction
                ),
            ));
        }
    }

    if (long && row.rsi > RSI_OVERBOUGHT) || (short && row.rsi < RSI_OVERSOLD) {
        warnings.push(RiskWarning::new(
            "RSI_CONTRADICTS",
            RiskLevel::High,
            format!("RSI at {:.2} contradicts a {} signal", row.rsi, direction),
        ));
    }

    if long || short {
        let ema_bullish = row.ema_fast > row.ema_slow;
        let macd_bullish = row.macd > row.macd_signal;
        if ema_bullish != macd_bullish {
            warnings.push(RiskWarning::new(
                "INDICATOR_DIVERGENCE",
                RiskLevel::Medium,
                format!(
                    "EMA trend is {} while MACD is {}",
                    if ema_bullish { "bullish" } else { "bearish" },
                    if macd_bullish { "bullish" } else { "bearish" }
                ),
            ));
        }
    }

    let atr_pct = if row.close() != 0.0 {
        row.atr / row.close() * 100.0
    } else {
        0.0
    };
    if atr_pct > ATR_PCT_HIGH {
        warnings.push(RiskWarning::new(
            "HIGH_VOLATILITY",
            RiskLevel::High,
            format!("ATR is {:.2}% of price; stops may trigger early", atr_pct),
        ));
    } else if atr_pct < ATR_PCT_LOW {
        warnings.push(RiskWarning::new(
            "LOW_VOLATILITY",
            RiskLevel::Low,
            format!("ATR is only {:.2}% of price; profit potential is limited", atr_pct),
        ));
    }

    if (long && row.stoch_k > STOCH_OVERBOUGHT) || (short && row.stoch_k < STOCH_OVERSOLD) {
        warnings.push(RiskWarning::new(
            "STOCH_EXHAUSTED",
            RiskLevel::Medium,
            format!("stochastic %K at {:.2} suggests the move is exhausted", row.stoch_k),
        ));
    }

    let against_trend = row.adx > ADX_WEAK_TREND
        && ((long && row.minus_di > row.plus_di) || (short && row.plus_di > row.minus_di));
    if against_trend {
        warnings.push(RiskWarning::new(
            "AGAINST_TREND",
            RiskLevel::Critical,
            format!(
                "{} signal against the prevailing trend (+DI {:.2}, -DI {:.2}, ADX {:.2})",
                direction, row.plus_di, row.minus_di, row.adx
            ),
        ));
    }

    // Stable sort keeps rule order within a level
    warnings.sort_by(|a, b| b.level.cmp(&a.level));
    warnings
}

// ============================================================================
// Indicator explanations
// ============================================================================

/// How an indicator reading relates to the proposed direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Alignment {
    Confirms,
    Contradicts,
    Neutral,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndicatorExplanation {
    pub name: &'static str,
    pub value: f64,
    pub interpretation: String,
    pub alignment: Alignment,
}

impl IndicatorExplanation {
    fn new(name: &'static str, value: f64, alignment: Alignment, interpretation: String) -> Self {
        Self {
            name,
            value,
            interpretation,
            alignment,
        }
    }
}

/// Symmetric rule: a bullish reading confirms LONG and contradicts SHORT,
/// a bearish one the reverse
fn align(direction: Direction, bullish: bool, bearish: bool) -> Alignment {
    let (confirms, contradicts) = match direction {
        Direction::Long => (bullish, bearish),
        Direction::Short => (bearish, bullish),
        Direction::Neutral => return Alignment::Neutral,
    };
    if confirms {
        Alignment::Confirms
    } else if contradicts {
        Alignment::Contradicts
    } else {
        Alignment::Neutral
    }
}

fn explain_rsi(row: &IndicatorRow, direction: Direction) -> IndicatorExplanation {
    let rsi = row.rsi;
    let zone = if rsi <= RSI_EXTREME_LOW {
        "extremely oversold, rebounds often follow"
    } else if rsi <= RSI_OVERSOLD {
        "oversold, selling pressure may be exhausted"
    } else if rsi >= RSI_EXTREME_HIGH {
        "extremely overbought, corrections often follow"
    } else if rsi >= RSI_OVERBOUGHT {
        "overbought, buying pressure may be exhausted"
    } else if rsi < RSI_NEUTRAL_LOW {
        "neutral with a slight bearish lean"
    } else if rsi > RSI_NEUTRAL_HIGH {
        "neutral with a slight bullish lean"
    } else {
        "neutral, momentum is balanced"
    };
    IndicatorExplanation::new(
        "RSI",
        rsi,
        align(direction, rsi <= RSI_OVERSOLD, rsi >= RSI_OVERBOUGHT),
        format!("RSI at {:.2}: {}", rsi, zone),
    )
}

fn explain_macd(row: &IndicatorRow, direction: Direction) -> IndicatorExplanation {
    let (macd, signal, hist) = (row.macd, row.macd_signal, row.macd_hist);
    let interpretation = if macd > signal {
        format!(
            "MACD {:.6} above signal {:.6}, histogram {:.6}: bullish momentum",
            macd, signal, hist
        )
    } else if macd < signal {
        format!(
            "MACD {:.6} below signal {:.6}, histogram {:.6}: bearish momentum",
            macd, signal, hist
        )
    } else {
        format!("MACD {:.6} equals its signal line: indecision", macd)
    };
    // Confirmation needs the histogram to agree; a cross alone is only a transition
    let alignment = match direction {
        Direction::Long if macd > signal && hist > 0.0 => Alignment::Confirms,
        Direction::Long if macd < signal => Alignment::Contradicts,
        Direction::Short if macd < signal && hist < 0.0 => Alignment::Confirms,
        Direction::Short if macd > signal => Alignment::Contradicts,
        _ => Alignment::Neutral,
    };
    IndicatorExplanation::new("MACD", macd, alignment, interpretation)
}

fn explain_adx(row: &IndicatorRow, direction: Direction) -> IndicatorExplanation {
    let adx = row.adx;
    let strength = if adx < ADX_NO_TREND {
        "no trend, ranging market"
    } else if adx < ADX_WEAK_TREND {
        "very weak trend"
    } else if adx < ADX_MODERATE_TREND {
        "moderate trend"
    } else if adx < ADX_STRONG_TREND {
        "strong trend"
    } else {
        "very strong trend, watch for exhaustion"
    };
    let bias = if row.plus_di > row.minus_di {
        "bullish"
    } else {
        "bearish"
    };
    let alignment = match direction {
        Direction::Neutral => Alignment::Neutral,
        _ if adx < ADX_NO_TREND => Alignment::Contradicts,
        Direction::Long if row.plus_di > row.minus_di => Alignment::Confirms,
        Direction::Short if row.minus_di > row.plus_di => Alignment::Confirms,
        _ => Alignment::Contradicts,
    };
    IndicatorExplanation::new(
        "ADX",
        adx,
        alignment,
        format!(
            "ADX at {:.2}: {}; {} bias (+DI {:.2}, -DI {:.2})",
            adx, strength, bias, row.plus_di, row.minus_di
        ),
    )
}

fn explain_ema(row: &IndicatorRow, direction: Direction) -> IndicatorExplanation {
    let (fast, slow, close) = (row.ema_fast, row.ema_slow, row.close());
    let diff = fast - slow;
    let diff_pct = if slow != 0.0 { diff / slow * 100.0 } else { 0.0 };
    let trend = if fast > slow {
        "fast EMA above slow, short-term uptrend"
    } else if fast < slow {
        "fast EMA below slow, short-term downtrend"
    } else {
        "EMAs converged, possible consolidation"
    };
    let price = if close > fast && close > slow {
        "price above both EMAs"
    } else if close < fast && close < slow {
        "price below both EMAs"
    } else {
        "price between the EMAs"
    };
    let alignment = match direction {
        Direction::Long if fast > slow => Alignment::Confirms,
        Direction::Short if fast < slow => Alignment::Confirms,
        Direction::Neutral => Alignment::Neutral,
        _ => Alignment::Contradicts,
    };
    IndicatorExplanation::new(
        "EMA",
        diff,
        alignment,
        format!("{} ({:+.3}%), {}", trend, diff_pct, price),
    )
}

fn explain_stochastic(row: &IndicatorRow, direction: Direction) -> IndicatorExplanation {
    let (k, d) = (row.stoch_k, row.stoch_d);
    let oversold = k <= STOCH_OVERSOLD;
    let overbought = k >= STOCH_OVERBOUGHT;
    let zone = if oversold {
        "oversold"
    } else if overbought {
        "overbought"
    } else {
        "neutral"
    };
    let cross = if k > d {
        "%K above %D"
    } else if k < d {
        "%K below %D"
    } else {
        "no %K/%D cross"
    };
    // An extreme zone only confirms once %K has turned
    let alignment = match direction {
        Direction::Long if oversold && k > d => Alignment::Confirms,
        Direction::Long if overbought => Alignment::Contradicts,
        Direction::Short if overbought && k < d => Alignment::Confirms,
        Direction::Short if oversold => Alignment::Contradicts,
        _ => Alignment::Neutral,
    };
    IndicatorExplanation::new(
        "Stochastic",
        k,
        alignment,
        format!("%K {:.2}, %D {:.2}: {}, {}", k, d, zone, cross),
    )
}

fn explain_atr(row: &IndicatorRow) -> IndicatorExplanation {
    let atr_pct = if row.close() != 0.0 {
        row.atr / row.close() * 100.0
    } else {
        0.0
    };
    let volatility = match atr_pct {
        p if p < 0.5 => "very low",
        p if p < 1.0 => "low",
        p if p < 2.0 => "moderate",
        p if p < 3.0 => "high",
        _ => "very high",
    };
    IndicatorExplanation::new(
        "ATR",
        row.atr,
        Alignment::Neutral,
        format!("ATR {:.5} ({:.2}% of price): {} volatility", row.atr, atr_pct, volatility),
    )
}

fn explain_cci(row: &IndicatorRow, direction: Direction) -> IndicatorExplanation {
    let cci = row.cci;
    let zone = if cci <= CCI_OVERSOLD {
        "price well below its typical mean"
    } else if cci >= CCI_OVERBOUGHT {
        "price well above its typical mean"
    } else {
        "price near its typical mean"
    };
    IndicatorExplanation::new(
        "CCI",
        cci,
        align(direction, cci <= CCI_OVERSOLD, cci >= CCI_OVERBOUGHT),
        format!("CCI at {:.2}: {}", cci, zone),
    )
}

fn explain_momentum(row: &IndicatorRow, direction: Direction) -> IndicatorExplanation {
    let momentum = row.momentum;
    let change = if momentum > 0.0 {
        "price higher than the lookback close"
    } else if momentum < 0.0 {
        "price lower than the lookback close"
    } else {
        "price unchanged over the lookback"
    };
    // Flat momentum backs neither side
    let alignment = match direction {
        Direction::Long if momentum > 0.0 => Alignment::Confirms,
        Direction::Short if momentum < 0.0 => Alignment::Confirms,
        Direction::Neutral => Alignment::Neutral,
        _ => Alignment::Contradicts,
    };
    IndicatorExplanation::new(
        "Momentum",
        momentum,
        alignment,
        format!("momentum {:+.5}: {}", momentum, change),
    )
}

fn explain_bollinger(row: &IndicatorRow, direction: Direction) -> Option<IndicatorExplanation> {
    let (upper, mid, lower) = (row.bb_upper?, row.bb_mid?, row.bb_lower?);
    let close = row.close();
    let width = upper - lower;
    let width_pct = if mid != 0.0 { width / mid * 100.0 } else { 0.0 };
    let position = if close > upper {
        "above the upper band, bullish breakout"
    } else if close < lower {
        "below the lower band, bearish breakout"
    } else if close > mid {
        "between the middle and upper band"
    } else if close < mid {
        "between the middle and lower band"
    } else {
        "on the middle band"
    };
    Some(IndicatorExplanation::new(
        "Bollinger",
        width,
        align(direction, close > upper, close < lower),
        format!("close {:.5} {}; band width {:.2}%", close, position, width_pct),
    ))
}

/// Read each indicator on `row` against `direction`. Bollinger is omitted
/// until its bands exist.
pub fn explain_indicators(row: &IndicatorRow, direction: Direction) -> Vec<IndicatorExplanation> {
    let mut explanations = vec![
        explain_rsi(row, direction),
        explain_macd(row, direction),
        explain_adx(row, direction),
        explain_ema(row, direction),
        explain_stochastic(row, direction),
        explain_atr(row),
        explain_cci(row, direction),
        explain_momentum(row, direction),
    ];
    explanations.extend(explain_bollinger(row, direction));
    explanations
}

// ============================================================================
// Vote explanations
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoteExplanation {
    pub strategy: StrategyKind,
    pub vote: Direction,
    pub score: f64,
    pub conditions_met: Vec<&'static str>,
    pub conditions_failed: Vec<&'static str>,
    pub reasoning: String,
}

/// Break a vote on bar `i` of `rows` down into met and failed conditions.
///
/// A neutral vote is explained against the side that came closest.
pub fn explain_vote(
    vote: &StrategyVote,
    rows: &[IndicatorRow],
    i: usize,
    config: &Config,
) -> VoteExplanation {
    let conditions = vote.strategy.conditions(rows, i, config);
    let side = match vote.signal {
        Direction::Neutral => {
            if conditions.score_for(Direction::Short) > conditions.score_for(Direction::Long) {
                Direction::Short
            } else {
                Direction::Long
            }
        }
        directional => directional,
    };

    let (met, failed): (Vec<&ConditionCheck>, Vec<&ConditionCheck>) = conditions
        .checks
        .iter()
        .partition(|c| if side == Direction::Long { c.long } else { c.short });
    let conditions_met: Vec<&'static str> = met.iter().map(|c| c.name).collect();
    let conditions_failed: Vec<&'static str> = failed.iter().map(|c| c.name).collect();
    let total = conditions.checks.len();

    let reasoning = if vote.signal.is_neutral() {
        format!(
            "{} stayed NEUTRAL; closest was {} with {}/{} conditions",
            vote.strategy,
            side,
            conditions_met.len(),
            total
        )
    } else {
        format!(
            "{} voted {} with {}/{} conditions met (score {:.2})",
            vote.strategy,
            vote.signal,
            conditions_met.len(),
            total,
            vote.score
        )
    };

    VoteExplanation {
        strategy: vote.strategy,
        vote: vote.signal,
        score: vote.score,
        conditions_met,
        conditions_failed,
        reasoning,
    }
}

// ============================================================================
// Signal explanation
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalExplanation {
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub price: f64,
    pub confidence: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub risk_reward_ratio: Option<f64>,
    pub votes: Vec<VoteExplanation>,
    pub indicators: Vec<IndicatorExplanation>,
    pub confirming: usize,
    pub contradicting: usize,
    pub warnings: Vec<RiskWarning>,
    pub overall_risk: RiskLevel,
    pub summary: String,
    pub recommendation: String,
    pub disclaimer: String,
}

/// |tp - price| / |price - sl|; 0 when the stop sits on the price
pub fn risk_reward(price: f64, stop_loss: Option<f64>, take_profit: Option<f64>) -> Option<f64> {
    match (stop_loss, take_profit) {
        (Some(sl), Some(tp)) if price != 0.0 => {
            let sl_dist = (price - sl).abs();
            Some(if sl_dist > 0.0 {
                (tp - price).abs() / sl_dist
            } else {
                0.0
            })
        }
        _ => None,
    }
}

fn recommendation(direction: Direction, risk: RiskLevel, warnings: usize, rr: Option<f64>) -> String {
    if direction.is_neutral() {
        return "Do not trade; wait for clearer conditions".to_string();
    }
    let rr_note = rr
        .map(|r| format!(" R:R = 1:{:.2}", r))
        .unwrap_or_default();
    match risk {
        RiskLevel::Critical => format!(
            "Avoid this trade: {} warnings including a critical one",
            warnings
        ),
        RiskLevel::High => format!(
            "High caution: consider halving the position or waiting.{}",
            rr_note
        ),
        RiskLevel::Medium => format!(
            "Proceed with caution and respect the stop-loss.{}",
            rr_note
        ),
        RiskLevel::Low => format!("Favourable conditions with controlled risk.{}", rr_note),
    }
}

fn disclaimer(risk: RiskLevel, warnings: usize) -> String {
    let base = "Automatically generated analysis with inherent limitations.";
    if risk >= RiskLevel::High {
        format!(
            "{} {} risk factors were detected and may invalidate this signal. \
             Past performance does not guarantee future results; consider not trading \
             or reducing exposure.",
            base, warnings
        )
    } else {
        format!(
            "{} Technical indicators can produce false signals, especially around news \
             or unusual market conditions. Past performance does not guarantee future \
             results; only trade capital you can afford to lose.",
            base
        )
    }
}

/// Explain bar `index` of a signal frame
pub fn explain_signal(
    signals: &SignalFrame,
    index: usize,
    config: &Config,
) -> EngineResult<SignalExplanation> {
    let bar = signals.bars.get(index).ok_or_else(|| {
        EngineError::InvalidInput(format!(
            "bar index {} out of range for {} bars",
            index,
            signals.len()
        ))
    })?;

    // Conditions only look one bar back
    let (rows, i) = if index > 0 {
        (vec![signals.bars[index - 1].row.clone(), bar.row.clone()], 1)
    } else {
        (vec![bar.row.clone()], 0)
    };

    let combined = &bar.combined;
    let direction = combined.signal;
    let price = bar.row.close();

    let votes: Vec<VoteExplanation> = bar
        .votes
        .iter()
        .map(|v| explain_vote(v, &rows, i, config))
        .collect();
    let indicators = explain_indicators(&bar.row, direction);
    let confirming = indicators
        .iter()
        .filter(|e| e.alignment == Alignment::Confirms)
        .count();
    let contradicting = indicators
        .iter()
        .filter(|e| e.alignment == Alignment::Contradicts)
        .count();
    let warnings = risk_warnings(&bar.row, direction, &bar.votes);
    let overall_risk = warnings
        .iter()
        .map(|w| w.level)
        .max()
        .unwrap_or(RiskLevel::Low);
    let rr = risk_reward(price, combined.stop_loss, combined.take_profit);

    let summary = if direction.is_neutral() {
        format!(
            "NEUTRAL: no trade, strategies did not reach consensus ({} warnings)",
            warnings.len()
        )
    } else {
        let agreeing = bar.votes.iter().filter(|v| v.signal == direction).count();
        format!(
            "{} | consensus {}/{} strategies | indicators: {} confirm, {} contradict | {} warnings | risk {}",
            direction,
            agreeing,
            bar.votes.len(),
            confirming,
            contradicting,
            warnings.len(),
            overall_risk
        )
    };

    Ok(SignalExplanation {
        timestamp: bar.row.bar.timestamp,
        direction,
        price,
        confidence: combined.score,
        stop_loss: combined.stop_loss,
        take_profit: combined.take_profit,
        risk_reward_ratio: rr,
        recommendation: recommendation(direction, overall_risk, warnings.len(), rr),
        disclaimer: disclaimer(overall_risk, warnings.len()),
        votes,
        indicators,
        confirming,
        contradicting,
        warnings,
        overall_risk,
        summary,
    })
}
