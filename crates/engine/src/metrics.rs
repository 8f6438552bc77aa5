//! Backtest statistics and the external report shape

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

use crate::engine::BacktestResult;
use crate::types::{EquityPoint, ExitReason, TradeRecord, TradeSide, TradeStatus};

const PERIODS_PER_YEAR: f64 = 252.0;
const STD_EPSILON: f64 = 1e-9;
/// Stand-in for an infinite profit factor in rendered reports
pub const PROFIT_FACTOR_CAP: f64 = 999.99;
/// Upper bound on equity points handed to renderers
pub const MAX_CURVE_POINTS: usize = 100;

// ============================================================================
// Equity-curve metrics
// ============================================================================

/// Return-based metrics over the raw per-bar equity curve
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EquityMetrics {
    /// Total return as a fraction (last / first - 1)
    pub cagr: f64,
    pub sharpe: f64,
    pub sortino: f64,
    /// Deepest fall below the running peak as a fraction, never positive
    pub max_drawdown: f64,
    pub bars: usize,
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn population_std(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

/// Bar-over-bar percentage changes; the first bar reports 0
pub fn bar_returns(curve: &[EquityPoint]) -> Vec<f64> {
    curve
        .iter()
        .enumerate()
        .map(|(i, p)| {
            if i == 0 {
                0.0
            } else {
                let prev = curve[i - 1].equity;
                let r = p.equity / prev - 1.0;
                if r.is_finite() {
                    r
                } else {
                    0.0
                }
            }
        })
        .collect()
}

pub fn compute_equity_metrics(curve: &[EquityPoint]) -> EquityMetrics {
    let (first, last) = match (curve.first(), curve.last()) {
        (Some(f), Some(l)) => (f.equity, l.equity),
        _ => return EquityMetrics::default(),
    };

    let returns = bar_returns(curve);
    let avg = mean(&returns);
    let annual = PERIODS_PER_YEAR.sqrt();
    let sharpe = avg / (population_std(&returns) + STD_EPSILON) * annual;

    let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
    let sortino = if downside.is_empty() {
        0.0
    } else {
        avg / (population_std(&downside) + STD_EPSILON) * annual
    };

    let mut peak = f64::NEG_INFINITY;
    let mut max_drawdown = 0.0f64;
    for point in curve {
        peak = peak.max(point.equity);
        if peak > 0.0 {
            max_drawdown = max_drawdown.min(point.equity / peak - 1.0);
        }
    }

    EquityMetrics {
        cagr: if first != 0.0 { last / first - 1.0 } else { 0.0 },
        sharpe,
        sortino,
        max_drawdown,
        bars: curve.len(),
    }
}

// ============================================================================
// Trade statistics
// ============================================================================

/// Aggregate statistics over closed trades and the equity curve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestStats {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    /// Percent of closed trades with positive pnl
    pub win_rate: f64,
    pub total_pnl: f64,
    pub total_pnl_pct: f64,
    pub avg_pnl: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub best_trade: f64,
    pub worst_trade: f64,
    /// `f64::INFINITY` when there are profits and no losses; serialized as
    /// [`PROFIT_FACTOR_CAP`] since JSON has no infinity
    #[serde(serialize_with = "serialize_profit_factor")]
    pub profit_factor: f64,
    pub max_drawdown: f64,
    pub max_drawdown_pct: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    /// Total return of the equity curve in percent
    pub cagr: f64,
    pub avg_duration_minutes: f64,
    pub initial_capital: f64,
    pub final_equity: f64,
}

impl BacktestStats {
    fn empty(initial_capital: f64) -> Self {
        Self {
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            win_rate: 0.0,
            total_pnl: 0.0,
            total_pnl_pct: 0.0,
            avg_pnl: 0.0,
            avg_win: 0.0,
            avg_loss: 0.0,
            best_trade: 0.0,
            worst_trade: 0.0,
            profit_factor: 0.0,
            max_drawdown: 0.0,
            max_drawdown_pct: 0.0,
            sharpe_ratio: 0.0,
            sortino_ratio: 0.0,
            cagr: 0.0,
            avg_duration_minutes: 0.0,
            initial_capital,
            final_equity: initial_capital,
        }
    }
}

/// Infinite profit factors become [`PROFIT_FACTOR_CAP`]
pub fn capped_profit_factor(value: f64) -> f64 {
    if value.is_infinite() {
        PROFIT_FACTOR_CAP
    } else {
        value
    }
}

fn serialize_profit_factor<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(capped_profit_factor(*value))
}

/// gross_profit / gross_loss, +inf with no losses, 0 with neither
pub fn profit_factor(gross_profit: f64, gross_loss: f64) -> f64 {
    if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else if gross_profit > 0.0 {
        f64::INFINITY
    } else {
        0.0
    }
}

/// Compute statistics. OPEN trades are ignored; with no closed trades every
/// figure is zero and final equity equals the starting capital.
pub fn compute_stats(
    trades: &[TradeRecord],
    curve: &[EquityPoint],
    initial_capital: f64,
) -> BacktestStats {
    let closed: Vec<&TradeRecord> = trades.iter().filter(|t| t.is_closed()).collect();
    if closed.is_empty() {
        return BacktestStats::empty(initial_capital);
    }

    let pnls: Vec<f64> = closed.iter().map(|t| t.pnl).collect();
    let wins: Vec<f64> = pnls.iter().copied().filter(|p| *p > 0.0).collect();
    let losses: Vec<f64> = pnls.iter().copied().filter(|p| *p < 0.0).collect();
    let durations: Vec<f64> = closed.iter().filter_map(|t| t.duration_minutes).collect();

    let total_pnl: f64 = pnls.iter().sum();
    let gross_profit: f64 = wins.iter().sum();
    let gross_loss: f64 = losses.iter().sum::<f64>().abs();

    let metrics = compute_equity_metrics(curve);
    let final_equity = curve.last().map(|p| p.equity).unwrap_or(initial_capital);

    let mut peak = f64::NEG_INFINITY;
    let mut max_drawdown = 0.0f64;
    let mut max_drawdown_frac = 0.0f64;
    for point in curve {
        peak = peak.max(point.equity);
        let dd = point.equity - peak;
        max_drawdown = max_drawdown.min(dd);
        if peak > 0.0 {
            max_drawdown_frac = max_drawdown_frac.min(dd / peak);
        }
    }

    BacktestStats {
        total_trades: closed.len(),
        winning_trades: wins.len(),
        losing_trades: losses.len(),
        win_rate: wins.len() as f64 / closed.len() as f64 * 100.0,
        total_pnl,
        total_pnl_pct: total_pnl / initial_capital * 100.0,
        avg_pnl: mean(&pnls),
        avg_win: mean(&wins),
        avg_loss: mean(&losses),
        best_trade: pnls.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        worst_trade: pnls.iter().copied().fold(f64::INFINITY, f64::min),
        profit_factor: profit_factor(gross_profit, gross_loss),
        max_drawdown,
        max_drawdown_pct: max_drawdown_frac * 100.0,
        sharpe_ratio: metrics.sharpe,
        sortino_ratio: metrics.sortino,
        cagr: metrics.cagr * 100.0,
        avg_duration_minutes: mean(&durations),
        initial_capital,
        final_equity,
    }
}

// ============================================================================
// Report
// ============================================================================

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Every Nth point with N = max(1, len / max_points), in input order
pub fn downsample<T: Clone>(points: &[T], max_points: usize) -> Vec<T> {
    let step = (points.len() / max_points.max(1)).max(1);
    points.iter().step_by(step).cloned().collect()
}

/// Summary block with values rounded for display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub total_pnl_pct: f64,
    pub avg_pnl: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub best_trade: f64,
    pub worst_trade: f64,
    pub profit_factor: f64,
    pub max_drawdown: f64,
    pub max_drawdown_pct: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub cagr: f64,
    pub avg_duration_minutes: f64,
    pub initial_capital: f64,
    pub final_equity: f64,
}

impl From<&BacktestStats> for ReportSummary {
    fn from(s: &BacktestStats) -> Self {
        Self {
            total_trades: s.total_trades,
            winning_trades: s.winning_trades,
            losing_trades: s.losing_trades,
            win_rate: round_to(s.win_rate, 1),
            total_pnl: round_to(s.total_pnl, 2),
            total_pnl_pct: round_to(s.total_pnl_pct, 2),
            avg_pnl: round_to(s.avg_pnl, 2),
            avg_win: round_to(s.avg_win, 2),
            avg_loss: round_to(s.avg_loss, 2),
            best_trade: round_to(s.best_trade, 2),
            worst_trade: round_to(s.worst_trade, 2),
            profit_factor: round_to(capped_profit_factor(s.profit_factor), 2),
            max_drawdown: round_to(s.max_drawdown, 2),
            max_drawdown_pct: round_to(s.max_drawdown_pct, 2),
            sharpe_ratio: round_to(s.sharpe_ratio, 2),
            sortino_ratio: round_to(s.sortino_ratio, 2),
            cagr: round_to(s.cagr, 2),
            avg_duration_minutes: round_to(s.avg_duration_minutes, 1),
            initial_capital: s.initial_capital,
            final_equity: round_to(s.final_equity, 2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportTrade {
    pub id: u64,
    pub side: TradeSide,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_price: Option<f64>,
    pub units: f64,
    pub sl: f64,
    pub tp: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub exit_reason: Option<ExitReason>,
    pub duration_minutes: Option<f64>,
    pub status: TradeStatus,
}

impl From<&TradeRecord> for ReportTrade {
    fn from(t: &TradeRecord) -> Self {
        Self {
            id: t.trade_id,
            side: t.side,
            entry_time: t.entry_time,
            entry_price: round_to(t.entry_price, 4),
            exit_time: t.exit_time,
            exit_price: t.exit_price.map(|p| round_to(p, 4)),
            units: round_to(t.units, 4),
            sl: round_to(t.sl, 4),
            tp: round_to(t.tp, 4),
            pnl: round_to(t.pnl, 2),
            pnl_pct: round_to(t.pnl_pct, 2),
            exit_reason: t.exit_reason,
            duration_minutes: t.duration_minutes.map(|d| round_to(d, 1)),
            status: t.status,
        }
    }
}

/// Compact equity point: time, equity, drawdown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportPoint {
    pub t: DateTime<Utc>,
    pub e: f64,
    pub d: f64,
}

/// Backtest output shaped for external rendering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestReport {
    pub ticker: String,
    pub summary: ReportSummary,
    pub metrics: EquityMetrics,
    pub trades: Vec<ReportTrade>,
    pub equity_curve: Vec<ReportPoint>,
}

impl BacktestReport {
    pub fn build(ticker: &str, result: &BacktestResult) -> Self {
        let equity_curve = downsample(&result.equity_curve, MAX_CURVE_POINTS)
            .into_iter()
            .map(|p| ReportPoint {
                t: p.timestamp,
                e: round_to(p.equity, 2),
                d: round_to(p.drawdown, 2),
            })
            .collect();

        Self {
            ticker: ticker.to_string(),
            summary: ReportSummary::from(&result.stats),
            metrics: result.metrics.clone(),
            trades: result.trades.iter().map(ReportTrade::from).collect(),
            equity_curve,
        }
    }
}
