//! Bar-by-bar backtesting engine
//!
//! Walks a [`SignalFrame`] in time order with at most one open position.
//! Each bar runs exit check, then entry check, then equity recording. Equity
//! only moves on realized PnL.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::combiner::{SignalBar, SignalFrame};
use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::metrics::{compute_equity_metrics, compute_stats, BacktestStats, EquityMetrics};
use crate::risk::{position_size, DailyLossGuard};
use crate::types::*;

/// Position state during simulation
#[derive(Debug, Clone, Copy)]
struct OpenPosition {
    trade_id: u64,
    side: TradeSide,
    entry_time: DateTime<Utc>,
    entry_price: f64,
    units: f64,
    sl: f64,
    tp: f64,
}

impl OpenPosition {
    /// Exit level hit on this bar, stop-loss checked first
    fn exit_hit(&self, bid: f64, ask: f64) -> Option<(f64, ExitReason)> {
        match self.side {
            TradeSide::Long => {
                if bid <= self.sl {
                    Some((self.sl, ExitReason::StopLoss))
                } else if bid >= self.tp {
                    Some((self.tp, ExitReason::TakeProfit))
                } else {
                    None
                }
            }
            TradeSide::Short => {
                if ask >= self.sl {
                    Some((self.sl, ExitReason::StopLoss))
                } else if ask <= self.tp {
                    Some((self.tp, ExitReason::TakeProfit))
                } else {
                    None
                }
            }
        }
    }

    fn pnl_at(&self, exit_price: f64) -> f64 {
        match self.side {
            TradeSide::Long => (exit_price - self.entry_price) * self.units,
            TradeSide::Short => (self.entry_price - exit_price) * self.units,
        }
    }
}

/// Trade list storage: records in open order, open ones indexed by id
#[derive(Debug, Default)]
struct TradeBook {
    records: Vec<TradeRecord>,
    open: HashMap<u64, usize>,
}

impl TradeBook {
    fn open(&mut self, record: TradeRecord) {
        self.open.insert(record.trade_id, self.records.len());
        self.records.push(record);
    }

    fn close(
        &mut self,
        trade_id: u64,
        exit_time: DateTime<Utc>,
        exit_price: f64,
        pnl: f64,
        reason: ExitReason,
    ) -> EngineResult<&TradeRecord> {
        let idx = self.open.remove(&trade_id).ok_or_else(|| {
            EngineError::BacktestInvariant(format!("trade {} is not open", trade_id))
        })?;
        let trade = &mut self.records[idx];
        let notional = trade.entry_price * trade.units;
        trade.exit_time = Some(exit_time);
        trade.exit_price = Some(exit_price);
        trade.pnl = pnl;
        trade.pnl_pct = if notional > 0.0 { pnl / notional * 100.0 } else { 0.0 };
        trade.exit_reason = Some(reason);
        trade.duration_minutes =
            Some((exit_time - trade.entry_time).num_milliseconds() as f64 / 60_000.0);
        trade.status = TradeStatus::Closed;
        Ok(trade)
    }
}

/// Everything a backtest run produces
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BacktestResult {
    pub initial_capital: f64,
    pub trades: Vec<TradeRecord>,
    pub equity_curve: Vec<EquityPoint>,
    pub stats: BacktestStats,
    pub metrics: EquityMetrics,
}

impl BacktestResult {
    pub fn final_equity(&self) -> f64 {
        self.equity_curve
            .last()
            .map(|p| p.equity)
            .unwrap_or(self.initial_capital)
    }

    pub fn open_trades(&self) -> impl Iterator<Item = &TradeRecord> {
        self.trades.iter().filter(|t| !t.is_closed())
    }
}

/// Stop-loss and take-profit of a decisive bar; errors when either level or
/// the ATR is missing or non-finite
fn entry_levels(bar: &SignalBar, ts: DateTime<Utc>) -> EngineResult<(f64, f64)> {
    let signal = bar.combined.signal;
    let (sl, tp) = match (bar.combined.stop_loss, bar.combined.take_profit) {
        (Some(sl), Some(tp)) if sl.is_finite() && tp.is_finite() => (sl, tp),
        _ => {
            return Err(EngineError::BacktestInvariant(format!(
                "{} signal at {} has no usable stop-loss/take-profit",
                signal, ts
            )))
        }
    };
    if !bar.row.atr.is_finite() {
        return Err(EngineError::BacktestInvariant(format!(
            "{} signal at {} has a non-finite ATR",
            signal, ts
        )));
    }
    Ok((sl, tp))
}

/// Backtesting engine that simulates bar-by-bar execution
pub struct BacktestEngine;

impl BacktestEngine {
    /// Run a backtest over the given signal stream
    pub fn run(config: &Config, signals: &SignalFrame) -> EngineResult<BacktestResult> {
        let risk = &config.risk;
        let half_spread = config.execution.simulate_spread / 2.0;
        let slippage = config.execution.simulate_slippage;

        let initial_capital = risk.capital;
        let mut equity = initial_capital;
        let mut position: Option<OpenPosition> = None;
        let mut book = TradeBook::default();
        let mut guard = DailyLossGuard::new(risk);
        let mut trade_counter: u64 = 0;
        let mut equity_curve: Vec<EquityPoint> = Vec::with_capacity(signals.len());

        info!(
            bars = signals.len(),
            capital = initial_capital,
            strategy = %signals.label,
            "Starting backtest"
        );

        for bar in &signals.bars {
            let ts = bar.row.bar.timestamp;
            let close = bar.row.close();
            let ask = close + half_spread + slippage;
            let bid = close - half_spread - slippage;

            // Exit
            if let Some(pos) = position {
                if let Some((exit_price, reason)) = pos.exit_hit(bid, ask) {
                    let pnl = pos.pnl_at(exit_price);
                    equity += pnl;
                    guard.record(ts, pnl);
                    let trade = book.close(pos.trade_id, ts, exit_price, pnl, reason)?;
                    debug!(
                        trade_id = trade.trade_id,
                        exit = exit_price,
                        reason = ?reason,
                        pnl,
                        equity,
                        "Closed position"
                    );
                    position = None;
                }
            }

            // Every decisive bar must carry usable levels, traded or not
            let signal = bar.combined.signal;
            let levels = if signal.is_neutral() {
                None
            } else {
                Some(entry_levels(bar, ts)?)
            };

            // Entry
            let can_enter = levels.is_some() && position.is_none() && guard.allows_entry(ts);
            if let (true, Some((sl, tp))) = (can_enter, levels) {
                let (side, entry_price) = match signal {
                    Direction::Long => (TradeSide::Long, ask),
                    _ => (TradeSide::Short, bid),
                };
                let units = position_size(equity, entry_price, bar.row.atr, risk);
                if units <= 0.0 {
                    warn!(time = %ts, atr = bar.row.atr, "Position size is zero, skipping entry");
                } else {
                    trade_counter += 1;
                    let pos = OpenPosition {
                        trade_id: trade_counter,
                        side,
                        entry_time: ts,
                        entry_price,
                        units,
                        sl,
                        tp,
                    };
                    book.open(TradeRecord {
                        trade_id: pos.trade_id,
                        side,
                        entry_time: ts,
                        entry_price,
                        units,
                        sl,
                        tp,
                        exit_time: None,
                        exit_price: None,
                        pnl: 0.0,
                        pnl_pct: 0.0,
                        exit_reason: None,
                        duration_minutes: None,
                        status: TradeStatus::Open,
                    });
                    debug!(
                        trade_id = pos.trade_id,
                        side = ?side,
                        price = entry_price,
                        units,
                        sl,
                        tp,
                        "Opened position"
                    );
                    position = Some(pos);
                }
            }

            equity_curve.push(EquityPoint {
                timestamp: ts,
                equity,
                drawdown: 0.0,
            });
        }

        // Drawdown against the running peak, seeded with the starting capital
        let mut peak = initial_capital;
        for point in &mut equity_curve {
            peak = peak.max(point.equity);
            point.drawdown = point.equity - peak;
        }

        let trades = book.records;
        let stats = compute_stats(&trades, &equity_curve, initial_capital);
        let metrics = compute_equity_metrics(&equity_curve);

        info!(
            total_trades = stats.total_trades,
            winning_trades = stats.winning_trades,
            win_rate = stats.win_rate,
            total_pnl = stats.total_pnl,
            max_drawdown = stats.max_drawdown,
            open = position.is_some(),
            "Backtest complete"
        );

        Ok(BacktestResult {
            initial_capital,
            trades,
            equity_curve,
            stats,
            metrics,
        })
    }
}
