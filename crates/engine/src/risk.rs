//! Position sizing and the daily loss guard

use chrono::{DateTime, NaiveDate, Utc};
use tracing::debug;

use crate::config::RiskConfig;

/// Units to trade so that a stop `atr_sl_mult * atr` away risks
/// `risk_per_trade` of equity. Returns 0 when no sane size exists.
pub fn position_size(equity: f64, price: f64, atr: f64, risk: &RiskConfig) -> f64 {
    let stop_distance = risk.atr_sl_mult * atr;
    if !(stop_distance.is_finite() && stop_distance > 0.0) || !(price.is_finite() && price > 0.0) {
        return 0.0;
    }
    let units = equity * risk.risk_per_trade / stop_distance;
    if units.is_finite() && units > 0.0 {
        units
    } else {
        0.0
    }
}

/// Blocks new entries once a UTC day's realized loss reaches
/// `max_daily_loss_pct * capital`
#[derive(Debug, Clone)]
pub struct DailyLossGuard {
    limit: f64,
    day: Option<NaiveDate>,
    realized: f64,
}

impl DailyLossGuard {
    pub fn new(risk: &RiskConfig) -> Self {
        Self {
            limit: risk.max_daily_loss_pct * risk.capital,
            day: None,
            realized: 0.0,
        }
    }

    fn roll(&mut self, ts: DateTime<Utc>) {
        let day = ts.date_naive();
        if self.day != Some(day) {
            self.day = Some(day);
            self.realized = 0.0;
        }
    }

    /// Record a closed trade's pnl against the day of `ts`
    pub fn record(&mut self, ts: DateTime<Utc>, pnl: f64) {
        self.roll(ts);
        self.realized += pnl;
    }

    /// Whether a new position may be opened at `ts`
    pub fn allows_entry(&mut self, ts: DateTime<Utc>) -> bool {
        self.roll(ts);
        let blocked = self.limit > 0.0 && -self.realized >= self.limit;
        if blocked {
            debug!(
                day = %ts.date_naive(),
                realized = self.realized,
                limit = self.limit,
                "Daily loss limit reached"
            );
        }
        !blocked
    }

    pub fn realized_today(&self) -> f64 {
        self.realized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_position_size_risks_fixed_fraction() {
        let risk = RiskConfig::default();
        // 10_000 * 0.01 / (1.5 * 2.0)
        let units = position_size(10_000.0, 100.0, 2.0, &risk);
        assert!((units - 100.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_position_size_zero_on_degenerate_inputs() {
        let risk = RiskConfig::default();
        assert_eq!(position_size(10_000.0, 100.0, 0.0, &risk), 0.0);
        assert_eq!(position_size(10_000.0, 100.0, f64::NAN, &risk), 0.0);
        assert_eq!(position_size(10_000.0, 0.0, 1.0, &risk), 0.0);
        assert_eq!(position_size(-5.0, 100.0, 1.0, &risk), 0.0);
    }

    #[test]
    fn test_daily_guard_blocks_then_resets() {
        let risk = RiskConfig::default(); // limit 200
        let mut guard = DailyLossGuard::new(&risk);
        let morning = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap();
        let noon = Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap();
        let next_day = Utc.with_ymd_and_hms(2024, 3, 5, 0, 5, 0).unwrap();

        assert!(guard.allows_entry(morning));
        guard.record(morning, -150.0);
        assert!(guard.allows_entry(noon));
        guard.record(noon, -60.0);
        assert!(!guard.allows_entry(noon));
        assert!((guard.realized_today() + 210.0).abs() < 1e-9);

        assert!(guard.allows_entry(next_day));
        assert_eq!(guard.realized_today(), 0.0);
    }

    #[test]
    fn test_daily_guard_counts_wins_against_losses() {
        let risk = RiskConfig::default();
        let mut guard = DailyLossGuard::new(&risk);
        let ts = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap();
        guard.record(ts, 300.0);
        guard.record(ts, -400.0);
        assert!(guard.allows_entry(ts));
    }
}
