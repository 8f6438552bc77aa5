//! Indicator engine
//!
//! Turns an ordered bar sequence into an [`IndicatorFrame`]: every bar extended
//! with EMA, RSI, MACD, ATR, Bollinger, Stochastic, Williams %R, ADX/DI, CCI,
//! Momentum and ROC values. All values are causal: row `i` only reads bars
//! `0..=i`. Rows inside an indicator's warmup window carry a neutral default
//! instead of NaN, except the Bollinger bands which stay `None` until a full
//! window has accumulated.

use serde::{Deserialize, Serialize};
use ta::indicators::{AverageTrueRange, ExponentialMovingAverage, MovingAverageConvergenceDivergence};
use ta::Next;
use tracing::{debug, warn};

use crate::config::IndicatorParams;
use crate::data::validate_bars;
use crate::error::EngineResult;
use crate::types::Bar;

const EPSILON: f64 = 1e-10;

pub const NEUTRAL_RSI: f64 = 50.0;
pub const NEUTRAL_ADX: f64 = 25.0;
pub const NEUTRAL_STOCH: f64 = 50.0;
pub const NEUTRAL_WILLIAMS: f64 = -50.0;

// ============================================================================
// Frame types
// ============================================================================

/// One bar plus every indicator evaluated at that bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorRow {
    pub bar: Bar,
    pub ema_fast: f64,
    pub ema_slow: f64,
    pub rsi: f64,
    pub macd: f64,
    pub macd_signal: f64,
    pub macd_hist: f64,
    pub atr: f64,
    pub bb_mid: Option<f64>,
    pub bb_upper: Option<f64>,
    pub bb_lower: Option<f64>,
    pub stoch_k: f64,
    pub stoch_d: f64,
    pub williams_r: f64,
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
    pub cci: f64,
    pub momentum: f64,
    pub roc: f64,
}

impl IndicatorRow {
    /// A row holding every indicator at its neutral value, with the EMAs and
    /// Bollinger middle pinned to the close.
    pub fn neutral(bar: Bar) -> Self {
        let close = bar.close;
        Self {
            bar,
            ema_fast: close,
            ema_slow: close,
            rsi: NEUTRAL_RSI,
            macd: 0.0,
            macd_signal: 0.0,
            macd_hist: 0.0,
            atr: 0.0,
            bb_mid: Some(close),
            bb_upper: Some(close),
            bb_lower: Some(close),
            stoch_k: NEUTRAL_STOCH,
            stoch_d: NEUTRAL_STOCH,
            williams_r: NEUTRAL_WILLIAMS,
            adx: NEUTRAL_ADX,
            plus_di: NEUTRAL_ADX,
            minus_di: NEUTRAL_ADX,
            cci: 0.0,
            momentum: 0.0,
            roc: 0.0,
        }
    }

    pub fn close(&self) -> f64 {
        self.bar.close
    }

    /// True when any indicator is NaN or a band is still unset
    pub fn has_undefined(&self) -> bool {
        let values = [
            self.ema_fast,
            self.ema_slow,
            self.rsi,
            self.macd,
            self.macd_signal,
            self.macd_hist,
            self.atr,
            self.stoch_k,
            self.stoch_d,
            self.williams_r,
            self.adx,
            self.plus_di,
            self.minus_di,
            self.cci,
            self.momentum,
            self.roc,
        ];
        let bands = [self.bb_mid, self.bb_upper, self.bb_lower];
        values.iter().any(|v| v.is_nan()) || bands.iter().any(|b| b.map_or(true, f64::is_nan))
    }
}

/// Bars extended with indicator values, in timestamp order
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IndicatorFrame {
    rows: Vec<IndicatorRow>,
}

impl IndicatorFrame {
    pub fn from_rows(rows: Vec<IndicatorRow>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[IndicatorRow] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<IndicatorRow> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Drop the first `warmup` rows. A frame no longer than the warmup is
    /// returned untouched.
    pub fn skip_warmup(mut self, warmup: usize) -> Self {
        if self.rows.len() > warmup {
            self.rows.drain(..warmup);
        } else if warmup > 0 {
            warn!(
                bars = self.rows.len(),
                warmup, "Not enough bars to trim warmup, keeping all rows"
            );
        }
        self
    }
}

// ============================================================================
// Entry point
// ============================================================================

/// Compute every indicator over `bars`.
///
/// Fails with `InvalidInput` on an empty, unordered or non-finite series and
/// with `Configuration` on a zero period or unusable band width.
pub fn compute_indicators(bars: &[Bar], params: &IndicatorParams) -> EngineResult<IndicatorFrame> {
    params.validate()?;
    validate_bars(bars)?;

    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();

    let ema_fast = ema(&closes, params.ema_fast)?;
    let ema_slow = ema(&closes, params.ema_slow)?;
    let rsi = rsi(&closes, params.rsi_period);
    let macd = macd(&closes, params.ema_fast, params.ema_slow, params.macd_signal)?;
    let atr = atr(bars, params.atr_period)?;
    let bands = bollinger(&closes, params.bb_period, params.bb_k);
    let (stoch_k, stoch_d) = stochastic(bars, params.stoch_k, params.stoch_d);
    let williams = williams_r(bars, params.williams_period);
    let dmi = adx(bars, params.adx_period)?;
    let cci = cci(bars, params.cci_period);
    let momentum = momentum(&closes, params.momentum_period);
    let roc = roc(&closes, params.roc_period);

    let rows = bars
        .iter()
        .enumerate()
        .map(|(i, bar)| IndicatorRow {
            bar: bar.clone(),
            ema_fast: ema_fast[i],
            ema_slow: ema_slow[i],
            rsi: rsi[i],
            macd: macd[i].0,
            macd_signal: macd[i].1,
            macd_hist: macd[i].2,
            atr: atr[i],
            bb_mid: bands[i].map(|b| b.0),
            bb_upper: bands[i].map(|b| b.1),
            bb_lower: bands[i].map(|b| b.2),
            stoch_k: stoch_k[i],
            stoch_d: stoch_d[i],
            williams_r: williams[i],
            adx: dmi[i].0,
            plus_di: dmi[i].1,
            minus_di: dmi[i].2,
            cci: cci[i],
            momentum: momentum[i],
            roc: roc[i],
        })
        .collect();

    debug!(bars = bars.len(), "Computed indicator frame");
    Ok(IndicatorFrame { rows })
}

// ============================================================================
// Helpers
// ============================================================================

/// Apply `f` to every full trailing window of `period` values
fn rolling<F>(values: &[f64], period: usize, f: F) -> Vec<Option<f64>>
where
    F: Fn(&[f64]) -> f64,
{
    (0..values.len())
        .map(|i| {
            if period > 0 && i + 1 >= period {
                Some(f(&values[i + 1 - period..=i]))
            } else {
                None
            }
        })
        .collect()
}

fn mean(window: &[f64]) -> f64 {
    window.iter().sum::<f64>() / window.len() as f64
}

fn population_std(window: &[f64]) -> f64 {
    let m = mean(window);
    (window.iter().map(|v| (v - m).powi(2)).sum::<f64>() / window.len() as f64).sqrt()
}

fn window_min(window: &[f64]) -> f64 {
    window.iter().copied().fold(f64::INFINITY, f64::min)
}

fn window_max(window: &[f64]) -> f64 {
    window.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

// ============================================================================
// Indicators
// ============================================================================

/// Recursive EMA with alpha = 2/(period+1), seeded from the first value
pub fn ema(values: &[f64], period: usize) -> EngineResult<Vec<f64>> {
    let mut ema = ExponentialMovingAverage::new(period)?;
    Ok(values.iter().map(|&v| ema.next(v)).collect())
}

/// Wilder RSI: gains and losses smoothed with alpha = 1/period.
///
/// Zero average loss with positive average gain gives 100; both zero (no
/// movement at all) is undefined and reported as the neutral 50.
pub fn rsi(closes: &[f64], period: usize) -> Vec<f64> {
    let alpha = 1.0 / period as f64;
    let mut out = Vec::with_capacity(closes.len());
    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;

    for i in 0..closes.len() {
        if i == 0 {
            out.push(NEUTRAL_RSI);
            continue;
        }
        let delta = closes[i] - closes[i - 1];
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);
        if i == 1 {
            avg_gain = gain;
            avg_loss = loss;
        } else {
            avg_gain = avg_gain * (1.0 - alpha) + gain * alpha;
            avg_loss = avg_loss * (1.0 - alpha) + loss * alpha;
        }

        let value = if avg_loss == 0.0 {
            if avg_gain > 0.0 {
                100.0
            } else {
                NEUTRAL_RSI
            }
        } else {
            100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
        };
        out.push(if value.is_nan() { NEUTRAL_RSI } else { value });
    }
    out
}

/// (macd, signal, histogram) per bar
pub fn macd(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal: usize,
) -> EngineResult<Vec<(f64, f64, f64)>> {
    let mut macd = MovingAverageConvergenceDivergence::new(fast, slow, signal)?;
    Ok(closes
        .iter()
        .map(|&c| {
            let out = macd.next(c);
            (out.macd, out.signal, out.histogram)
        })
        .collect())
}

/// max(high-low, |high-prev_close|, |low-prev_close|); the first bar uses high-low
pub fn true_range(bars: &[Bar]) -> Vec<f64> {
    bars.iter()
        .enumerate()
        .map(|(i, bar)| {
            let range = bar.high - bar.low;
            if i == 0 {
                range
            } else {
                let prev_close = bars[i - 1].close;
                range
                    .max((bar.high - prev_close).abs())
                    .max((bar.low - prev_close).abs())
            }
        })
        .collect()
}

/// EMA-smoothed true range
pub fn atr(bars: &[Bar], period: usize) -> EngineResult<Vec<f64>> {
    let mut atr = AverageTrueRange::new(period)?;
    Ok(bars.iter().map(|bar| atr.next(bar)).collect())
}

/// (mid, upper, lower) once a full window exists; population std
pub fn bollinger(closes: &[f64], period: usize, k: f64) -> Vec<Option<(f64, f64, f64)>> {
    rolling(closes, period, mean)
        .into_iter()
        .zip(rolling(closes, period, population_std))
        .map(|(mid, std)| match (mid, std) {
            (Some(mid), Some(std)) => Some((mid, mid + k * std, mid - k * std)),
            _ => None,
        })
        .collect()
}

/// %K and %D. %D averages the last `d_period` values of %K and is only
/// defined once all of them are.
pub fn stochastic(bars: &[Bar], k_period: usize, d_period: usize) -> (Vec<f64>, Vec<f64>) {
    let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
    let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();
    let lowest = rolling(&lows, k_period, window_min);
    let highest = rolling(&highs, k_period, window_max);

    let raw_k: Vec<Option<f64>> = bars
        .iter()
        .enumerate()
        .map(|(i, bar)| match (lowest[i], highest[i]) {
            (Some(ll), Some(hh)) => Some((bar.close - ll) / (hh - ll + EPSILON) * 100.0),
            _ => None,
        })
        .collect();

    let raw_d: Vec<Option<f64>> = (0..raw_k.len())
        .map(|i| {
            if i + 1 < d_period {
                return None;
            }
            let window = &raw_k[i + 1 - d_period..=i];
            let sum: Option<f64> = window.iter().copied().sum();
            sum.map(|s| s / d_period as f64)
        })
        .collect();

    (
        raw_k.into_iter().map(|k| k.unwrap_or(NEUTRAL_STOCH)).collect(),
        raw_d.into_iter().map(|d| d.unwrap_or(NEUTRAL_STOCH)).collect(),
    )
}

/// Williams %R in [-100, 0]
pub fn williams_r(bars: &[Bar], period: usize) -> Vec<f64> {
    let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
    let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();
    let highest = rolling(&highs, period, window_max);
    let lowest = rolling(&lows, period, window_min);

    bars.iter()
        .enumerate()
        .map(|(i, bar)| match (highest[i], lowest[i]) {
            (Some(hh), Some(ll)) => (hh - bar.close) / (hh - ll + EPSILON) * -100.0,
            _ => NEUTRAL_WILLIAMS,
        })
        .collect()
}

/// (adx, +di, -di) per bar.
///
/// Directional movement keeps only the larger positive move. DM and true range
/// are EMA-smoothed over `period`, and ADX is the EMA of DX. Bars inside the
/// first `period` report the neutral 25 for all three.
pub fn adx(bars: &[Bar], period: usize) -> EngineResult<Vec<(f64, f64, f64)>> {
    let mut tr_ema = AverageTrueRange::new(period)?;
    let mut plus_ema = ExponentialMovingAverage::new(period)?;
    let mut minus_ema = ExponentialMovingAverage::new(period)?;
    let mut dx_ema = ExponentialMovingAverage::new(period)?;

    let mut out = Vec::with_capacity(bars.len());
    for (i, bar) in bars.iter().enumerate() {
        let (plus_dm, minus_dm) = if i == 0 {
            (0.0, 0.0)
        } else {
            let up_move = bar.high - bars[i - 1].high;
            let down_move = bars[i - 1].low - bar.low;
            (
                if up_move > down_move && up_move > 0.0 { up_move } else { 0.0 },
                if down_move > up_move && down_move > 0.0 { down_move } else { 0.0 },
            )
        };

        let atr = tr_ema.next(bar);
        let plus_di = 100.0 * plus_ema.next(plus_dm) / (atr + EPSILON);
        let minus_di = 100.0 * minus_ema.next(minus_dm) / (atr + EPSILON);
        let dx = 100.0 * (plus_di - minus_di).abs() / (plus_di + minus_di + EPSILON);
        let adx = dx_ema.next(dx);

        if i < period {
            out.push((NEUTRAL_ADX, NEUTRAL_ADX, NEUTRAL_ADX));
        } else {
            out.push((adx, plus_di, minus_di));
        }
    }
    Ok(out)
}

/// (typical - SMA(typical)) / (0.015 * mean absolute deviation)
pub fn cci(bars: &[Bar], period: usize) -> Vec<f64> {
    let typical: Vec<f64> = bars.iter().map(|b| (b.high + b.low + b.close) / 3.0).collect();
    let mean_dev = |window: &[f64]| {
        let m = mean(window);
        window.iter().map(|v| (v - m).abs()).sum::<f64>() / window.len() as f64
    };
    let sma = rolling(&typical, period, mean);
    let mad = rolling(&typical, period, mean_dev);

    typical
        .iter()
        .enumerate()
        .map(|(i, tp)| match (sma[i], mad[i]) {
            (Some(sma), Some(mad)) => (tp - sma) / (0.015 * mad + EPSILON),
            _ => 0.0,
        })
        .collect()
}

/// close - close `period` bars ago; 0 before enough history
pub fn momentum(closes: &[f64], period: usize) -> Vec<f64> {
    (0..closes.len())
        .map(|i| if i >= period { closes[i] - closes[i - period] } else { 0.0 })
        .collect()
}

/// Percent change over `period` bars; 0 before enough history
pub fn roc(closes: &[f64], period: usize) -> Vec<f64> {
    (0..closes.len())
        .map(|i| {
            if i >= period {
                let base = closes[i - period];
                (closes[i] - base) / (base + EPSILON) * 100.0
            } else {
                0.0
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn make_bars(prices: &[f64]) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        prices
            .iter()
            .enumerate()
            .map(|(i, &p)| {
                Bar::new(start + Duration::minutes(5 * i as i64), p, p + 1.0, p - 1.0, p)
                    .with_volume(100.0)
            })
            .collect()
    }

    fn wave(n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| 100.0 + 10.0 * (i as f64 / 7.0).sin() + i as f64 * 0.1)
            .collect()
    }

    #[test]
    fn test_ema_seeded_from_first_value() {
        let values = ema(&[10.0, 20.0, 20.0], 3).unwrap();
        assert_eq!(values[0], 10.0);
        // alpha = 0.5
        assert!((values[1] - 15.0).abs() < 1e-12);
        assert!((values[2] - 17.5).abs() < 1e-12);
    }

    #[test]
    fn test_rsi_edge_cases() {
        let flat = rsi(&[100.0; 20], 14);
        assert!(flat.iter().all(|&v| v == NEUTRAL_RSI));

        let rising: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        let up = rsi(&rising, 14);
        assert_eq!(up[0], NEUTRAL_RSI);
        assert_eq!(up[19], 100.0);

        let falling: Vec<f64> = (0..20).map(|i| 100.0 - i as f64).collect();
        let down = rsi(&falling, 14);
        assert!(down[19] < 1e-9);
    }

    #[test]
    fn test_rsi_wilder_smoothing() {
        // +2, -1 with alpha = 0.5: gain 2 -> 1, loss 0 -> 0.5, rs = 2
        let values = rsi(&[10.0, 12.0, 11.0], 2);
        assert!((values[2] - (100.0 - 100.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn test_true_range_uses_previous_close() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let bars = vec![
            Bar::new(start, 10.0, 11.0, 9.0, 10.0),
            Bar::new(start + Duration::minutes(1), 14.0, 15.0, 13.0, 14.0),
        ];
        let tr = true_range(&bars);
        assert_eq!(tr[0], 2.0);
        assert_eq!(tr[1], 5.0);
        let atr = atr(&bars, 3).unwrap();
        assert_eq!(atr[0], 2.0);
        assert!((atr[1] - 3.5).abs() < 1e-12);
    }

    #[test]
    fn test_bollinger_requires_full_window() {
        let closes = [1.0, 2.0, 3.0, 4.0];
        let bands = bollinger(&closes, 3, 2.0);
        assert!(bands[0].is_none());
        assert!(bands[1].is_none());
        let (mid, upper, lower) = bands[2].unwrap();
        assert!((mid - 2.0).abs() < 1e-12);
        let std = (2.0f64 / 3.0).sqrt();
        assert!((upper - (2.0 + 2.0 * std)).abs() < 1e-12);
        assert!((lower - (2.0 - 2.0 * std)).abs() < 1e-12);
    }

    #[test]
    fn test_stochastic_defaults_then_values() {
        let bars = make_bars(&[10.0, 11.0, 12.0, 13.0, 14.0]);
        let (k, d) = stochastic(&bars, 3, 2);
        assert_eq!(k[0], NEUTRAL_STOCH);
        assert_eq!(k[1], NEUTRAL_STOCH);
        // window lows 9..11, highs 11..13, close 12 => (12-9)/(13-9)
        assert!((k[2] - 75.0).abs() < 1e-6);
        assert_eq!(d[2], NEUTRAL_STOCH);
        assert!((d[3] - (k[2] + k[3]) / 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_williams_range() {
        let bars = make_bars(&wave(60));
        for v in williams_r(&bars, 14) {
            assert!((-100.0..=0.0).contains(&v));
        }
    }

    #[test]
    fn test_adx_neutral_during_warmup() {
        let bars = make_bars(&wave(40));
        let dmi = adx(&bars, 14).unwrap();
        assert_eq!(dmi[0], (NEUTRAL_ADX, NEUTRAL_ADX, NEUTRAL_ADX));
        assert_eq!(dmi[13].0, NEUTRAL_ADX);
        for &(adx, plus, minus) in &dmi[14..] {
            assert!((0.0..=100.0).contains(&adx));
            assert!(plus >= 0.0 && minus >= 0.0);
        }
    }

    #[test]
    fn test_adx_tracks_direction() {
        let rising: Vec<f64> = (0..60).map(|i| 100.0 + 2.0 * i as f64).collect();
        let dmi = adx(&make_bars(&rising), 14).unwrap();
        let (adx, plus, minus) = dmi[59];
        assert!(plus > minus);
        assert!(adx > 25.0);
    }

    #[test]
    fn test_cci_and_momentum() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let bars = make_bars(&closes);
        let cci = cci(&bars, 20);
        assert_eq!(cci[18], 0.0);
        assert!(cci[29] > 100.0);

        let mom = momentum(&closes, 10);
        assert_eq!(mom[9], 0.0);
        assert_eq!(mom[10], 10.0);

        let roc = roc(&closes, 10);
        assert!((roc[10] - 10.0).abs() < 1e-6);
    }

    #[test]
    fn test_compute_indicators_rejects_bad_input() {
        let params = IndicatorParams::default();
        assert!(compute_indicators(&[], &params).is_err());

        let mut bars = make_bars(&[1.0, 2.0, 3.0]);
        bars.swap(0, 2);
        assert!(compute_indicators(&bars, &params).is_err());
    }

    #[test]
    fn test_compute_indicators_rejects_zero_periods() {
        let bars = make_bars(&wave(40));
        for params in [
            IndicatorParams {
                stoch_d: 0,
                ..IndicatorParams::default()
            },
            IndicatorParams {
                rsi_period: 0,
                ..IndicatorParams::default()
            },
        ] {
            assert!(matches!(
                compute_indicators(&bars, &params),
                Err(crate::error::EngineError::Configuration(_))
            ));
        }
    }

    #[test]
    fn test_compute_indicators_is_causal() {
        let params = IndicatorParams::default();
        let bars = make_bars(&wave(120));
        let full = compute_indicators(&bars, &params).unwrap();
        let prefix = compute_indicators(&bars[..80], &params).unwrap();
        for (a, b) in full.rows()[..80].iter().zip(prefix.rows()) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_no_undefined_after_warmup() {
        let params = IndicatorParams::default();
        let bars = make_bars(&wave(200));
        let frame = compute_indicators(&bars, &params)
            .unwrap()
            .skip_warmup(params.longest_window());
        assert_eq!(frame.len(), 200 - 26);
        assert!(frame.rows().iter().all(|row| !row.has_undefined()));
    }

    #[test]
    fn test_skip_warmup_keeps_short_frames() {
        let params = IndicatorParams::default();
        let frame = compute_indicators(&make_bars(&wave(10)), &params).unwrap();
        assert_eq!(frame.clone().skip_warmup(50).len(), 10);
        assert_eq!(frame.skip_warmup(4).len(), 6);
    }
}
