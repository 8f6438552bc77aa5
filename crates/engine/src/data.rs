//! Bar normalization and validation

use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::types::Bar;

/// Sort bars by timestamp and drop duplicates, keeping the last bar seen
/// for each timestamp.
pub fn normalize_bars(mut bars: Vec<Bar>) -> Vec<Bar> {
    let before = bars.len();
    // Stable sort keeps arrival order among equal timestamps
    bars.sort_by_key(|b| b.timestamp);

    let mut out: Vec<Bar> = Vec::with_capacity(bars.len());
    for bar in bars {
        match out.last_mut() {
            Some(last) if last.timestamp == bar.timestamp => *last = bar,
            _ => out.push(bar),
        }
    }

    if out.len() != before {
        debug!(before, after = out.len(), "Dropped duplicate bars");
    }
    out
}

/// Reject sequences the indicator engine cannot process
pub fn validate_bars(bars: &[Bar]) -> EngineResult<()> {
    if bars.is_empty() {
        return Err(EngineError::InvalidInput("bar sequence is empty".to_string()));
    }

    for (i, bar) in bars.iter().enumerate() {
        let prices = [bar.open, bar.high, bar.low, bar.close];
        if prices.iter().any(|p| !p.is_finite()) || !bar.volume.is_finite() {
            return Err(EngineError::InvalidInput(format!(
                "bar {} at {} has a non-finite field",
                i, bar.timestamp
            )));
        }
        if bar.high < bar.low {
            return Err(EngineError::InvalidInput(format!(
                "bar {} at {} has high {} below low {}",
                i, bar.timestamp, bar.high, bar.low
            )));
        }
        if bar.low > bar.open.min(bar.close) || bar.high < bar.open.max(bar.close) {
            return Err(EngineError::InvalidInput(format!(
                "bar {} at {} has open/close outside [{}, {}]",
                i, bar.timestamp, bar.low, bar.high
            )));
        }
        if i > 0 && bar.timestamp <= bars[i - 1].timestamp {
            return Err(EngineError::InvalidInput(format!(
                "bar {} at {} is not after {}",
                i,
                bar.timestamp,
                bars[i - 1].timestamp
            )));
        }
    }
    Ok(())
}
