//! Binance public API client for market data (no authentication required)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::source::BarSource;
use crate::types::Bar;

const DEFAULT_BASE_URL: &str = "https://api.binance.com";
const MAX_KLINES_PER_REQUEST: usize = 1000;

/// Binance public market data client
#[derive(Clone)]
pub struct BinanceClient {
    client: Client,
    base_url: String,
}

/// Raw kline data from Binance API (array of arrays)
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct RawKline(
    i64,    // 0: Open time
    String, // 1: Open
    String, // 2: High
    String, // 3: Low
    String, // 4: Close
    String, // 5: Volume
    i64,    // 6: Close time
    String, // 7: Quote asset volume
    u64,    // 8: Number of trades
    String, // 9: Taker buy base
    String, // 10: Taker buy quote
    String, // 11: Ignore
);

impl RawKline {
    /// Bar stamped at the candle's open time; `None` if any field is unparsable
    fn to_bar(&self) -> Option<Bar> {
        let timestamp = DateTime::<Utc>::from_timestamp_millis(self.0)?;
        let bar = Bar::new(
            timestamp,
            self.1.parse().ok()?,
            self.2.parse().ok()?,
            self.3.parse().ok()?,
            self.4.parse().ok()?,
        );
        Some(bar.with_volume(self.5.parse().ok()?))
    }
}

impl BinanceClient {
    /// Create a new Binance client with default base URL
    pub fn new() -> EngineResult<Self> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> EngineResult<Self> {
        Ok(Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()?,
            base_url: base_url.into(),
        })
    }

    fn klines_url(
        &self,
        symbol: &str,
        interval: &str,
        end_time: Option<i64>,
        limit: usize,
    ) -> String {
        let mut url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            symbol,
            interval,
            limit.min(MAX_KLINES_PER_REQUEST)
        );
        if let Some(end) = end_time {
            url.push_str(&format!("&endTime={}", end));
        }
        url
    }

    /// Fetch one page of klines ending at `end_time` (latest when `None`)
    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        end_time: Option<i64>,
        limit: usize,
    ) -> EngineResult<Vec<Bar>> {
        let url = self.klines_url(symbol, interval, end_time, limit);
        debug!(symbol, interval, "Fetching klines from Binance");

        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::MarketData(format!(
                "Binance API error {}: {}",
                status, body
            )));
        }

        let raw_klines: Vec<RawKline> = response.json().await?;
        let total = raw_klines.len();
        let bars: Vec<Bar> = raw_klines.iter().filter_map(RawKline::to_bar).collect();
        if bars.len() != total {
            warn!(dropped = total - bars.len(), "Skipped unparsable klines");
        }

        debug!(count = bars.len(), "Fetched klines");
        Ok(bars)
    }

    /// Fetch the most recent `limit` klines, paging backwards past the
    /// 1000-per-request cap
    pub async fn get_klines_paginated(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> EngineResult<Vec<Bar>> {
        let mut pages: Vec<Vec<Bar>> = Vec::new();
        let mut remaining = limit;
        let mut end_time: Option<i64> = None;

        info!(symbol, interval, limit, "Fetching paginated klines from Binance");

        while remaining > 0 {
            let requested = remaining.min(MAX_KLINES_PER_REQUEST);
            let page = self
                .get_klines(symbol, interval, end_time, requested)
                .await?;

            let Some(first) = page.first() else {
                break;
            };
            // Move end to just before the oldest candle
            end_time = Some(first.timestamp.timestamp_millis() - 1);
            remaining = remaining.saturating_sub(page.len());
            let short_page = page.len() < requested;
            pages.push(page);
            if short_page {
                break;
            }

            // Small delay to respect rate limits
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }

        let bars: Vec<Bar> = pages.into_iter().rev().flatten().collect();
        info!(total = bars.len(), "Paginated kline fetch complete");
        Ok(bars)
    }
}

#[async_trait]
impl BarSource for BinanceClient {
    async fn fetch_bars(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> EngineResult<Vec<Bar>> {
        let bars = self.get_klines_paginated(symbol, interval, limit).await?;
        Ok(crate::data::normalize_bars(bars))
    }
}
