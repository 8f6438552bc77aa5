//! Bar suppliers
//!
//! The engine itself never performs I/O; callers fetch a finite bar sequence
//! through a [`BarSource`] and hand it to the pipeline.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::data::normalize_bars;
use crate::error::EngineResult;
use crate::types::Bar;

#[async_trait]
pub trait BarSource: Send + Sync {
    /// Up to `limit` most recent bars for `symbol` at `interval`, oldest first
    async fn fetch_bars(&self, symbol: &str, interval: &str, limit: usize)
        -> EngineResult<Vec<Bar>>;
}

/// JSON array of bar objects on disk. Symbol and interval are ignored.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Every bar in the file, sorted and deduplicated
    pub async fn load(&self) -> EngineResult<Vec<Bar>> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        let bars: Vec<Bar> = serde_json::from_str(&raw)?;
        debug!(path = %self.path.display(), count = bars.len(), "Read bar file");
        Ok(normalize_bars(bars))
    }
}

#[async_trait]
impl BarSource for JsonFileSource {
    async fn fetch_bars(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> EngineResult<Vec<Bar>> {
        let mut bars = self.load().await?;
        if bars.len() > limit {
            bars.drain(..bars.len() - limit);
        }
        info!(symbol, interval, count = bars.len(), "Loaded bars from file");
        Ok(bars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("engine-source-{}-{}.json", std::process::id(), name))
    }

    #[tokio::test]
    async fn test_json_source_sorts_dedups_and_limits() {
        let path = temp_path("bars");
        let doc = r#"[
            {"timestamp": "2024-01-01T02:00:00Z", "open": 3, "high": 4, "low": 2, "close": 3},
            {"timestamp": "2024-01-01T00:00:00Z", "open": 1, "high": 2, "low": 0.5, "close": 1, "volume": 7},
            {"timestamp": "2024-01-01T01:00:00Z", "open": 2, "high": 3, "low": 1, "close": 2},
            {"timestamp": "2024-01-01T01:00:00Z", "open": 2, "high": 3, "low": 1, "close": 2.5}
        ]"#;
        tokio::fs::write(&path, doc).await.unwrap();

        let source = JsonFileSource::new(&path);
        let all = source.load().await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].volume, 7.0);
        assert_eq!(all[1].close, 2.5);
        assert_eq!(all[2].volume, 1.0);

        let recent = source.fetch_bars("EURUSD", "1h", 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].close, 2.5);

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_json_source_missing_file() {
        let source = JsonFileSource::new(temp_path("missing"));
        let err = source.load().await.unwrap_err();
        assert!(matches!(err, EngineError::Io(_)));
    }
}
