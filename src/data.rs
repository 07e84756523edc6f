//! Bar history loading for the sim bridge and the backtest runner.
//!
//! Bars are stored as a JSON array of the same `Bar` shape the broker
//! bridge produces, indicators included. Fetching and indicator
//! computation happen upstream; this module only validates ordering.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::models::Bar;

/// Load a JSON array of bars, enforcing strictly increasing timestamps.
pub fn load_bars_json(path: impl AsRef<Path>) -> Result<Vec<Bar>> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read bar file {}", path.display()))?;
    let bars: Vec<Bar> = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse bar file {}", path.display()))?;

    for pair in bars.windows(2) {
        if pair[1].time <= pair[0].time {
            anyhow::bail!(
                "bar history not strictly ordered at {} -> {}",
                pair[0].time,
                pair[1].time
            );
        }
    }
    info!(count = bars.len(), file = %path.display(), "bar history loaded");
    Ok(bars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn bar(hour: u32) -> Bar {
        Bar {
            time: Utc.with_ymd_and_hms(2024, 1, 2, hour, 0, 0).unwrap(),
            open: 2000.0,
            high: 2001.0,
            low: 1999.0,
            close: 2000.5,
            tick_volume: Some(10),
            ema50: 1999.0,
            ema200: 1995.0,
            atr14: 5.0,
        }
    }

    #[test]
    fn round_trips_ordered_bars() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bars.json");
        let bars = vec![bar(1), bar(2), bar(3)];
        std::fs::write(&path, serde_json::to_string(&bars).unwrap()).unwrap();
        let loaded = load_bars_json(&path).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[2].time, bars[2].time);
    }

    #[test]
    fn rejects_unordered_bars() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bars.json");
        let bars = vec![bar(2), bar(1)];
        std::fs::write(&path, serde_json::to_string(&bars).unwrap()).unwrap();
        assert!(load_bars_json(&path).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_bars_json("definitely/not/here.json").is_err());
    }
}
