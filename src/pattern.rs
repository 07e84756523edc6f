//! Reference double-bottom detector
//!
//! Default `PatternSource` implementation: pivot lows by symmetric
//! lookback, two lows within the equality tolerance and far enough apart,
//! neckline at the highest high between them, and a fresh breakout cross
//! on the evaluated bar. The detector is replaceable; the engines only
//! consume the finished `Pattern` view.

use crate::config::AppConfig;
use crate::controller::PatternSource;
use crate::models::{BarSeries, Pattern, PatternPoint};

#[derive(Debug, Clone)]
pub struct DoubleBottomDetector {
    lookback_left: usize,
    lookback_right: usize,
    equality_tolerance: f64,
    min_bars_between: i64,
}

impl DoubleBottomDetector {
    pub fn new(
        lookback_left: usize,
        lookback_right: usize,
        equality_tolerance: f64,
        min_bars_between: i64,
    ) -> Self {
        Self {
            lookback_left: lookback_left.max(1),
            lookback_right: lookback_right.max(1),
            equality_tolerance,
            min_bars_between,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.strategy.pivot_lookback_left,
            config.strategy.pivot_lookback_right,
            config.strategy.equality_tolerance,
            config.strategy.min_bars_between,
        )
    }

    /// Pivot lows confirmed at or before `last_index`: strictly the lowest
    /// low within the lookback window on both sides.
    fn pivot_lows(&self, series: &BarSeries, last_index: usize) -> Vec<PatternPoint> {
        let bars = series.bars();
        let mut pivots = Vec::new();
        if last_index < self.lookback_right {
            return pivots;
        }
        let upper = last_index - self.lookback_right;
        for i in 0..=upper {
            if i < self.lookback_left {
                continue;
            }
            let low = bars[i].low;
            let left_ok = bars[i - self.lookback_left..i].iter().all(|b| b.low > low);
            let right_ok = bars[i + 1..=i + self.lookback_right].iter().all(|b| b.low > low);
            if left_ok && right_ok {
                pivots.push(PatternPoint {
                    price: low,
                    bar_index: i,
                });
            }
        }
        pivots
    }
}

impl PatternSource for DoubleBottomDetector {
    fn detect(&self, series: &BarSeries, bar_index: usize) -> Option<Pattern> {
        let bar = series.get(bar_index)?;
        let prev_close = bar_index
            .checked_sub(1)
            .and_then(|i| series.get(i))
            .map(|b| b.close)?;

        let pivots = self.pivot_lows(series, bar_index);
        // Walk pairs newest-first, looking for two near-equal lows.
        for newer in (1..pivots.len()).rev() {
            let right = pivots[newer];
            for older in (0..newer).rev() {
                let left = pivots[older];
                let separation = right.bar_index as i64 - left.bar_index as i64;
                if separation < self.min_bars_between {
                    continue;
                }
                if (left.price - right.price).abs() > self.equality_tolerance {
                    continue;
                }
                let neckline = series.bars()[left.bar_index..=right.bar_index]
                    .iter()
                    .map(|b| b.high)
                    .fold(f64::MIN, f64::max);
                if neckline <= left.price.max(right.price) {
                    continue;
                }
                // Fresh breakout only: the evaluated bar crosses the
                // neckline, the previous close was at or below it.
                if bar.close > neckline && prev_close <= neckline {
                    return Some(Pattern {
                        left_low: left,
                        right_low: right,
                        neckline,
                        quality_score: None,
                    });
                }
            }
        }
        None
    }
}
