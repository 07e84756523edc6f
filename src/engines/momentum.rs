//! Momentum and market-structure classifiers
//!
//! The post-TP engines consume discrete `MomentumState` and
//! `StructureState` labels. Both are derived here from the recent
//! closed-bar window: momentum from bar body sizes relative to ATR,
//! structure from the two most recent swing lows.

use crate::models::{Bar, BarSeries, MomentumState, StructureState};

/// Mean body over this many closed bars feeds the momentum label.
const MOMENTUM_WINDOW: usize = 3;
/// Mean body >= this fraction of ATR reads as STRONG.
const STRONG_BODY_ATR: f64 = 0.6;
/// Mean body >= this fraction of ATR reads as MODERATE.
const MODERATE_BODY_ATR: f64 = 0.3;
/// A single down bar with a body this large breaks momentum outright.
const BREAK_BODY_ATR: f64 = 0.8;

/// Stateless reader over a bar series.
pub struct MarketReader;

impl MarketReader {
    /// Classify momentum from the window ending at `last_closed_index`
    /// (inclusive). ATR comes from that bar.
    pub fn momentum(series: &BarSeries, last_closed_index: usize) -> MomentumState {
        let Some(bar) = series.get(last_closed_index) else {
            return MomentumState::Unknown;
        };
        let atr = bar.atr14;
        if !atr.is_finite() || atr <= 0.0 {
            return MomentumState::Unknown;
        }
        if last_closed_index + 1 < MOMENTUM_WINDOW {
            return MomentumState::Unknown;
        }

        // A violent reversal bar overrides the average read.
        if bar.is_down_bar() && bar.body() >= BREAK_BODY_ATR * atr {
            return MomentumState::Broken;
        }

        let start = last_closed_index + 1 - MOMENTUM_WINDOW;
        let window = &series.bars()[start..=last_closed_index];
        let mean_body = window.iter().map(Bar::body).sum::<f64>() / window.len() as f64;

        if mean_body >= STRONG_BODY_ATR * atr {
            MomentumState::Strong
        } else if mean_body >= MODERATE_BODY_ATR * atr {
            MomentumState::Moderate
        } else {
            MomentumState::Broken
        }
    }

    /// Classify structure from the two most recent swing lows at or before
    /// `last_closed_index`. A swing low is a local minimum with one strictly
    /// higher neighbor on each side.
    pub fn structure(series: &BarSeries, last_closed_index: usize) -> StructureState {
        let lows = Self::swing_lows(series, last_closed_index);
        match lows.as_slice() {
            [.., older, newer] => {
                if newer > older {
                    StructureState::HigherLows
                } else if newer < older {
                    StructureState::LowerLow
                } else {
                    StructureState::Unknown
                }
            }
            _ => StructureState::Unknown,
        }
    }

    /// The most recent swing low price, used by the post-TP2 trailing stop.
    pub fn latest_swing_low(series: &BarSeries, last_closed_index: usize) -> Option<f64> {
        Self::swing_lows(series, last_closed_index).last().copied()
    }

    fn swing_lows(series: &BarSeries, last_closed_index: usize) -> Vec<f64> {
        let bars = series.bars();
        let end = last_closed_index.min(bars.len().saturating_sub(1));
        let mut lows = Vec::new();
        if end < 2 {
            return lows;
        }
        for i in 1..end {
            let low = bars[i].low;
            if low < bars[i - 1].low && low < bars[i + 1].low {
                lows.push(low);
            }
        }
        lows
    }
}
