//! Market-Regime Engine
//!
//! Labels the environment BULL, BEAR, or RANGE from the latest closed bar's
//! `(close, ema50, ema200)`. Regime is context only; it never issues trade
//! signals. Changes happen on bar close.

use tracing::{debug, warn};

use crate::models::{Regime, RegimeState};

pub struct MarketRegimeEngine {
    last_state: RegimeState,
}

impl Default for MarketRegimeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MarketRegimeEngine {
    pub fn new() -> Self {
        Self {
            last_state: RegimeState::default(),
        }
    }

    /// Evaluate the regime for one closed bar.
    ///
    /// BULL iff `close > ema50 && ema50 > ema200`; BEAR iff both reversed;
    /// RANGE otherwise (confidence 0). Non-finite or zero EMAs degrade to
    /// RANGE with zero confidence rather than failing.
    pub fn evaluate(&mut self, close: f64, ema50: f64, ema200: f64) -> RegimeState {
        if !close.is_finite() || !ema50.is_finite() || !ema200.is_finite() {
            warn!(close, ema50, ema200, "non-finite regime inputs");
            self.last_state = RegimeState::default();
            return self.last_state.clone();
        }
        if ema50 == 0.0 || ema200 == 0.0 {
            warn!(ema50, ema200, "zero EMA values");
            self.last_state = RegimeState::default();
            return self.last_state.clone();
        }

        let ema_distance_pct = (ema50 - ema200) / ema200 * 100.0;
        let price_distance_pct = (close - ema50) / ema50 * 100.0;

        let (regime, confidence) = if close > ema50 && ema50 > ema200 {
            (
                Regime::Bull,
                Self::confidence(ema_distance_pct, price_distance_pct),
            )
        } else if close < ema50 && ema50 < ema200 {
            (
                Regime::Bear,
                Self::confidence(ema_distance_pct, price_distance_pct),
            )
        } else {
            (Regime::Range, 0.0)
        };

        debug!(
            regime = regime.as_str(),
            confidence,
            ema_distance_pct,
            price_distance_pct,
            "regime evaluated"
        );

        self.last_state = RegimeState {
            regime,
            confidence,
            ema50_ema200_distance_pct: ema_distance_pct,
            price_ema50_distance_pct: price_distance_pct,
        };
        self.last_state.clone()
    }

    /// Confidence grows with EMA separation (60% weight, maxed at 1%) and
    /// price distance from EMA50 (40% weight, maxed at 2%).
    fn confidence(ema_distance_pct: f64, price_distance_pct: f64) -> f64 {
        let ema_score = (ema_distance_pct.abs() / 1.0).min(1.0);
        let price_score = (price_distance_pct.abs() / 2.0).min(1.0);
        (ema_score * 0.6 + price_score * 0.4).min(1.0)
    }

    pub fn state(&self) -> &RegimeState {
        &self.last_state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bull_when_stacked_above() {
        let mut engine = MarketRegimeEngine::new();
        let state = engine.evaluate(2010.0, 2000.0, 1990.0);
        assert_eq!(state.regime, Regime::Bull);
        assert!(state.confidence > 0.0);
    }

    #[test]
    fn bear_when_stacked_below() {
        let mut engine = MarketRegimeEngine::new();
        let state = engine.evaluate(1980.0, 1990.0, 2000.0);
        assert_eq!(state.regime, Regime::Bear);
        assert!(state.confidence > 0.0);
    }

    #[test]
    fn range_when_mixed() {
        let mut engine = MarketRegimeEngine::new();
        // Price above EMA50 but EMA50 below EMA200.
        let state = engine.evaluate(2005.0, 2000.0, 2010.0);
        assert_eq!(state.regime, Regime::Range);
        assert_eq!(state.confidence, 0.0);
    }

    #[test]
    fn close_equal_to_ema50_is_range() {
        let mut engine = MarketRegimeEngine::new();
        let state = engine.evaluate(2000.0, 2000.0, 1990.0);
        assert_eq!(state.regime, Regime::Range);
    }

    #[test]
    fn nan_inputs_degrade_to_range() {
        let mut engine = MarketRegimeEngine::new();
        let state = engine.evaluate(f64::NAN, 2000.0, 1990.0);
        assert_eq!(state.regime, Regime::Range);
        assert_eq!(state.confidence, 0.0);
    }

    #[test]
    fn zero_ema_degrades_to_range() {
        let mut engine = MarketRegimeEngine::new();
        let state = engine.evaluate(2000.0, 0.0, 1990.0);
        assert_eq!(state.regime, Regime::Range);
    }

    #[test]
    fn confidence_caps_at_one() {
        let mut engine = MarketRegimeEngine::new();
        // Huge separations saturate both components.
        let state = engine.evaluate(3000.0, 2500.0, 2000.0);
        assert_eq!(state.regime, Regime::Bull);
        assert!((state.confidence - 1.0).abs() < 1e-12);
    }

    #[test]
    fn confidence_weights_components() {
        // 1% EMA separation saturates the 0.6 component; price right on
        // EMA50 would be RANGE, so nudge it slightly above.
        let mut engine = MarketRegimeEngine::new();
        let state = engine.evaluate(2020.001, 2020.0, 2000.0);
        assert_eq!(state.regime, Regime::Bull);
        assert!((state.confidence - 0.6).abs() < 1e-3);
    }
}
