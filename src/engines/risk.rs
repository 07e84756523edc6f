//! Risk Engine
//!
//! Fixed-percent risk sizing: the cash at risk between entry and stop is a
//! constant fraction of equity, position size respects the broker's volume
//! step and limits, and round-trip commission is part of the risk budget.

use tracing::{debug, warn};

use crate::models::SymbolInfo;

/// Tolerance over the configured risk percent before a size is rejected.
const RISK_TOLERANCE_PCT: f64 = 0.1;
/// Guard against float dust when flooring to the volume step.
const STEP_EPSILON: f64 = 1e-9;

/// P/L breakdown for one closed trade.
#[derive(Debug, Clone, Copy)]
pub struct ProfitLoss {
    pub gross_pl: f64,
    pub commission: f64,
    pub net_pl: f64,
    pub price_diff: f64,
}

#[derive(Debug, Clone)]
pub struct RiskEngine {
    pub risk_percent: f64,
    pub commission_per_lot: f64,
}

impl RiskEngine {
    pub fn new(risk_percent: f64, commission_per_lot: f64) -> Self {
        Self {
            risk_percent,
            commission_per_lot,
        }
    }

    /// Size a position in lots, or `None` when no valid size exists.
    ///
    /// Steps: risk cash from equity, raw size from price risk and contract
    /// size, floor to the volume step, clamp to broker limits, validate the
    /// realized risk against the budget (with a 0.1% tolerance), and back
    /// off one step if the clamp pushed risk over. A result below
    /// `volume_min` means the account cannot afford the trade.
    pub fn position_size(
        &self,
        equity: f64,
        entry_price: f64,
        stop_loss: f64,
        symbol_info: &SymbolInfo,
    ) -> Option<f64> {
        let risk_cash = equity * (self.risk_percent / 100.0);
        let price_risk = (entry_price - stop_loss).abs();
        if price_risk == 0.0 {
            warn!("invalid risk: entry price equals stop loss");
            return None;
        }

        let raw = risk_cash / (price_risk * symbol_info.contract_size);

        let step = symbol_info.volume_step;
        let mut size = Self::floor_to_step(raw, step);
        size = size.clamp(symbol_info.volume_min, symbol_info.volume_max);

        if !self.validate_risk(equity, entry_price, stop_loss, size, symbol_info) {
            size = Self::floor_to_step(size - step, step);
        }

        if size + STEP_EPSILON < symbol_info.volume_min {
            warn!(
                equity,
                price_risk, "position size below broker minimum, no trade"
            );
            return None;
        }

        let actual_risk = self.trade_risk(price_risk, size, symbol_info);
        debug!(
            equity,
            risk_cash,
            price_risk,
            size,
            actual_risk,
            actual_risk_pct = actual_risk / equity * 100.0,
            "position size calculated"
        );
        Some(size)
    }

    /// Realized risk stays within `risk_percent + 0.1%` of equity.
    pub fn validate_risk(
        &self,
        equity: f64,
        entry_price: f64,
        stop_loss: f64,
        position_size: f64,
        symbol_info: &SymbolInfo,
    ) -> bool {
        if equity <= 0.0 {
            return false;
        }
        let price_risk = (entry_price - stop_loss).abs();
        let actual_risk = self.trade_risk(price_risk, position_size, symbol_info);
        let actual_pct = actual_risk / equity * 100.0;
        let max_pct = self.risk_percent + RISK_TOLERANCE_PCT;
        if actual_pct > max_pct {
            warn!(actual_pct, max_pct, "risk validation failed");
            false
        } else {
            true
        }
    }

    /// Cash at risk for a size: price risk plus round-trip commission.
    pub fn trade_risk(&self, price_risk: f64, position_size: f64, symbol_info: &SymbolInfo) -> f64 {
        price_risk * position_size * symbol_info.contract_size
            + self.commission_per_lot * position_size * 2.0
    }

    /// P/L for a completed long/short leg at `exit_price`.
    pub fn profit_loss(
        &self,
        position_size: f64,
        entry_price: f64,
        exit_price: f64,
        symbol_info: &SymbolInfo,
    ) -> ProfitLoss {
        let price_diff = exit_price - entry_price;
        let gross_pl = price_diff * position_size * symbol_info.contract_size;
        let commission = self.commission_per_lot * position_size * 2.0;
        ProfitLoss {
            gross_pl,
            commission,
            net_pl: gross_pl - commission,
            price_diff,
        }
    }

    /// Equity floor implied by the max-drawdown setting.
    pub fn max_drawdown_floor(initial_equity: f64, max_drawdown_percent: f64) -> f64 {
        initial_equity * (1.0 - max_drawdown_percent / 100.0)
    }

    fn floor_to_step(volume: f64, step: f64) -> f64 {
        if step <= 0.0 {
            return volume;
        }
        let steps = (volume / step + STEP_EPSILON).floor();
        // Re-quantize to kill accumulated float error in the product.
        (steps * step * 1e8).round() / 1e8
    }
}
