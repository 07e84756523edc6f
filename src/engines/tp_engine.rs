//! Multi-Level Trailing Take-Profit Engine
//!
//! Three targets from one risk unit: TP1 at 1.4R (protection, stop to
//! breakeven), TP2 at 1.8R (trailing stop), TP3 at the configured
//! risk:reward (full close). If the configured TP3 lands inside the
//! TP1/TP2 range it is honored with exit priority and the ladder becomes
//! degenerate; the engine checks TP3 before walking the state machine.
//!
//! State machine: IN_TRADE -> TP1_REACHED -> TP2_REACHED -> EXITED.

use tracing::{debug, error, info};

use crate::models::{Direction, TpState};

/// Fixed risk:reward for the first two targets.
pub const TP1_RR: f64 = 1.4;
pub const TP2_RR: f64 = 1.8;

/// Computed target ladder for a position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TpLevels {
    pub tp1: f64,
    pub tp2: f64,
    pub tp3: f64,
    /// One risk unit: |entry - stop|.
    pub risk: f64,
}

/// Outcome of an exit evaluation on one closed bar.
#[derive(Debug, Clone)]
pub struct ExitCheck {
    pub should_exit: bool,
    pub reason: String,
    pub next_state: TpState,
}

impl ExitCheck {
    fn stay(reason: impl Into<String>, state: TpState) -> Self {
        Self {
            should_exit: false,
            reason: reason.into(),
            next_state: state,
        }
    }

    fn exit(reason: impl Into<String>) -> Self {
        Self {
            should_exit: true,
            reason: reason.into(),
            next_state: TpState::Exited,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MultiLevelTpEngine {
    rr_long: f64,
}

impl MultiLevelTpEngine {
    pub fn new(rr_long: f64) -> Self {
        Self { rr_long }
    }

    /// Compute the TP ladder. Returns `None` when the inputs cannot yield a
    /// valid ladder (zero risk unit, non-monotone result); callers treat
    /// that as a risk-model failure and abort the entry.
    pub fn calculate_tp_levels(
        &self,
        entry_price: f64,
        stop_loss: f64,
        direction: Direction,
    ) -> Option<TpLevels> {
        let risk = (entry_price - stop_loss).abs();
        if risk <= 0.0 || !risk.is_finite() {
            error!(
                entry_price,
                stop_loss, "TP assertion failed: risk unit must be > 0, aborting"
            );
            return None;
        }

        let sign = direction.sign();
        let tp1 = entry_price + sign * risk * TP1_RR;
        let tp2 = entry_price + sign * risk * TP2_RR;
        let tp3_config = entry_price + sign * risk * self.rr_long;

        // Configured TP3 inside the TP1/TP2 range wins with priority.
        let tp3 = match direction {
            Direction::Long => tp3_config.min(tp1).min(tp2),
            Direction::Short => tp3_config.max(tp1).max(tp2),
        };

        let monotone = match direction {
            Direction::Long => tp1 < tp2,
            Direction::Short => tp1 > tp2,
        };
        if !monotone {
            error!(tp1, tp2, tp3, "TP assertion failed: non-monotone ladder, aborting");
            return None;
        }

        if tp3 != tp3_config {
            info!(
                configured = tp3_config,
                effective = tp3,
                "TP3 clamped inside TP1/TP2 range, takes exit priority"
            );
        }

        debug!(entry_price, stop_loss, risk, tp1, tp2, tp3, "TP levels calculated");
        Some(TpLevels { tp1, tp2, tp3, risk })
    }

    /// Evaluate exit conditions for one position on one price observation.
    ///
    /// Never acts intrabar: with `bar_close_confirmed == false` the state is
    /// returned unchanged. Stop loss is checked first, then TP3 priority
    /// (which also covers the clamped degenerate ladder), then the state
    /// ladder itself.
    pub fn evaluate_exit(
        &self,
        current_price: f64,
        stop_loss: f64,
        tp_state: TpState,
        levels: &TpLevels,
        direction: Direction,
        bar_close_confirmed: bool,
    ) -> ExitCheck {
        if !bar_close_confirmed {
            return ExitCheck::stay("waiting for bar close", tp_state);
        }

        let sign = direction.sign();

        // Stop loss always wins.
        if (current_price - stop_loss) * sign <= 0.0 {
            return ExitCheck::exit("Stop Loss");
        }

        // TP3 priority: may fire from any state, including the degenerate
        // ladder where the configured TP3 sits at or below TP1.
        if (current_price - levels.tp3) * sign >= 0.0 {
            info!(current_price, tp3 = levels.tp3, "TP3 reached on bar close");
            return ExitCheck::exit("TP3 Exit");
        }

        match tp_state {
            TpState::InTrade => {
                if (current_price - levels.tp1) * sign >= 0.0 {
                    info!(current_price, tp1 = levels.tp1, "TP1 reached");
                    ExitCheck::stay(
                        "TP1 reached, moving stop to breakeven",
                        TpState::Tp1Reached,
                    )
                } else {
                    ExitCheck::stay("position open", tp_state)
                }
            }
            TpState::Tp1Reached => {
                if (current_price - levels.tp2) * sign >= 0.0 {
                    info!(current_price, tp2 = levels.tp2, "TP2 reached");
                    ExitCheck::stay("TP2 reached, trailing stop active", TpState::Tp2Reached)
                } else {
                    ExitCheck::stay("position open, TP1 reached", tp_state)
                }
            }
            TpState::Tp2Reached => {
                // TP3 was already checked above; nothing else exits here.
                ExitCheck::stay("position open, TP2 reached", tp_state)
            }
            TpState::Exited => ExitCheck::stay("position already exited", tp_state),
        }
    }

    /// Stop adjustment on a state transition: breakeven at TP1, a trailing
    /// offset behind price at TP2. Callers must apply it through
    /// `Position::raise_stop` so the stop never moves down.
    pub fn calculate_new_stop_loss(
        &self,
        current_price: f64,
        entry_price: f64,
        new_state: TpState,
        direction: Direction,
        trailing_offset: f64,
    ) -> Option<f64> {
        match new_state {
            TpState::Tp1Reached => {
                info!(entry_price, "moving stop to breakeven");
                Some(entry_price)
            }
            TpState::Tp2Reached => {
                let new_sl = current_price - direction.sign() * trailing_offset;
                info!(new_sl, trailing_offset, "trailing stop");
                Some(new_sl)
            }
            _ => None,
        }
    }

    /// Next target price for display, given the current state.
    pub fn next_target(&self, tp_state: TpState, levels: &TpLevels) -> Option<f64> {
        match tp_state {
            TpState::InTrade => Some(levels.tp1),
            TpState::Tp1Reached => Some(levels.tp2),
            TpState::Tp2Reached => Some(levels.tp3),
            TpState::Exited => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> MultiLevelTpEngine {
        MultiLevelTpEngine::new(2.0)
    }

    #[test]
    fn ladder_from_risk_unit() {
        // entry 2000, sl 1990: risk 10 -> tp1 2014, tp2 2018, tp3 2020.
        let levels = engine()
            .calculate_tp_levels(2000.0, 1990.0, Direction::Long)
            .unwrap();
        assert!((levels.tp1 - 2014.0).abs() < 1e-9);
        assert!((levels.tp2 - 2018.0).abs() < 1e-9);
        assert!((levels.tp3 - 2020.0).abs() < 1e-9);
        assert!((levels.risk - 10.0).abs() < 1e-9);
    }

    #[test]
    fn zero_risk_aborts() {
        assert!(engine()
            .calculate_tp_levels(2000.0, 2000.0, Direction::Long)
            .is_none());
    }

    #[test]
    fn configured_tp3_inside_range_is_clamped_with_priority() {
        // rr 1.0 puts the configured TP3 at 2010, below TP1 (2014).
        let tight = MultiLevelTpEngine::new(1.0);
        let levels = tight
            .calculate_tp_levels(2000.0, 1990.0, Direction::Long)
            .unwrap();
        assert!((levels.tp3 - 2010.0).abs() < 1e-9);
        assert!(levels.tp3 < levels.tp1);

        // From IN_TRADE, touching the clamped TP3 exits outright.
        let check = tight.evaluate_exit(2010.0, 1990.0, TpState::InTrade, &levels, Direction::Long, true);
        assert!(check.should_exit);
        assert_eq!(check.reason, "TP3 Exit");
    }

    #[test]
    fn no_action_intrabar() {
        let levels = engine()
            .calculate_tp_levels(2000.0, 1990.0, Direction::Long)
            .unwrap();
        let check =
            engine().evaluate_exit(2050.0, 1990.0, TpState::InTrade, &levels, Direction::Long, false);
        assert!(!check.should_exit);
        assert_eq!(check.next_state, TpState::InTrade);
        assert!(check.reason.contains("bar close"));
    }

    #[test]
    fn stop_loss_checked_first() {
        let levels = engine()
            .calculate_tp_levels(2000.0, 1990.0, Direction::Long)
            .unwrap();
        let check =
            engine().evaluate_exit(1990.0, 1990.0, TpState::InTrade, &levels, Direction::Long, true);
        assert!(check.should_exit);
        assert_eq!(check.reason, "Stop Loss");
        assert_eq!(check.next_state, TpState::Exited);
    }

    #[test]
    fn raised_stop_hit_after_tp1() {
        let levels = engine()
            .calculate_tp_levels(2000.0, 1990.0, Direction::Long)
            .unwrap();
        // Stop already raised to entry; a close at entry exits at breakeven.
        let check =
            engine().evaluate_exit(2000.0, 2000.0, TpState::Tp1Reached, &levels, Direction::Long, true);
        assert!(check.should_exit);
        assert_eq!(check.reason, "Stop Loss");
    }

    #[test]
    fn full_progression() {
        let e = engine();
        let levels = e.calculate_tp_levels(2000.0, 1990.0, Direction::Long).unwrap();

        let c = e.evaluate_exit(2010.0, 1990.0, TpState::InTrade, &levels, Direction::Long, true);
        assert_eq!(c.next_state, TpState::InTrade);

        let c = e.evaluate_exit(2014.0, 1990.0, TpState::InTrade, &levels, Direction::Long, true);
        assert!(!c.should_exit);
        assert_eq!(c.next_state, TpState::Tp1Reached);

        let c = e.evaluate_exit(2018.0, 2000.0, TpState::Tp1Reached, &levels, Direction::Long, true);
        assert!(!c.should_exit);
        assert_eq!(c.next_state, TpState::Tp2Reached);

        let c = e.evaluate_exit(2020.0, 2017.5, TpState::Tp2Reached, &levels, Direction::Long, true);
        assert!(c.should_exit);
        assert_eq!(c.reason, "TP3 Exit");
    }

    #[test]
    fn stop_suggestions_per_transition() {
        let e = engine();
        assert_eq!(
            e.calculate_new_stop_loss(2014.0, 2000.0, TpState::Tp1Reached, Direction::Long, 0.5),
            Some(2000.0)
        );
        assert_eq!(
            e.calculate_new_stop_loss(2018.0, 2000.0, TpState::Tp2Reached, Direction::Long, 0.5),
            Some(2017.5)
        );
        assert_eq!(
            e.calculate_new_stop_loss(2020.0, 2000.0, TpState::Exited, Direction::Long, 0.5),
            None
        );
    }

    #[test]
    fn next_target_tracks_state() {
        let e = engine();
        let levels = e.calculate_tp_levels(2000.0, 1990.0, Direction::Long).unwrap();
        assert_eq!(e.next_target(TpState::InTrade, &levels), Some(levels.tp1));
        assert_eq!(e.next_target(TpState::Tp1Reached, &levels), Some(levels.tp2));
        assert_eq!(e.next_target(TpState::Tp2Reached, &levels), Some(levels.tp3));
        assert_eq!(e.next_target(TpState::Exited, &levels), None);
    }
}
