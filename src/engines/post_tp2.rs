//! Post-TP2 decision engine
//!
//! After TP2 the goal flips from proving the trade to protecting it:
//! capture as much trend as possible toward TP3 while exiting on any
//! confirmed weakness. Thresholds are tighter than the post-TP1 engine
//! and market structure joins the inputs.

use crate::models::{MomentumState, PostTpDecision, Regime, StructureState};

/// Retrace at or beyond this fraction of ATR forces an exit.
const DEEP_RETRACE_ATR: f64 = 0.35;
/// Retrace at or below this fraction of ATR is a shallow pullback: hold.
const SHALLOW_PULLBACK_ATR: f64 = 0.2;
/// Trailing offset behind the current price.
const TRAIL_OFFSET_ATR: f64 = 0.3;
/// Buffer below a swing low used as an alternative trail anchor.
const SWING_BUFFER_ATR: f64 = 0.1;
/// Minimum locked profit above entry.
const MIN_LOCK_ATR: f64 = 0.1;

/// Inputs for one post-TP2 evaluation, all read on bar close.
#[derive(Debug, Clone)]
pub struct PostTp2Context {
    pub current_price: f64,
    pub entry_price: f64,
    pub tp1_price: f64,
    pub tp2_price: f64,
    pub atr14: f64,
    pub regime: Option<Regime>,
    pub momentum: MomentumState,
    pub structure: StructureState,
    pub last_closed_bar_close: f64,
    /// Closed bars since the TP2 transition; 0 means the same bar.
    pub bars_since_tp2: u32,
    pub previous_bar_close: Option<f64>,
    /// Most recent swing low, when one exists.
    pub swing_low: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct PostTp2Verdict {
    pub decision: PostTpDecision,
    pub reason: String,
    /// Present whenever the verdict keeps the trade open with trailing on.
    pub trailing_stop: Option<f64>,
}

pub struct PostTp2Engine;

impl PostTp2Engine {
    /// Priority: same-bar guard, exit conditions (structure break first),
    /// strong-hold conditions, wait conditions, default HOLD.
    pub fn evaluate(ctx: &PostTp2Context) -> PostTp2Verdict {
        if ctx.bars_since_tp2 == 0 {
            return PostTp2Verdict {
                decision: PostTpDecision::Hold,
                reason: "no exit on same bar as TP2 (anti-premature-exit guard)".to_string(),
                trailing_stop: None,
            };
        }

        let retrace = ctx.tp2_price - ctx.current_price;

        // Exit conditions.
        if ctx.structure == StructureState::LowerLow {
            return Self::exit("market structure broken (lower low)".to_string());
        }
        if ctx.momentum == MomentumState::Broken {
            return Self::exit("momentum broken after TP2, exiting".to_string());
        }
        if matches!(ctx.regime, Some(Regime::Range) | Some(Regime::Bear)) {
            return Self::exit(format!(
                "regime no longer supportive: {}",
                ctx.regime.map(|r| r.as_str()).unwrap_or("UNKNOWN")
            ));
        }
        if let Some(prev) = ctx.previous_bar_close {
            if prev < ctx.tp2_price && ctx.last_closed_bar_close < ctx.tp2_price {
                return Self::exit(format!(
                    "TP2 failure confirmed: 2 consecutive bars below {:.2}",
                    ctx.tp2_price
                ));
            }
        }
        if retrace >= DEEP_RETRACE_ATR * ctx.atr14 {
            return Self::exit(format!(
                "deep retracement after TP2: {:.2} >= {:.2} (0.35 x ATR)",
                retrace,
                DEEP_RETRACE_ATR * ctx.atr14
            ));
        }

        // Strong hold conditions.
        if ctx.last_closed_bar_close >= ctx.tp2_price
            && ctx.momentum == MomentumState::Strong
            && ctx.regime == Some(Regime::Bull)
        {
            return Self::hold(ctx, "strong trend continuation after TP2, aiming for TP3".to_string());
        }
        if retrace <= SHALLOW_PULLBACK_ATR * ctx.atr14 {
            return Self::hold(
                ctx,
                format!(
                    "shallow pullback ({:.2} <= {:.2}, 0.2 x ATR), holding for TP3",
                    retrace,
                    SHALLOW_PULLBACK_ATR * ctx.atr14
                ),
            );
        }
        if ctx.structure == StructureState::HigherLows {
            return Self::hold(
                ctx,
                "market structure intact (higher lows), holding for TP3".to_string(),
            );
        }

        // Monitor mode.
        if ctx.momentum == MomentumState::Moderate {
            return Self::wait(ctx, "momentum softening but not broken, monitoring".to_string());
        }
        if ctx.last_closed_bar_close < ctx.tp2_price && ctx.last_closed_bar_close >= ctx.tp1_price {
            return Self::wait(
                ctx,
                format!(
                    "first close below TP2 {:.2} but above TP1 {:.2}, monitoring",
                    ctx.tp2_price, ctx.tp1_price
                ),
            );
        }

        Self::hold(ctx, "TP2 reached, holding for TP3 per default logic".to_string())
    }

    /// Trailing stop after TP2: the tightest of the ATR trail and the
    /// swing-low trail, but never below a minimum profit lock above entry.
    /// Callers apply it through `Position::raise_stop`, so it never lowers
    /// the stop.
    pub fn trailing_stop_after_tp2(
        entry_price: f64,
        current_price: f64,
        atr14: f64,
        swing_low: Option<f64>,
    ) -> f64 {
        let atr_trail = current_price - TRAIL_OFFSET_ATR * atr14;
        let candidate = match swing_low {
            Some(low) => atr_trail.max(low - SWING_BUFFER_ATR * atr14),
            None => atr_trail,
        };
        candidate.max(entry_price + MIN_LOCK_ATR * atr14)
    }

    fn exit(reason: String) -> PostTp2Verdict {
        PostTp2Verdict {
            decision: PostTpDecision::ExitTrade,
            reason,
            trailing_stop: None,
        }
    }

    fn hold(ctx: &PostTp2Context, reason: String) -> PostTp2Verdict {
        PostTp2Verdict {
            decision: PostTpDecision::Hold,
            reason,
            trailing_stop: Some(Self::trailing_stop_after_tp2(
                ctx.entry_price,
                ctx.current_price,
                ctx.atr14,
                ctx.swing_low,
            )),
        }
    }

    fn wait(ctx: &PostTp2Context, reason: String) -> PostTp2Verdict {
        PostTp2Verdict {
            decision: PostTpDecision::WaitNextBar,
            reason,
            trailing_stop: Some(Self::trailing_stop_after_tp2(
                ctx.entry_price,
                ctx.current_price,
                ctx.atr14,
                ctx.swing_low,
            )),
        }
    }
}
