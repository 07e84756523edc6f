//! Post-TP1 decision engine
//!
//! Once TP1 is reached the trade is in protection mode. This engine decides
//! HOLD / WAIT_NEXT_BAR / EXIT_TRADE on each closed bar, exiting only on
//! confirmed failure (two bars below TP1, broken momentum, regime flip,
//! deep retrace) and holding through ordinary pullback noise.

use crate::models::{MomentumState, PostTpDecision, Regime};

/// Retrace at or beyond this fraction of ATR forces an exit.
const DEEP_RETRACE_ATR: f64 = 0.5;
/// Retrace at or below this fraction of ATR is a micro-pullback: hold.
const MICRO_PULLBACK_ATR: f64 = 0.25;
/// Stop buffer above entry suggested while holding after TP1.
const SL_OFFSET_ATR: f64 = 0.2;

/// Inputs for one post-TP1 evaluation, all read on bar close.
///
/// `regime` is `None` when the regime engine had no valid read for this
/// bar; an unknown regime neither exits nor holds on its own.
#[derive(Debug, Clone)]
pub struct PostTp1Context {
    pub current_price: f64,
    pub entry_price: f64,
    pub tp1_price: f64,
    pub atr14: f64,
    pub regime: Option<Regime>,
    pub momentum: MomentumState,
    pub last_closed_bar_close: f64,
    /// Closed bars since the TP1 transition; 0 means the same bar.
    pub bars_since_tp1: u32,
    pub previous_bar_close: Option<f64>,
}

/// Decision plus the human-readable reason the analyzer renders.
#[derive(Debug, Clone)]
pub struct PostTp1Verdict {
    pub decision: PostTpDecision,
    pub reason: String,
    pub suggested_stop: Option<f64>,
}

pub struct PostTp1Engine;

impl PostTp1Engine {
    /// Priority: same-bar guard, then exit conditions, then hold
    /// conditions, then wait conditions, default HOLD.
    pub fn evaluate(ctx: &PostTp1Context) -> PostTp1Verdict {
        // Never exit on the bar that touched TP1.
        if ctx.bars_since_tp1 == 0 {
            return PostTp1Verdict {
                decision: PostTpDecision::Hold,
                reason: "no exit on same bar as TP1 (anti-premature-exit guard)".to_string(),
                suggested_stop: None,
            };
        }

        let retrace = ctx.tp1_price - ctx.current_price;

        // Exit conditions first.
        if let Some(prev) = ctx.previous_bar_close {
            if prev < ctx.tp1_price && ctx.last_closed_bar_close < ctx.tp1_price {
                return Self::exit(format!(
                    "TP1 failure confirmed: 2 consecutive bars below {:.2}",
                    ctx.tp1_price
                ));
            }
        }
        if ctx.momentum == MomentumState::Broken {
            return Self::exit("momentum broken after TP1, exiting".to_string());
        }
        if matches!(ctx.regime, Some(Regime::Range) | Some(Regime::Bear)) {
            return Self::exit(format!(
                "regime no longer supportive: {}",
                ctx.regime.map(|r| r.as_str()).unwrap_or("UNKNOWN")
            ));
        }
        if retrace >= DEEP_RETRACE_ATR * ctx.atr14 {
            return Self::exit(format!(
                "deep retracement: {:.2} >= {:.2} (0.5 x ATR)",
                retrace,
                DEEP_RETRACE_ATR * ctx.atr14
            ));
        }

        // Hold conditions.
        if retrace <= MICRO_PULLBACK_ATR * ctx.atr14 {
            return Self::hold(
                ctx,
                format!(
                    "micro-pullback ({:.2} <= {:.2}, 0.25 x ATR), holding for continuation",
                    retrace,
                    MICRO_PULLBACK_ATR * ctx.atr14
                ),
            );
        }
        if ctx.last_closed_bar_close >= ctx.tp1_price {
            return Self::hold(
                ctx,
                format!(
                    "bar close {:.2} >= TP1 {:.2}, holding",
                    ctx.last_closed_bar_close, ctx.tp1_price
                ),
            );
        }
        if ctx.regime == Some(Regime::Bull) {
            return Self::hold(ctx, "bullish regime still active, holding".to_string());
        }

        // Wait conditions (reachable when the regime read is unknown).
        if ctx.last_closed_bar_close < ctx.tp1_price
            && ctx.last_closed_bar_close >= ctx.entry_price
            && ctx.bars_since_tp1 == 1
        {
            return PostTp1Verdict {
                decision: PostTpDecision::WaitNextBar,
                reason: format!(
                    "single-bar pullback to {:.2} (above entry {:.2}), waiting for confirmation",
                    ctx.last_closed_bar_close, ctx.entry_price
                ),
                suggested_stop: None,
            };
        }
        if matches!(ctx.momentum, MomentumState::Strong | MomentumState::Moderate)
            && ctx.last_closed_bar_close < ctx.tp1_price
        {
            return PostTp1Verdict {
                decision: PostTpDecision::WaitNextBar,
                reason: format!(
                    "momentum {:?} still active, waiting for confirmation",
                    ctx.momentum
                ),
                suggested_stop: None,
            };
        }

        Self::hold(ctx, "TP1 reached, holding per default logic".to_string())
    }

    /// Suggested stop after TP1: not exact breakeven, a 0.2 x ATR buffer
    /// above entry. The engine only suggests; the caller decides.
    pub fn suggested_stop_after_tp1(entry_price: f64, atr14: f64) -> f64 {
        entry_price + SL_OFFSET_ATR * atr14
    }

    fn exit(reason: String) -> PostTp1Verdict {
        PostTp1Verdict {
            decision: PostTpDecision::ExitTrade,
            reason,
            suggested_stop: None,
        }
    }

    fn hold(ctx: &PostTp1Context, reason: String) -> PostTp1Verdict {
        PostTp1Verdict {
            decision: PostTpDecision::Hold,
            reason,
            suggested_stop: Some(Self::suggested_stop_after_tp1(ctx.entry_price, ctx.atr14)),
        }
    }
}
