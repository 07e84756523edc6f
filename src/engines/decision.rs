//! Decision Engine
//!
//! The single place trading decisions are made. Live trading, backtests,
//! and the "why no trade" analyzer all call `evaluate` with the same
//! inputs and get the same `DecisionOutput`: the engine is a pure function
//! with no clock and no side effects.
//!
//! The pipeline is strict first-fail, in order:
//! 1. PATTERN_DETECTION
//! 2. PATTERN_QUALITY
//! 3. BREAKOUT_CONFIRMATION
//! 4. TREND_FILTER
//! 5. MOMENTUM_FILTER (optional)
//! 6. QUALITY_GATE (optional)
//! 7. EXECUTION_GUARDS
//! 8. RISK_MODEL
//!
//! Every NO_TRADE carries the failing stage, a machine fail code, and a
//! reason/required/actual triple. No unknown states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::engines::risk::RiskEngine;
use crate::engines::tp_engine::MultiLevelTpEngine;
use crate::models::{AccountState, BarSeries, Direction, Pattern, SymbolInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionVerdict {
    TradeAllowed,
    NoTrade,
}

/// Pipeline stages in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    PatternDetection,
    PatternQuality,
    BreakoutConfirmation,
    TrendFilter,
    MomentumFilter,
    QualityGate,
    ExecutionGuards,
    RiskModel,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::PatternDetection => "PATTERN_DETECTION",
            Stage::PatternQuality => "PATTERN_QUALITY",
            Stage::BreakoutConfirmation => "BREAKOUT_CONFIRMATION",
            Stage::TrendFilter => "TREND_FILTER",
            Stage::MomentumFilter => "MOMENTUM_FILTER",
            Stage::QualityGate => "QUALITY_GATE",
            Stage::ExecutionGuards => "EXECUTION_GUARDS",
            Stage::RiskModel => "RISK_MODEL",
        }
    }
}

/// Machine-readable failure codes, mapped 1:1 to stages plus the short
/// rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailCode {
    PatternNotPresent,
    PatternQualityFail,
    NoBreakoutClose,
    TrendFilterBlock,
    MomentumTooWeak,
    QualityScoreTooLow,
    ExecutionGuardBlock,
    RiskModelFail,
    ShortNotSupported,
}

impl FailCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailCode::PatternNotPresent => "PATTERN_NOT_PRESENT",
            FailCode::PatternQualityFail => "PATTERN_QUALITY_FAIL",
            FailCode::NoBreakoutClose => "NO_BREAKOUT_CLOSE",
            FailCode::TrendFilterBlock => "TREND_FILTER_BLOCK",
            FailCode::MomentumTooWeak => "MOMENTUM_TOO_WEAK",
            FailCode::QualityScoreTooLow => "QUALITY_SCORE_TOO_LOW",
            FailCode::ExecutionGuardBlock => "EXECUTION_GUARD_BLOCK",
            FailCode::RiskModelFail => "RISK_MODEL_FAIL",
            FailCode::ShortNotSupported => "SHORT_NOT_SUPPORTED",
        }
    }
}

/// Where the decision was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionSource {
    Live,
    Backtest,
    Replay,
}

/// Entry quality components, each in [0, 10].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityBreakdown {
    pub pattern: f64,
    pub regime: f64,
    pub momentum: f64,
}

/// Full order plan, present only on TRADE_ALLOWED.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderPlan {
    pub planned_entry: f64,
    pub planned_sl: f64,
    pub planned_tp1: f64,
    pub planned_tp2: f64,
    pub planned_tp3: f64,
    pub calculated_risk_cash: f64,
    pub rr_ratio: f64,
    pub position_size: f64,
}

/// Bar-close guard observations the caller threads through the decision so
/// exports can show them next to the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardFlags {
    pub tick_noise_filter_passed: bool,
    pub anti_fomo_passed: bool,
}

impl Default for GuardFlags {
    fn default() -> Self {
        Self {
            tick_noise_filter_passed: true,
            anti_fomo_passed: true,
        }
    }
}

/// The one and only decision output shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionOutput {
    pub decision: DecisionVerdict,
    pub stage: Stage,
    pub fail_code: Option<FailCode>,
    pub reason: Option<String>,
    pub required: Option<String>,
    pub actual: Option<String>,
    pub plan: Option<OrderPlan>,
    pub entry_quality_score: Option<f64>,
    pub quality_breakdown: Option<QualityBreakdown>,
    pub using_closed_bar: bool,
    pub tick_noise_filter_passed: bool,
    pub anti_fomo_passed: bool,
    pub decision_timestamp: DateTime<Utc>,
    pub decision_source: DecisionSource,
    pub summary: String,
}

impl DecisionOutput {
    pub fn allowed(&self) -> bool {
        self.decision == DecisionVerdict::TradeAllowed
    }
}

/// Everything one evaluation needs. Built identically by the live
/// controller and the backtest loop.
#[derive(Debug, Clone, Copy)]
pub struct DecisionInput<'a> {
    /// Index of the closed bar under evaluation.
    pub bar_index: usize,
    pub series: &'a BarSeries,
    pub pattern: Option<&'a Pattern>,
    pub account: AccountState,
    pub direction: Direction,
    pub symbol_info: Option<&'a SymbolInfo>,
    pub source: DecisionSource,
    pub guard_flags: GuardFlags,
}

/// ATR level at which the momentum quality component saturates, in price
/// units. Tuned for gold on H1.
const ATR_MOMENTUM_SCALE: f64 = 5.0;

pub struct DecisionEngine {
    min_bars_between: i64,
    atr_multiplier_stop: f64,
    momentum_atr_threshold: f64,
    enable_momentum_filter: bool,
    cooldown_bars: i64,
    pyramiding: usize,
    quality_score_threshold: Option<f64>,
    atr_min: f64,
    rr_long: f64,
    risk: RiskEngine,
    tp: MultiLevelTpEngine,
}

impl DecisionEngine {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            min_bars_between: config.strategy.min_bars_between,
            atr_multiplier_stop: config.strategy.atr_multiplier_stop,
            momentum_atr_threshold: config.strategy.momentum_atr_threshold,
            enable_momentum_filter: config.strategy.enable_momentum_filter,
            cooldown_bars: config.cooldown_bars(),
            pyramiding: config.strategy.pyramiding,
            quality_score_threshold: config.strategy.quality_score_threshold,
            atr_min: config.strategy.atr_min,
            rr_long: config.strategy.risk_reward_ratio_long,
            risk: RiskEngine::new(config.risk.risk_percent, config.risk.commission_per_lot),
            tp: MultiLevelTpEngine::new(config.strategy.risk_reward_ratio_long),
        }
    }

    /// Evaluate one closed bar. Pure: the only timestamp in the output is
    /// the input bar's own time.
    pub fn evaluate(&self, input: &DecisionInput<'_>) -> DecisionOutput {
        // Clamp an out-of-range index to the final bar, mirroring the
        // lenient indexing callers rely on for ad-hoc analysis.
        let bar_idx = input.bar_index.min(input.series.len().saturating_sub(1));
        let Some(bar) = input.series.get(bar_idx) else {
            // No bar to stamp provenance from; the epoch keeps the engine
            // clock-free even on this degenerate input.
            return self.reject(
                input,
                DateTime::<Utc>::UNIX_EPOCH,
                Stage::PatternDetection,
                FailCode::PatternNotPresent,
                "empty bar series",
                "at least one closed bar",
                "0 bars",
            );
        };
        let timestamp = bar.time;

        if input.direction == Direction::Short {
            return self.reject(
                input,
                timestamp,
                Stage::ExecutionGuards,
                FailCode::ShortNotSupported,
                "short trades are disabled (long-only mode)",
                "LONG direction only",
                "SHORT requested",
            );
        }

        let close = bar.close;
        let ema50 = bar.ema50;
        let ema200 = bar.ema200;
        let atr = bar.atr14;

        // Stage 1: PATTERN_DETECTION
        let Some(pattern) = input.pattern else {
            return self.reject(
                input,
                timestamp,
                Stage::PatternDetection,
                FailCode::PatternNotPresent,
                "no LONG pattern detected on this bar",
                "LONG pattern present",
                "no pattern",
            );
        };

        // Stage 2: PATTERN_QUALITY
        let left = pattern.left_low.price;
        let right = pattern.right_low.price;
        if left <= 0.0 || right <= 0.0 {
            return self.reject(
                input,
                timestamp,
                Stage::PatternQuality,
                FailCode::PatternQualityFail,
                "invalid low prices in pattern",
                "both lows > 0",
                &format!("left={left}, right={right}"),
            );
        }
        let bars_between = pattern.bars_between();
        if bars_between < self.min_bars_between {
            return self.reject(
                input,
                timestamp,
                Stage::PatternQuality,
                FailCode::PatternQualityFail,
                &format!("pattern separation too small: {bars_between} bars"),
                &format!("minimum {} bars", self.min_bars_between),
                &format!("{bars_between} bars"),
            );
        }

        // Stage 3: BREAKOUT_CONFIRMATION (equality is NOT a break)
        if pattern.neckline <= 0.0 {
            return self.reject(
                input,
                timestamp,
                Stage::BreakoutConfirmation,
                FailCode::NoBreakoutClose,
                "invalid neckline price",
                "neckline > 0",
                &format!("neckline={}", pattern.neckline),
            );
        }
        if close <= pattern.neckline {
            return self.reject(
                input,
                timestamp,
                Stage::BreakoutConfirmation,
                FailCode::NoBreakoutClose,
                "close not above neckline",
                &format!("close > {:.2}", pattern.neckline),
                &format!("close = {close:.2}"),
            );
        }

        // Stage 4: TREND_FILTER
        if close <= ema50 {
            return self.reject(
                input,
                timestamp,
                Stage::TrendFilter,
                FailCode::TrendFilterBlock,
                "price not above EMA50",
                &format!("close > ema50 ({ema50:.2})"),
                &format!("close = {close:.2}"),
            );
        }
        if ema50 <= ema200 {
            return self.reject(
                input,
                timestamp,
                Stage::TrendFilter,
                FailCode::TrendFilterBlock,
                "EMA50 not above EMA200 (bearish regime)",
                &format!("ema50 > ema200 ({ema200:.2})"),
                &format!("ema50 = {ema50:.2}"),
            );
        }

        // Stage 5: MOMENTUM_FILTER (optional)
        if self.enable_momentum_filter {
            if !atr.is_finite() || atr <= 0.0 {
                return self.reject(
                    input,
                    timestamp,
                    Stage::MomentumFilter,
                    FailCode::MomentumTooWeak,
                    "ATR invalid, cannot evaluate momentum",
                    "finite ATR > 0",
                    &format!("atr={atr}"),
                );
            }
            let body = bar.body();
            let required_range = atr * self.momentum_atr_threshold;
            if body < required_range {
                return self.reject(
                    input,
                    timestamp,
                    Stage::MomentumFilter,
                    FailCode::MomentumTooWeak,
                    &format!("bar range too weak: {body:.2}"),
                    &format!(
                        "range >= {required_range:.2} (ATR x {})",
                        self.momentum_atr_threshold
                    ),
                    &format!("range = {body:.2}"),
                );
            }
        }

        // Stage 6: QUALITY_GATE (optional; skipped when the pattern does
        // not carry a score)
        if let (Some(threshold), Some(score)) = (self.quality_score_threshold, pattern.quality_score)
        {
            if score < threshold {
                return self.reject(
                    input,
                    timestamp,
                    Stage::QualityGate,
                    FailCode::QualityScoreTooLow,
                    &format!("pattern quality score too low: {score:.2}"),
                    &format!("score >= {threshold:.2}"),
                    &format!("score = {score:.2}"),
                );
            }
        }

        // Stage 7: EXECUTION_GUARDS
        let bars_since_trade = bar_idx as i64 - input.account.last_trade_bar;
        if bars_since_trade < self.cooldown_bars {
            return self.reject(
                input,
                timestamp,
                Stage::ExecutionGuards,
                FailCode::ExecutionGuardBlock,
                &format!("cooldown not elapsed: {bars_since_trade} bars since last trade"),
                &format!("minimum {} bars", self.cooldown_bars),
                &format!("{bars_since_trade} bars"),
            );
        }
        if input.account.open_positions_count >= self.pyramiding {
            return self.reject(
                input,
                timestamp,
                Stage::ExecutionGuards,
                FailCode::ExecutionGuardBlock,
                &format!(
                    "pyramiding limit reached: {} positions",
                    input.account.open_positions_count
                ),
                &format!("max {} positions", self.pyramiding),
                &format!("{} positions", input.account.open_positions_count),
            );
        }

        // Stage 8: RISK_MODEL
        if !atr.is_finite() || atr <= 0.0 {
            return self.reject(
                input,
                timestamp,
                Stage::RiskModel,
                FailCode::RiskModelFail,
                &format!("invalid ATR value: {atr}"),
                "finite ATR > 0",
                &format!("atr={atr}"),
            );
        }
        if atr < self.atr_min {
            return self.reject(
                input,
                timestamp,
                Stage::RiskModel,
                FailCode::RiskModelFail,
                &format!("ATR too small: {atr:.2} (data quality issue)"),
                &format!("ATR >= {:.2}", self.atr_min),
                &format!("atr={atr:.2}"),
            );
        }
        let stop_distance = atr * self.atr_multiplier_stop;
        if stop_distance <= 0.0 {
            return self.reject(
                input,
                timestamp,
                Stage::RiskModel,
                FailCode::RiskModelFail,
                "invalid stop loss distance",
                "stop distance > 0",
                &format!("stop distance = {stop_distance:.2}"),
            );
        }
        if stop_distance > close * 0.1 {
            return self.reject(
                input,
                timestamp,
                Stage::RiskModel,
                FailCode::RiskModelFail,
                &format!(
                    "stop loss too wide: {:.2} points ({:.1}%)",
                    stop_distance,
                    stop_distance / close * 100.0
                ),
                "stop distance <= 10% of price",
                &format!("{:.1}%", stop_distance / close * 100.0),
            );
        }
        let equity = input.account.equity;
        if equity <= 0.0 {
            return self.reject(
                input,
                timestamp,
                Stage::RiskModel,
                FailCode::RiskModelFail,
                "invalid equity balance",
                "equity > 0",
                &format!("equity = {equity:.2}"),
            );
        }
        let Some(symbol_info) = input.symbol_info else {
            return self.reject(
                input,
                timestamp,
                Stage::RiskModel,
                FailCode::RiskModelFail,
                "missing symbol info for position sizing",
                "symbol info from broker bridge",
                "symbol info = none",
            );
        };

        let entry = close;
        let sl = entry - stop_distance;
        let Some(position_size) = self.risk.position_size(equity, entry, sl, symbol_info) else {
            return self.reject(
                input,
                timestamp,
                Stage::RiskModel,
                FailCode::RiskModelFail,
                "position size calculation failed",
                "position size >= broker minimum",
                "position size = none",
            );
        };

        let Some(levels) = self.tp.calculate_tp_levels(entry, sl, Direction::Long) else {
            return self.reject(
                input,
                timestamp,
                Stage::RiskModel,
                FailCode::RiskModelFail,
                "take-profit ladder calculation failed",
                "monotone TP1 < TP2 and valid risk unit",
                "no valid ladder",
            );
        };

        let calculated_risk_cash = self.risk.trade_risk(stop_distance, position_size, symbol_info);
        let (score, breakdown) = self.quality_score(pattern, close, ema50, ema200, atr);

        DecisionOutput {
            decision: DecisionVerdict::TradeAllowed,
            stage: Stage::RiskModel,
            fail_code: None,
            reason: None,
            required: None,
            actual: None,
            plan: Some(OrderPlan {
                planned_entry: entry,
                planned_sl: sl,
                planned_tp1: levels.tp1,
                planned_tp2: levels.tp2,
                planned_tp3: levels.tp3,
                calculated_risk_cash,
                rr_ratio: self.rr_long,
                position_size,
            }),
            entry_quality_score: Some(score),
            quality_breakdown: Some(breakdown),
            using_closed_bar: true,
            tick_noise_filter_passed: input.guard_flags.tick_noise_filter_passed,
            anti_fomo_passed: input.guard_flags.anti_fomo_passed,
            decision_timestamp: timestamp,
            decision_source: input.source,
            summary: "ENTER LONG".to_string(),
        }
    }

    /// Entry quality in [0, 10] with the component breakdown.
    ///
    /// pattern: symmetry of the two lows (60%) and depth below the
    /// neckline (40%); regime: alignment with BULL weighted by EMA
    /// separation; momentum: ATR proxy. Overall weights 0.3/0.4/0.3.
    fn quality_score(
        &self,
        pattern: &Pattern,
        close: f64,
        ema50: f64,
        ema200: f64,
        atr: f64,
    ) -> (f64, QualityBreakdown) {
        let left = pattern.left_low.price;
        let right = pattern.right_low.price;
        let neckline = pattern.neckline;

        let pattern_score = if left > 0.0 && right > 0.0 {
            let mid = (left + right) / 2.0;
            let symmetry = 1.0 - ((left - right).abs() / mid).min(0.1) / 0.1;
            let depth = if neckline > 0.0 {
                ((neckline - left) / neckline).min(0.05) / 0.05
            } else {
                0.5
            };
            (symmetry * 0.6 + depth * 0.4) * 10.0
        } else {
            5.0
        };

        let regime_score = if close > 0.0 && ema50 > 0.0 && ema200 > 0.0 {
            let is_bull = close > ema50 && ema50 > ema200;
            let aligned = if is_bull { 1.0 } else { 0.3 };
            let spread_pct = ((ema50 - ema200) / ema200).abs() * 100.0;
            let separation = (spread_pct / 1.0).min(1.0);
            aligned * 10.0 * (0.6 + 0.4 * separation)
        } else {
            5.0
        };

        let momentum_score = if atr > 0.0 {
            (atr / ATR_MOMENTUM_SCALE).min(1.0) * 10.0
        } else {
            5.0
        };

        let overall = pattern_score * 0.3 + regime_score * 0.4 + momentum_score * 0.3;
        let round1 = |v: f64| (v * 10.0).round() / 10.0;
        (
            round1(overall),
            QualityBreakdown {
                pattern: round1(pattern_score),
                regime: round1(regime_score),
                momentum: round1(momentum_score),
            },
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn reject(
        &self,
        input: &DecisionInput<'_>,
        timestamp: DateTime<Utc>,
        stage: Stage,
        fail_code: FailCode,
        reason: &str,
        required: &str,
        actual: &str,
    ) -> DecisionOutput {
        DecisionOutput {
            decision: DecisionVerdict::NoTrade,
            stage,
            fail_code: Some(fail_code),
            reason: Some(reason.to_string()),
            required: Some(required.to_string()),
            actual: Some(actual.to_string()),
            plan: None,
            entry_quality_score: None,
            quality_breakdown: None,
            using_closed_bar: true,
            tick_noise_filter_passed: input.guard_flags.tick_noise_filter_passed,
            anti_fomo_passed: input.guard_flags.anti_fomo_passed,
            decision_timestamp: timestamp,
            decision_source: input.source,
            summary: "NO_TRADE".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Bar, PatternPoint};
    use chrono::TimeZone;

    fn happy_bar() -> Bar {
        Bar {
            time: Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap(),
            open: 2000.0,
            high: 2003.5,
            low: 2000.0,
            close: 2001.5,
            tick_volume: None,
            ema50: 2000.0,
            ema200: 1999.0,
            atr14: 5.0,
        }
    }

    fn happy_pattern() -> Pattern {
        Pattern {
            left_low: PatternPoint {
                price: 1990.0,
                bar_index: 0,
            },
            right_low: PatternPoint {
                price: 1990.5,
                bar_index: 6,
            },
            neckline: 2000.0,
            quality_score: None,
        }
    }

    fn engine() -> DecisionEngine {
        DecisionEngine::from_config(&AppConfig::default())
    }

    fn account() -> AccountState {
        AccountState {
            equity: 10_000.0,
            open_positions_count: 0,
            last_trade_bar: -9999,
        }
    }

    struct Fixture {
        series: BarSeries,
        pattern: Pattern,
        symbol: SymbolInfo,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                series: BarSeries::new(vec![happy_bar(), happy_bar()]),
                pattern: happy_pattern(),
                symbol: SymbolInfo::xauusd(),
            }
        }

        fn input(&self) -> DecisionInput<'_> {
            DecisionInput {
                bar_index: 0,
                series: &self.series,
                pattern: Some(&self.pattern),
                account: account(),
                direction: Direction::Long,
                symbol_info: Some(&self.symbol),
                source: DecisionSource::Backtest,
                guard_flags: GuardFlags::default(),
            }
        }
    }

    #[test]
    fn happy_path_allows_trade_with_full_plan() {
        let fx = Fixture::new();
        let out = engine().evaluate(&fx.input());
        assert_eq!(out.decision, DecisionVerdict::TradeAllowed);
        assert_eq!(out.stage, Stage::RiskModel);
        let plan = out.plan.unwrap();
        assert!((plan.planned_entry - 2001.5).abs() < 1e-9);
        assert!((plan.planned_sl - 1991.5).abs() < 1e-9);
        // Unified ladder: 1.4R / 1.8R / 2.0R on a 10.0 risk unit.
        assert!((plan.planned_tp1 - 2015.5).abs() < 1e-9);
        assert!((plan.planned_tp2 - 2019.5).abs() < 1e-9);
        assert!((plan.planned_tp3 - 2021.5).abs() < 1e-9);
        assert!((plan.position_size - 0.10).abs() < 1e-9);
        assert!((plan.calculated_risk_cash - 100.0).abs() < 1e-6);
        assert!(plan.planned_sl < plan.planned_entry);
        assert!(plan.planned_entry < plan.planned_tp1);
        assert!(plan.planned_tp1 < plan.planned_tp2);
        assert!(plan.planned_tp3 >= plan.planned_tp2);
        assert!(out.entry_quality_score.unwrap() > 0.0);
    }

    #[test]
    fn evaluation_is_pure() {
        let fx = Fixture::new();
        let e = engine();
        let first = e.evaluate(&fx.input());
        let second = e.evaluate(&fx.input());
        assert_eq!(first, second);
    }

    #[test]
    fn short_is_rejected_outright() {
        let fx = Fixture::new();
        let mut input = fx.input();
        input.direction = Direction::Short;
        let out = engine().evaluate(&input);
        assert_eq!(out.decision, DecisionVerdict::NoTrade);
        assert_eq!(out.fail_code, Some(FailCode::ShortNotSupported));
    }

    #[test]
    fn missing_pattern_fails_stage_one() {
        let fx = Fixture::new();
        let mut input = fx.input();
        input.pattern = None;
        let out = engine().evaluate(&input);
        assert_eq!(out.stage, Stage::PatternDetection);
        assert_eq!(out.fail_code, Some(FailCode::PatternNotPresent));
    }

    #[test]
    fn narrow_pattern_fails_quality() {
        let mut fx = Fixture::new();
        fx.pattern.right_low.bar_index = 3;
        let out = engine().evaluate(&fx.input());
        assert_eq!(out.stage, Stage::PatternQuality);
        assert_eq!(out.fail_code, Some(FailCode::PatternQualityFail));
        assert!(out.reason.unwrap().contains("separation"));
    }

    #[test]
    fn close_equal_to_neckline_is_not_a_break() {
        let mut fx = Fixture::new();
        let mut bar = happy_bar();
        bar.close = 2000.0;
        fx.series = BarSeries::new(vec![bar.clone(), bar]);
        let out = engine().evaluate(&fx.input());
        assert_eq!(out.stage, Stage::BreakoutConfirmation);
        assert_eq!(out.fail_code, Some(FailCode::NoBreakoutClose));
    }

    #[test]
    fn close_equal_to_ema50_blocks_trend() {
        let mut fx = Fixture::new();
        let mut bar = happy_bar();
        bar.ema50 = bar.close;
        // Keep the breakout intact: neckline below close.
        fx.pattern.neckline = 2001.0;
        fx.series = BarSeries::new(vec![bar.clone(), bar]);
        let out = engine().evaluate(&fx.input());
        assert_eq!(out.stage, Stage::TrendFilter);
        assert_eq!(out.fail_code, Some(FailCode::TrendFilterBlock));
    }

    #[test]
    fn momentum_filter_disabled_by_default() {
        let mut fx = Fixture::new();
        let mut bar = happy_bar();
        bar.open = bar.close - 0.1; // tiny body
        fx.series = BarSeries::new(vec![bar.clone(), bar]);
        let out = engine().evaluate(&fx.input());
        assert!(out.allowed());
    }

    #[test]
    fn momentum_boundary_passes_when_enabled() {
        let mut config = AppConfig::default();
        config.strategy.enable_momentum_filter = true;
        let e = DecisionEngine::from_config(&config);

        let mut fx = Fixture::new();
        let mut bar = happy_bar();
        // Body exactly equal to atr * threshold (5.0 * 0.5 = 2.5).
        bar.open = bar.close - 2.5;
        bar.low = bar.open.min(bar.low);
        fx.series = BarSeries::new(vec![bar.clone(), bar]);
        let out = e.evaluate(&fx.input());
        assert!(out.allowed());

        // One tick weaker fails.
        let mut weak = happy_bar();
        weak.open = weak.close - 2.49;
        weak.low = weak.open.min(weak.low);
        fx.series = BarSeries::new(vec![weak.clone(), weak]);
        let out = e.evaluate(&fx.input());
        assert_eq!(out.fail_code, Some(FailCode::MomentumTooWeak));
    }

    #[test]
    fn quality_gate_blocks_low_scores() {
        let mut config = AppConfig::default();
        config.strategy.quality_score_threshold = Some(7.0);
        let e = DecisionEngine::from_config(&config);

        let mut fx = Fixture::new();
        fx.pattern.quality_score = Some(5.0);
        let out = e.evaluate(&fx.input());
        assert_eq!(out.stage, Stage::QualityGate);
        assert_eq!(out.fail_code, Some(FailCode::QualityScoreTooLow));

        // No score on the pattern: stage is skipped.
        fx.pattern.quality_score = None;
        let out = e.evaluate(&fx.input());
        assert!(out.allowed());
    }

    #[test]
    fn cooldown_blocks_and_reports_bars() {
        let mut fx = Fixture::new();
        // Build enough bars that index 13 exists.
        let bars: Vec<Bar> = (0..15).map(|_| happy_bar()).collect();
        fx.series = BarSeries::new(bars);
        let mut input = fx.input();
        input.bar_index = 13;
        input.account.last_trade_bar = 10;
        let out = engine().evaluate(&input);
        assert_eq!(out.stage, Stage::ExecutionGuards);
        assert_eq!(out.fail_code, Some(FailCode::ExecutionGuardBlock));
        let reason = out.reason.unwrap();
        assert!(reason.contains("3 bars"), "reason was: {reason}");
        assert!(out.required.unwrap().contains('5'));
    }

    #[test]
    fn cooldown_boundary_passes() {
        let fx = Fixture::new();
        let mut input = fx.input();
        // Exactly cooldown_bars (5) elapsed.
        input.bar_index = 1;
        input.account.last_trade_bar = -4;
        let out = engine().evaluate(&input);
        assert!(out.allowed());
    }

    #[test]
    fn pyramiding_limit_blocks() {
        let fx = Fixture::new();
        let mut input = fx.input();
        input.account.open_positions_count = 3;
        let out = engine().evaluate(&input);
        assert_eq!(out.fail_code, Some(FailCode::ExecutionGuardBlock));
        assert!(out.reason.unwrap().contains("pyramiding"));
    }

    #[test]
    fn suspect_atr_fails_risk_model() {
        let mut fx = Fixture::new();
        let mut bar = happy_bar();
        bar.atr14 = 0.3;
        fx.series = BarSeries::new(vec![bar.clone(), bar]);
        let out = engine().evaluate(&fx.input());
        assert_eq!(out.stage, Stage::RiskModel);
        assert_eq!(out.fail_code, Some(FailCode::RiskModelFail));
        assert!(out.reason.unwrap().contains("ATR too small"));
    }

    #[test]
    fn wide_stop_fails_risk_model() {
        let mut fx = Fixture::new();
        let mut bar = happy_bar();
        bar.atr14 = 150.0; // stop distance 300 > 10% of price
        fx.series = BarSeries::new(vec![bar.clone(), bar]);
        let out = engine().evaluate(&fx.input());
        assert_eq!(out.fail_code, Some(FailCode::RiskModelFail));
        assert!(out.reason.unwrap().contains("too wide"));
    }

    #[test]
    fn zero_equity_fails_risk_model() {
        let fx = Fixture::new();
        let mut input = fx.input();
        input.account.equity = 0.0;
        let out = engine().evaluate(&input);
        assert_eq!(out.fail_code, Some(FailCode::RiskModelFail));
    }

    #[test]
    fn missing_symbol_info_fails_risk_model() {
        let fx = Fixture::new();
        let mut input = fx.input();
        input.symbol_info = None;
        let out = engine().evaluate(&input);
        assert_eq!(out.fail_code, Some(FailCode::RiskModelFail));
        assert!(out.reason.unwrap().contains("symbol info"));
    }

    #[test]
    fn every_rejection_carries_triple() {
        let fx = Fixture::new();
        let mut input = fx.input();
        input.pattern = None;
        let out = engine().evaluate(&input);
        assert!(out.fail_code.is_some());
        assert!(out.reason.is_some());
        assert!(out.required.is_some());
        assert!(out.actual.is_some());
    }
}
