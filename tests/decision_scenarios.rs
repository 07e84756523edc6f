//! End-to-end decision scenarios with literal inputs.

use aurumbot::config::AppConfig;
use aurumbot::engines::decision::{
    DecisionEngine, DecisionInput, DecisionSource, DecisionVerdict, FailCode, GuardFlags, Stage,
};
use aurumbot::models::{
    AccountState, Bar, BarSeries, Direction, Pattern, PatternPoint, SymbolInfo,
};
use chrono::{TimeZone, Utc};

fn scenario_bar(close: f64) -> Bar {
    Bar {
        time: Utc.with_ymd_and_hms(2024, 3, 4, 14, 0, 0).unwrap(),
        open: 2000.0,
        high: 2003.5,
        low: 2000.0,
        close,
        tick_volume: Some(1200),
        ema50: 2000.0,
        ema200: 1999.0,
        atr14: 5.0,
    }
}

fn scenario_pattern() -> Pattern {
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

fn scenario_account() -> AccountState {
    AccountState {
        equity: 10_000.0,
        open_positions_count: 0,
        last_trade_bar: -9999,
    }
}

fn evaluate(close: f64, account: AccountState, bar_index: usize) -> aurumbot::engines::DecisionOutput {
    let engine = DecisionEngine::from_config(&AppConfig::default());
    let mut bars: Vec<Bar> = (0..=bar_index).map(|_| scenario_bar(close)).collect();
    bars.push(scenario_bar(close)); // forming bar
    let series = BarSeries::new(bars);
    let pattern = scenario_pattern();
    let symbol = SymbolInfo::xauusd();
    engine.evaluate(&DecisionInput {
        bar_index,
        series: &series,
        pattern: Some(&pattern),
        account,
        direction: Direction::Long,
        symbol_info: Some(&symbol),
        source: DecisionSource::Backtest,
        guard_flags: GuardFlags::default(),
    })
}

#[test]
fn happy_path_entry() {
    let out = evaluate(2001.5, scenario_account(), 0);
    assert_eq!(out.decision, DecisionVerdict::TradeAllowed);
    let plan = out.plan.expect("plan on TRADE_ALLOWED");

    // Stop: close - atr * multiplier = 2001.5 - 10.
    assert!((plan.planned_sl - 1991.5).abs() < 1e-9);
    // Ladder at 1.4R / 1.8R / 2.0R on the 10.0 risk unit.
    assert!((plan.planned_tp1 - 2015.5).abs() < 1e-9);
    assert!((plan.planned_tp2 - 2019.5).abs() < 1e-9);
    assert!((plan.planned_tp3 - 2021.5).abs() < 1e-9);
    assert!((plan.position_size - 0.10).abs() < 1e-9);
    assert!((plan.calculated_risk_cash - 100.0).abs() < 1e-6);

    // Ordering invariants for an allowed trade.
    assert!(plan.planned_sl < plan.planned_entry);
    assert!(plan.planned_entry < plan.planned_tp1);
    assert!(plan.planned_tp1 < plan.planned_tp2);
    assert!(plan.planned_tp3 >= plan.planned_tp2);

    // Risk budget respected with tolerance.
    assert!(plan.calculated_risk_cash / 10_000.0 * 100.0 <= 1.0 + 0.1);

    // Size is a multiple of the volume step within broker limits.
    let steps = plan.position_size / 0.01;
    assert!((steps - steps.round()).abs() < 1e-6);

    // Quality score present with its breakdown.
    let score = out.entry_quality_score.unwrap();
    assert!((0.0..=10.0).contains(&score));
    let breakdown = out.quality_breakdown.unwrap();
    assert!(breakdown.pattern >= 0.0 && breakdown.pattern <= 10.0);
    assert!(breakdown.regime >= 0.0 && breakdown.regime <= 10.0);
    assert!(breakdown.momentum >= 0.0 && breakdown.momentum <= 10.0);
    assert!(out.using_closed_bar);
}

#[test]
fn breakout_fails_on_equality() {
    let out = evaluate(2000.0, scenario_account(), 0);
    assert_eq!(out.decision, DecisionVerdict::NoTrade);
    assert_eq!(out.stage, Stage::BreakoutConfirmation);
    assert_eq!(out.fail_code, Some(FailCode::NoBreakoutClose));
    assert!(out.reason.is_some());
    assert!(out.required.is_some());
    assert!(out.actual.is_some());
}

#[test]
fn cooldown_block_reports_three_of_five() {
    let account = AccountState {
        equity: 10_000.0,
        open_positions_count: 0,
        last_trade_bar: 10,
    };
    let out = evaluate(2001.5, account, 13);
    assert_eq!(out.decision, DecisionVerdict::NoTrade);
    assert_eq!(out.stage, Stage::ExecutionGuards);
    assert_eq!(out.fail_code, Some(FailCode::ExecutionGuardBlock));
    let reason = out.reason.unwrap();
    assert!(reason.contains("3 bars"), "reason: {reason}");
    assert!(out.required.unwrap().contains("5 bars"));
}

#[test]
fn first_fail_order_is_stable() {
    // A bar that violates several stages at once reports the earliest.
    let engine = DecisionEngine::from_config(&AppConfig::default());
    let mut bar = scenario_bar(1995.0); // below neckline AND below EMA50
    bar.ema50 = 1998.0;
    bar.ema200 = 1999.5; // bearish stack as well
    let series = BarSeries::new(vec![bar.clone(), bar]);
    let pattern = scenario_pattern();
    let symbol = SymbolInfo::xauusd();
    let out = engine.evaluate(&DecisionInput {
        bar_index: 0,
        series: &series,
        pattern: Some(&pattern),
        account: scenario_account(),
        direction: Direction::Long,
        symbol_info: Some(&symbol),
        source: DecisionSource::Backtest,
        guard_flags: GuardFlags::default(),
    });
    assert_eq!(out.stage, Stage::BreakoutConfirmation);
    assert_eq!(out.fail_code, Some(FailCode::NoBreakoutClose));
}

#[test]
fn replaying_the_same_input_is_identical() {
    let a = evaluate(2001.5, scenario_account(), 0);
    let b = evaluate(2001.5, scenario_account(), 0);
    assert_eq!(a, b);

    let reject_a = evaluate(2000.0, scenario_account(), 0);
    let reject_b = evaluate(2000.0, scenario_account(), 0);
    assert_eq!(reject_a, reject_b);
}
