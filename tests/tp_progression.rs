//! Multi-level take-profit progression scenarios, driven through the TP
//! engine and the position store exactly as the controller drives them.

use aurumbot::engines::tp_engine::MultiLevelTpEngine;
use aurumbot::engines::RiskEngine;
use aurumbot::models::{
    Direction, Position, PostTpDecision, SymbolInfo, TpState,
};
use aurumbot::state::StateManager;
use chrono::{TimeZone, Utc};

fn open_position(store: &StateManager, levels: &aurumbot::engines::TpLevels) {
    store.open_position(Position {
        ticket: 1,
        direction: Direction::Long,
        entry_time: Utc.with_ymd_and_hms(2024, 2, 1, 9, 0, 0).unwrap(),
        entry_price: 2000.0,
        volume: 0.1,
        initial_stop_loss: 1990.0,
        current_stop_loss: 1990.0,
        take_profit: levels.tp3,
        tp1_price: levels.tp1,
        tp2_price: levels.tp2,
        tp3_price: levels.tp3,
        tp_state: TpState::InTrade,
        tp_state_changed_at: None,
        bars_held_after_tp1: 0,
        bars_held_after_tp2: 0,
        max_extension_after_tp1: 0.0,
        max_extension_after_tp2: 0.0,
        post_tp1_decision: PostTpDecision::NotReached,
        post_tp2_decision: PostTpDecision::NotReached,
        tp1_exit_reason: None,
        tp2_exit_reason: None,
        trailing_sl_level: None,
        trailing_sl_enabled: false,
        atr_at_entry: 5.0,
        pattern_snapshot: None,
        price_current: None,
        unrealized_profit: None,
        swap: 0.0,
    });
}

/// Run one closed bar through the engine + store, mirroring the
/// controller: stop/TP3 first, then transitions with their stop raises.
fn step(
    store: &StateManager,
    engine: &MultiLevelTpEngine,
    close: f64,
) -> Option<(String, f64)> {
    let position = store.position(1)?;
    let levels = aurumbot::engines::TpLevels {
        tp1: position.tp1_price,
        tp2: position.tp2_price,
        tp3: position.tp3_price,
        risk: (position.entry_price - position.initial_stop_loss).abs(),
    };
    let check = engine.evaluate_exit(
        close,
        position.current_stop_loss,
        position.tp_state,
        &levels,
        position.direction,
        true,
    );
    if check.should_exit {
        let record = store
            .close_position(
                1,
                close,
                &check.reason,
                Utc::now(),
                &SymbolInfo::xauusd(),
                &RiskEngine::new(1.0, 0.0),
                None,
            )
            .unwrap();
        return Some((record.exit_reason, record.net_pl));
    }
    if check.next_state != position.tp_state {
        let new_sl = engine.calculate_new_stop_loss(
            close,
            position.entry_price,
            check.next_state,
            position.direction,
            0.5,
        );
        store.update_position_tp_state(1, check.next_state, new_sl, None, None, None);
    }
    None
}

#[test]
fn full_tp_progression_to_tp3_exit() {
    // entry 2000, sl 1990 -> tp1 2014, tp2 2018, tp3 2020 at rr 2.0.
    let engine = MultiLevelTpEngine::new(2.0);
    let levels = engine
        .calculate_tp_levels(2000.0, 1990.0, Direction::Long)
        .unwrap();
    assert_eq!(levels.tp1, 2014.0);
    assert_eq!(levels.tp2, 2018.0);
    assert_eq!(levels.tp3, 2020.0);

    let store = StateManager::in_memory();
    open_position(&store, &levels);

    let mut states = Vec::new();
    let mut stops = Vec::new();
    let mut exit = None;
    for close in [2010.0, 2014.0, 2015.0, 2018.0, 2019.0, 2020.0] {
        exit = step(&store, &engine, close);
        if let Some(p) = store.position(1) {
            states.push(p.tp_state);
            stops.push(p.current_stop_loss);
        }
    }

    assert_eq!(
        states,
        vec![
            TpState::InTrade,    // 2010
            TpState::Tp1Reached, // 2014: SL -> breakeven
            TpState::Tp1Reached, // 2015
            TpState::Tp2Reached, // 2018: trailing SL
            TpState::Tp2Reached, // 2019
        ]
    );
    // Breakeven after TP1, trailing (close - 0.5) after TP2, monotone.
    assert_eq!(stops[1], 2000.0);
    assert_eq!(stops[3], 2017.5);
    assert!(stops.windows(2).all(|w| w[1] >= w[0]));

    let (reason, net_pl) = exit.expect("TP3 close on the final bar");
    assert_eq!(reason, "TP3 Exit");
    // 20.0 points * 0.1 lots * 100 contract.
    assert!((net_pl - 200.0).abs() < 1e-9);
    assert!(!store.has_open_position());
    assert_eq!(store.statistics().winning_trades, 1);
}

#[test]
fn breakeven_saves_the_trade() {
    let engine = MultiLevelTpEngine::new(2.0);
    let levels = engine
        .calculate_tp_levels(2000.0, 1990.0, Direction::Long)
        .unwrap();

    let store = StateManager::in_memory();
    open_position(&store, &levels);

    // TP1 touches at 2014: stop moves to entry.
    assert!(step(&store, &engine, 2014.0).is_none());
    assert_eq!(store.position(1).unwrap().current_stop_loss, 2000.0);

    // Pullback: 2013 and 2005 stay above the raised stop.
    assert!(step(&store, &engine, 2013.0).is_none());
    assert!(step(&store, &engine, 2005.0).is_none());

    // 1999.5 crosses the raised stop: exit at breakeven, not at 1990.
    let (reason, net_pl) = step(&store, &engine, 1999.5).expect("stop exit");
    assert_eq!(reason, "Stop Loss");
    // Exit evaluates on the closed bar at 1999.5: net is a 0.5 point loss
    // on 0.1 lots, -5.0 before costs, rather than the original -100 risk.
    assert!((net_pl + 5.0).abs() < 1e-9);
}

#[test]
fn clamped_tp3_exits_with_priority() {
    // rr 1.0 puts the configured TP3 below TP1; it keeps exit priority.
    let engine = MultiLevelTpEngine::new(1.0);
    let levels = engine
        .calculate_tp_levels(2000.0, 1990.0, Direction::Long)
        .unwrap();
    assert!(levels.tp3 < levels.tp1);

    let store = StateManager::in_memory();
    open_position(&store, &levels);

    let exit = step(&store, &engine, levels.tp3).expect("priority exit");
    assert_eq!(exit.0, "TP3 Exit");
}

#[test]
fn bars_held_counters_advance_once_per_closed_bar() {
    let engine = MultiLevelTpEngine::new(2.0);
    let levels = engine
        .calculate_tp_levels(2000.0, 1990.0, Direction::Long)
        .unwrap();
    let store = StateManager::in_memory();
    open_position(&store, &levels);

    // Reach TP1, then hold below TP2 for three closed bars, advancing the
    // counter the way the controller does.
    step(&store, &engine, 2014.0);
    for expected in 1..=3u32 {
        let position = store.position(1).unwrap();
        assert_eq!(position.tp_state, TpState::Tp1Reached);
        store.update_position_tp_state(
            1,
            TpState::Tp1Reached,
            None,
            None,
            Some(position.bars_held_after_tp1 + 1),
            None,
        );
        step(&store, &engine, 2015.0);
        assert_eq!(store.position(1).unwrap().bars_held_after_tp1, expected);
    }
}
