//! Backtest engine
//!
//! Historical replay over a seekable bar series. The decision path is the
//! exact same `DecisionEngine` the live controller calls; orders mutate an
//! in-memory book instead of a broker. Re-running the same series yields
//! the same decision sequence and the same trade history. The loop checks
//! a cancellation flag between bars.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::controller::PatternSource;
use crate::engines::decision::{
    DecisionEngine, DecisionInput, DecisionOutput, DecisionSource, GuardFlags,
};
use crate::engines::post_tp1::{PostTp1Context, PostTp1Engine};
use crate::engines::post_tp2::{PostTp2Context, PostTp2Engine};
use crate::engines::tp_engine::{MultiLevelTpEngine, TpLevels};
use crate::engines::{BarCloseGuard, MarketReader, MarketRegimeEngine, RiskEngine};
use crate::models::{
    AccountState, BarSeries, Direction, Position, PostTpDecision, Regime, SymbolInfo, TpState,
    TradeStatistics,
};
use crate::state::{PositionPatch, StateManager};

/// Points trailed behind price on the TP2 transition, matching the live
/// controller.
const TRAILING_OFFSET: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct BacktestSettings {
    pub initial_equity: f64,
    /// Bars skipped at the start while indicators warm up.
    pub warmup_bars: usize,
}

impl Default for BacktestSettings {
    fn default() -> Self {
        Self {
            initial_equity: 10_000.0,
            warmup_bars: 200,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BacktestReport {
    pub decisions: Vec<DecisionOutput>,
    pub trades: Vec<crate::models::TradeRecord>,
    pub statistics: TradeStatistics,
    pub initial_equity: f64,
    pub final_equity: f64,
    pub bars_evaluated: usize,
    pub cancelled: bool,
}

pub struct BacktestEngine {
    symbol_info: SymbolInfo,
    decision_engine: DecisionEngine,
    tp_engine: MultiLevelTpEngine,
    risk: RiskEngine,
}

impl BacktestEngine {
    pub fn new(config: AppConfig) -> Self {
        Self {
            symbol_info: SymbolInfo::xauusd(),
            decision_engine: DecisionEngine::from_config(&config),
            tp_engine: MultiLevelTpEngine::new(config.strategy.risk_reward_ratio_long),
            risk: RiskEngine::new(config.risk.risk_percent, config.risk.commission_per_lot),
        }
    }

    pub fn with_symbol_info(mut self, symbol_info: SymbolInfo) -> Self {
        self.symbol_info = symbol_info;
        self
    }

    /// Replay the series. The final element is treated as a forming bar,
    /// exactly as the live path treats broker data.
    pub fn run(
        &self,
        series: &BarSeries,
        patterns: &dyn PatternSource,
        settings: &BacktestSettings,
        cancel: &AtomicBool,
    ) -> BacktestReport {
        let store = StateManager::in_memory();
        let mut guard = BarCloseGuard::disabled_filters();
        let mut regime_engine = MarketRegimeEngine::new();

        let mut decisions = Vec::new();
        let mut equity = settings.initial_equity;
        let mut last_trade_bar: i64 = -9999;
        let mut next_ticket: u64 = 1;
        let mut bars_evaluated = 0usize;
        let mut cancelled = false;

        let Some(last_closed) = series.last_closed_index() else {
            return self.report(&store, decisions, settings, equity, 0, false);
        };

        for idx in settings.warmup_bars..=last_closed {
            if cancel.load(Ordering::Relaxed) {
                info!(idx, "backtest cancelled");
                cancelled = true;
                break;
            }

            if guard.validate_bar_state(series, idx).is_err() {
                continue;
            }
            bars_evaluated += 1;

            let bar = series.get(idx).expect("validated index");
            let regime = regime_engine.evaluate(bar.close, bar.ema50, bar.ema200);

            // Exits first, on the freshly closed bar.
            self.manage_positions(
                &store,
                series,
                idx,
                known_regime_label(&regime),
                &mut equity,
                &mut last_trade_bar,
            );

            // Entry evaluation mirrors the live controller byte for byte.
            let pattern = patterns.detect(series, idx);
            let input = DecisionInput {
                bar_index: idx,
                series,
                pattern: pattern.as_ref(),
                account: AccountState {
                    equity,
                    open_positions_count: store.open_position_count(),
                    last_trade_bar,
                },
                direction: Direction::Long,
                symbol_info: Some(&self.symbol_info),
                source: DecisionSource::Backtest,
                guard_flags: GuardFlags::default(),
            };
            let output = self.decision_engine.evaluate(&input);

            if let Some(plan) = output.plan {
                let ticket = next_ticket;
                next_ticket += 1;
                debug!(idx, ticket, entry = plan.planned_entry, "backtest entry");
                store.open_position(Position {
                    ticket,
                    direction: Direction::Long,
                    entry_time: bar.time,
                    entry_price: plan.planned_entry,
                    volume: plan.position_size,
                    initial_stop_loss: plan.planned_sl,
                    current_stop_loss: plan.planned_sl,
                    take_profit: plan.planned_tp3,
                    tp1_price: plan.planned_tp1,
                    tp2_price: plan.planned_tp2,
                    tp3_price: plan.planned_tp3,
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
                    atr_at_entry: bar.atr14,
                    pattern_snapshot: pattern,
                    price_current: Some(plan.planned_entry),
                    unrealized_profit: Some(0.0),
                    swap: 0.0,
                });
                last_trade_bar = idx as i64;
            }

            decisions.push(output);
        }

        self.report(&store, decisions, settings, equity, bars_evaluated, cancelled)
    }

    fn manage_positions(
        &self,
        store: &StateManager,
        series: &BarSeries,
        idx: usize,
        regime: Option<Regime>,
        equity: &mut f64,
        last_trade_bar: &mut i64,
    ) {
        if !store.has_open_position() {
            return;
        }
        let bar = series.get(idx).expect("validated index");
        let momentum = MarketReader::momentum(series, idx);
        let structure = MarketReader::structure(series, idx);
        let swing_low = MarketReader::latest_swing_low(series, idx);
        let previous_close = idx.checked_sub(1).and_then(|i| series.get(i)).map(|b| b.close);

        for position in store.positions() {
            let levels = TpLevels {
                tp1: position.tp1_price,
                tp2: position.tp2_price,
                tp3: position.tp3_price,
                risk: (position.entry_price - position.initial_stop_loss).abs(),
            };

            let check = self.tp_engine.evaluate_exit(
                bar.close,
                position.current_stop_loss,
                position.tp_state,
                &levels,
                position.direction,
                true,
            );

            if check.should_exit {
                self.settle(store, &position, bar.close, &check.reason, bar.time, equity);
                *last_trade_bar = idx as i64;
                continue;
            }

            if check.next_state != position.tp_state {
                let new_sl = self.tp_engine.calculate_new_stop_loss(
                    bar.close,
                    position.entry_price,
                    check.next_state,
                    position.direction,
                    TRAILING_OFFSET,
                );
                store.update_position_tp_state(
                    position.ticket,
                    check.next_state,
                    new_sl,
                    Some(bar.time),
                    None,
                    None,
                );
                continue;
            }

            match position.tp_state {
                TpState::Tp1Reached => {
                    let bars_since = position.bars_held_after_tp1 + 1;
                    store.update_position_tp_state(
                        position.ticket,
                        TpState::Tp1Reached,
                        None,
                        None,
                        Some(bars_since),
                        None,
                    );
                    let verdict = PostTp1Engine::evaluate(&PostTp1Context {
                        current_price: bar.close,
                        entry_price: position.entry_price,
                        tp1_price: position.tp1_price,
                        atr14: bar.atr14,
                        regime,
                        momentum,
                        last_closed_bar_close: bar.close,
                        bars_since_tp1: bars_since,
                        previous_bar_close: previous_close,
                    });
                    store.update_tp_exit_metadata(
                        position.ticket,
                        PositionPatch {
                            post_tp1_decision: Some(verdict.decision),
                            tp1_exit_reason: Some(verdict.reason.clone()),
                            max_extension_after_tp1: Some(bar.high),
                            ..Default::default()
                        },
                    );
                    match verdict.decision {
                        PostTpDecision::ExitTrade => {
                            self.settle(store, &position, bar.close, &verdict.reason, bar.time, equity);
                            *last_trade_bar = idx as i64;
                        }
                        PostTpDecision::Hold => {
                            if let Some(suggested) = verdict.suggested_stop {
                                if suggested > position.current_stop_loss {
                                    store.update_position_tp_state(
                                        position.ticket,
                                        TpState::Tp1Reached,
                                        Some(suggested),
                                        None,
                                        None,
                                        None,
                                    );
                                }
                            }
                        }
                        _ => {}
                    }
                }
                TpState::Tp2Reached => {
                    let bars_since = position.bars_held_after_tp2 + 1;
                    store.update_position_tp_state(
                        position.ticket,
                        TpState::Tp2Reached,
                        None,
                        None,
                        None,
                        Some(bars_since),
                    );
                    let verdict = PostTp2Engine::evaluate(&PostTp2Context {
                        current_price: bar.close,
                        entry_price: position.entry_price,
                        tp1_price: position.tp1_price,
                        tp2_price: position.tp2_price,
                        atr14: bar.atr14,
                        regime,
                        momentum,
                        structure,
                        last_closed_bar_close: bar.close,
                        bars_since_tp2: bars_since,
                        previous_bar_close: previous_close,
                        swing_low,
                    });
                    store.update_tp_exit_metadata(
                        position.ticket,
                        PositionPatch {
                            post_tp2_decision: Some(verdict.decision),
                            tp2_exit_reason: Some(verdict.reason.clone()),
                            trailing_sl_level: verdict.trailing_stop,
                            trailing_sl_enabled: Some(verdict.trailing_stop.is_some()),
                            max_extension_after_tp2: Some(bar.high),
                            ..Default::default()
                        },
                    );
                    match verdict.decision {
                        PostTpDecision::ExitTrade => {
                            self.settle(store, &position, bar.close, &verdict.reason, bar.time, equity);
                            *last_trade_bar = idx as i64;
                        }
                        _ => {
                            if let Some(trail) = verdict.trailing_stop {
                                if trail > position.current_stop_loss {
                                    store.update_position_tp_state(
                                        position.ticket,
                                        TpState::Tp2Reached,
                                        Some(trail),
                                        None,
                                        None,
                                        None,
                                    );
                                }
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn settle(
        &self,
        store: &StateManager,
        position: &Position,
        price: f64,
        reason: &str,
        time: chrono::DateTime<chrono::Utc>,
        equity: &mut f64,
    ) {
        if let Some(record) = store.close_position(
            position.ticket,
            price,
            reason,
            time,
            &self.symbol_info,
            &self.risk,
            None,
        ) {
            *equity += record.net_pl;
        }
    }

    fn report(
        &self,
        store: &StateManager,
        decisions: Vec<DecisionOutput>,
        settings: &BacktestSettings,
        final_equity: f64,
        bars_evaluated: usize,
        cancelled: bool,
    ) -> BacktestReport {
        let statistics = store.statistics();
        info!(
            trades = statistics.total_trades,
            win_rate = statistics.win_rate,
            profit = statistics.total_profit,
            final_equity,
            bars_evaluated,
            cancelled,
            "backtest complete"
        );
        BacktestReport {
            decisions,
            trades: store.recent_trades(usize::MAX),
            statistics,
            initial_equity: settings.initial_equity,
            final_equity,
            bars_evaluated,
            cancelled,
        }
    }
}

/// Same unknown-regime mapping as the live controller.
fn known_regime_label(state: &crate::models::RegimeState) -> Option<Regime> {
    if state.regime == Regime::Range
        && state.confidence == 0.0
        && state.ema50_ema200_distance_pct == 0.0
        && state.price_ema50_distance_pct == 0.0
    {
        None
    } else {
        Some(state.regime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Bar, Pattern, PatternPoint};
    use chrono::{TimeZone, Utc};

    fn bar(i: usize, open: f64, close: f64) -> Bar {
        Bar {
            time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
                + chrono::Duration::hours(i as i64),
            open,
            high: open.max(close) + 2.0,
            low: open.min(close) - 2.0,
            close,
            tick_volume: Some(500),
            ema50: close - 4.0,
            ema200: close - 9.0,
            atr14: 5.0,
        }
    }

    /// A series with a breakout at a known index.
    fn breakout_series() -> BarSeries {
        let mut bars = Vec::new();
        for i in 0..12 {
            bars.push(bar(i, 1998.0, 1999.0));
        }
        // Breakout bar closes above the 2000 neckline.
        bars.push(bar(12, 2000.0, 2004.0));
        // Aftermath drifts sideways, then a forming bar.
        for i in 13..18 {
            bars.push(bar(i, 2003.0, 2003.5));
        }
        BarSeries::new(bars)
    }

    fn detector(signal_index: usize) -> impl Fn(&BarSeries, usize) -> Option<Pattern> {
        move |_series: &BarSeries, idx: usize| {
            (idx == signal_index).then(|| Pattern {
                left_low: PatternPoint {
                    price: 1990.0,
                    bar_index: 2,
                },
                right_low: PatternPoint {
                    price: 1990.5,
                    bar_index: 8,
                },
                neckline: 2000.0,
                quality_score: None,
            })
        }
    }

    fn settings() -> BacktestSettings {
        BacktestSettings {
            initial_equity: 10_000.0,
            warmup_bars: 2,
        }
    }

    #[test]
    fn replay_is_deterministic() {
        let engine = BacktestEngine::new(AppConfig::default());
        let series = breakout_series();
        let cancel = AtomicBool::new(false);
        let source = detector(12);

        let first = engine.run(&series, &source, &settings(), &cancel);
        let second = engine.run(&series, &source, &settings(), &cancel);

        assert_eq!(first.decisions, second.decisions);
        assert_eq!(first.trades.len(), second.trades.len());
        assert_eq!(first.statistics.total_trades, second.statistics.total_trades);
        assert_eq!(first.final_equity, second.final_equity);
    }

    #[test]
    fn breakout_opens_a_position() {
        let engine = BacktestEngine::new(AppConfig::default());
        let series = breakout_series();
        let cancel = AtomicBool::new(false);
        let report = engine.run(&series, &detector(12), &settings(), &cancel);

        let allowed: Vec<_> = report.decisions.iter().filter(|d| d.allowed()).collect();
        assert_eq!(allowed.len(), 1);
        let plan = allowed[0].plan.unwrap();
        assert!((plan.planned_entry - 2004.0).abs() < 1e-9);
        assert!((plan.planned_sl - 1994.0).abs() < 1e-9);
    }

    #[test]
    fn no_pattern_means_no_trades() {
        let engine = BacktestEngine::new(AppConfig::default());
        let series = breakout_series();
        let cancel = AtomicBool::new(false);
        let none = |_: &BarSeries, _: usize| -> Option<Pattern> { None };
        let report = engine.run(&series, &none, &settings(), &cancel);
        assert!(report.decisions.iter().all(|d| !d.allowed()));
        assert_eq!(report.statistics.total_trades, 0);
        assert_eq!(report.final_equity, report.initial_equity);
    }

    #[test]
    fn cancellation_stops_between_bars() {
        let engine = BacktestEngine::new(AppConfig::default());
        let series = breakout_series();
        let cancel = AtomicBool::new(true);
        let report = engine.run(&series, &detector(12), &settings(), &cancel);
        assert!(report.cancelled);
        assert_eq!(report.bars_evaluated, 0);
    }
}
