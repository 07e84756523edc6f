//! Trading controller
//!
//! Owns the live loop: poll bars, validate the last closed bar, manage
//! open positions through the TP engines, and evaluate entries through the
//! decision engine. Data-quality failures back off without trading;
//! heartbeat failures halt new entries and trigger a reconnect, and
//! trading resumes only on an explicit transition. The same per-bar logic
//! drives the simulated broker in tests.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerBridge, BrokerError, MarketOrder};
use crate::config::AppConfig;
use crate::engines::decision::{
    DecisionEngine, DecisionInput, DecisionSource, GuardFlags,
};
use crate::engines::post_tp1::{PostTp1Context, PostTp1Engine};
use crate::engines::post_tp2::{PostTp2Context, PostTp2Engine};
use crate::engines::tp_engine::{MultiLevelTpEngine, TpLevels};
use crate::engines::{BarCloseGuard, MarketReader, MarketRegimeEngine, RiskEngine};
use crate::events::{ControllerEvent, EventBus};
use crate::models::{
    AccountState, BarSeries, Direction, Pattern, Position, PostTpDecision, Regime, SymbolInfo,
    TpState,
};
use crate::state::{PositionPatch, StateManager};

/// Pattern view port. Detection internals live outside the core; the
/// controller only consumes the finished view for the last closed bar.
pub trait PatternSource: Send + Sync {
    fn detect(&self, series: &BarSeries, bar_index: usize) -> Option<Pattern>;
}

impl<F> PatternSource for F
where
    F: Fn(&BarSeries, usize) -> Option<Pattern> + Send + Sync,
{
    fn detect(&self, series: &BarSeries, bar_index: usize) -> Option<Pattern> {
        self(series, bar_index)
    }
}

/// Consecutive heartbeat failures before trading halts.
const HEARTBEAT_FAILURE_LIMIT: u32 = 3;
/// Data-quality backoff ladder, seconds, capped at the last entry.
const QC_BACKOFF_SECONDS: &[u64] = &[2, 4, 8, 16, 32, 60];
/// Connect retry backoff cap.
const CONNECT_BACKOFF_CAP: Duration = Duration::from_secs(60);
/// Attempts for retryable order submissions.
const ORDER_RETRY_LIMIT: u32 = 3;
/// Points trailed behind price on the TP2 transition.
const DEFAULT_TRAILING_OFFSET: f64 = 0.5;

pub struct TradingController<B: BrokerBridge> {
    config: AppConfig,
    broker: Arc<B>,
    store: Arc<StateManager>,
    patterns: Arc<dyn PatternSource>,
    decision_engine: DecisionEngine,
    tp_engine: MultiLevelTpEngine,
    risk: RiskEngine,
    guard: Mutex<BarCloseGuard>,
    regime: Mutex<MarketRegimeEngine>,
    pub events: EventBus,
    entries_halted: AtomicBool,
    qc_failures: AtomicU32,
    heartbeat_failures: AtomicU32,
    shutdown: AtomicBool,
    last_processed_bar: Mutex<Option<DateTime<Utc>>>,
}

impl<B: BrokerBridge> TradingController<B> {
    pub fn new(
        config: AppConfig,
        broker: Arc<B>,
        store: Arc<StateManager>,
        patterns: Arc<dyn PatternSource>,
    ) -> Self {
        let decision_engine = DecisionEngine::from_config(&config);
        let tp_engine = MultiLevelTpEngine::new(config.strategy.risk_reward_ratio_long);
        let risk = RiskEngine::new(config.risk.risk_percent, config.risk.commission_per_lot);
        Self {
            config,
            broker,
            store,
            patterns,
            decision_engine,
            tp_engine,
            risk,
            guard: Mutex::new(BarCloseGuard::disabled_filters()),
            regime: Mutex::new(MarketRegimeEngine::new()),
            events: EventBus::default(),
            entries_halted: AtomicBool::new(false),
            qc_failures: AtomicU32::new(0),
            heartbeat_failures: AtomicU32::new(0),
            shutdown: AtomicBool::new(false),
            last_processed_bar: Mutex::new(None),
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_halted(&self) -> bool {
        self.entries_halted.load(Ordering::SeqCst)
    }

    /// Explicit operator transition back into trading after a reconnect.
    pub fn resume_trading(&self) {
        if self.entries_halted.swap(false, Ordering::SeqCst) {
            info!("trading resumed by explicit transition");
            self.events.post(ControllerEvent::TradingResumed);
        }
    }

    fn halt_entries(&self, reason: &str) {
        if !self.entries_halted.swap(true, Ordering::SeqCst) {
            warn!(%reason, "new entries halted, positions still monitored");
            self.events.post(ControllerEvent::TradingHalted {
                reason: reason.to_string(),
            });
        }
    }

    /// The live loop. Returns when shutdown is requested.
    pub async fn run(&self, poll: Duration) -> Result<()> {
        self.connect_with_backoff().await;
        info!(poll_s = poll.as_secs(), "trading controller running");

        while !self.shutdown.load(Ordering::SeqCst) {
            if !self.heartbeat_cycle().await {
                // Reconnect path already applied its own backoff.
                continue;
            }
            if let Err(e) = self.tick().await {
                warn!("tick failed: {e:#}");
            }
            tokio::time::sleep(poll).await;
        }

        info!("controller shutting down: flushing state, disconnecting broker");
        if let Err(e) = self.store.flush() {
            error!("state flush on shutdown failed: {e:#}");
        }
        self.store.shutdown();
        let _ = self.broker.disconnect().await;
        Ok(())
    }

    async fn connect_with_backoff(&self) {
        let mut delay = Duration::from_secs(2);
        while !self.shutdown.load(Ordering::SeqCst) {
            match self.broker.connect().await {
                Ok(()) => {
                    info!("broker connected");
                    return;
                }
                Err(e) => {
                    warn!(delay_s = delay.as_secs(), "broker connect failed: {e}");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(CONNECT_BACKOFF_CAP);
                }
            }
        }
    }

    /// Returns true when the connection is healthy enough to tick.
    async fn heartbeat_cycle(&self) -> bool {
        match self.broker.heartbeat().await {
            Ok(()) => {
                self.heartbeat_failures.store(0, Ordering::SeqCst);
                true
            }
            Err(e) => {
                let failures = self.heartbeat_failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(failures, "heartbeat failed: {e}");
                if failures >= HEARTBEAT_FAILURE_LIMIT {
                    self.halt_entries("consecutive heartbeat failures");
                    self.events.post(ControllerEvent::HealthAlert {
                        message: format!("connection lost after {failures} heartbeat failures"),
                    });
                    let _ = self.broker.disconnect().await;
                    self.connect_with_backoff().await;
                    self.heartbeat_failures.store(0, Ordering::SeqCst);
                    // Re-sync history after the reconnect; entries stay
                    // halted until resume_trading().
                    if let Ok(series) = self.broker.get_bars(self.config.data.bars_to_fetch).await
                    {
                        *self.last_processed_bar.lock() =
                            series.last_closed().map(|bar| bar.time);
                        info!("bar history re-synced after reconnect");
                    }
                } else {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
                false
            }
        }
    }

    async fn tick(&self) -> Result<()> {
        let series = match self.broker.get_bars(self.config.data.bars_to_fetch).await {
            Ok(series) => series,
            Err(e) if e.is_connection_lost() => {
                self.halt_entries("bar fetch: connection lost");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let Some(last_closed) = series.last_closed() else {
            return Ok(());
        };

        // One evaluation per closed bar.
        {
            let mut processed = self.last_processed_bar.lock();
            if *processed == Some(last_closed.time) {
                return Ok(());
            }
            *processed = Some(last_closed.time);
        }

        self.process_bar_close(&series).await
    }

    /// Evaluate one freshly closed bar: guard, regime, exits, then entry.
    pub async fn process_bar_close(&self, series: &BarSeries) -> Result<()> {
        let Some(idx) = series.last_closed_index() else {
            return Ok(());
        };

        if let Err(reason) = self.guard.lock().validate_bar_state(series, idx) {
            let failures = self.qc_failures.fetch_add(1, Ordering::SeqCst) as usize;
            let delay = QC_BACKOFF_SECONDS[failures.min(QC_BACKOFF_SECONDS.len() - 1)];
            warn!(%reason, delay_s = delay, "bar failed quality checks, backing off");
            self.events.post(ControllerEvent::HealthAlert {
                message: format!("data quality failure: {reason}"),
            });
            tokio::time::sleep(Duration::from_secs(delay)).await;
            return Ok(());
        }
        self.qc_failures.store(0, Ordering::SeqCst);

        let bar = series.get(idx).expect("validated index");
        let regime_state = self
            .regime
            .lock()
            .evaluate(bar.close, bar.ema50, bar.ema200);
        self.store.set_regime_state(regime_state);

        self.manage_open_positions(series, idx).await?;

        if !self.entries_halted.load(Ordering::SeqCst) {
            self.try_enter(series, idx).await?;
        }

        Ok(())
    }

    async fn manage_open_positions(&self, series: &BarSeries, idx: usize) -> Result<()> {
        if !self.store.has_open_position() {
            return Ok(());
        }
        let bar = series.get(idx).expect("validated index");
        let symbol_info = self.broker.get_symbol_info().await?;

        // Refresh broker-reported marks and reconcile external closes.
        let broker_positions = self.broker.get_open_positions().await?;
        for p in &broker_positions {
            self.store
                .update_market_fields(p.ticket, p.price_current, p.profit, p.swap);
        }
        for position in self.store.positions() {
            let still_open = broker_positions.iter().any(|p| p.ticket == position.ticket);
            if !still_open {
                let exit_price = position.price_current.unwrap_or(bar.close);
                warn!(
                    ticket = position.ticket,
                    exit_price, "position closed broker-side, reconciling"
                );
                self.record_close(&position, exit_price, "Broker Closure", &symbol_info)
                    .await;
            }
        }

        let regime = self.regime.lock().state().clone();
        let momentum = MarketReader::momentum(series, idx);
        let structure = MarketReader::structure(series, idx);
        let swing_low = MarketReader::latest_swing_low(series, idx);
        let previous_close = idx.checked_sub(1).and_then(|i| series.get(i)).map(|b| b.close);

        for position in self.store.positions() {
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
                self.close_ticket(&position, bar.close, &check.reason, &symbol_info)
                    .await;
                continue;
            }

            if check.next_state != position.tp_state {
                let new_sl = self.tp_engine.calculate_new_stop_loss(
                    bar.close,
                    position.entry_price,
                    check.next_state,
                    position.direction,
                    DEFAULT_TRAILING_OFFSET,
                );
                self.store.update_position_tp_state(
                    position.ticket,
                    check.next_state,
                    new_sl,
                    Some(bar.time),
                    None,
                    None,
                );
                self.events.post(ControllerEvent::TpStateChanged {
                    ticket: position.ticket,
                    state: check.next_state,
                });
                if let Some(new_sl) = new_sl {
                    self.events.post(ControllerEvent::StopRaised {
                        ticket: position.ticket,
                        new_stop: new_sl,
                    });
                }
                continue;
            }

            match position.tp_state {
                TpState::Tp1Reached => {
                    let bars_since = position.bars_held_after_tp1 + 1;
                    self.store.update_position_tp_state(
                        position.ticket,
                        TpState::Tp1Reached,
                        None,
                        None,
                        Some(bars_since),
                        None,
                    );
                    self.store.update_tp_exit_metadata(
                        position.ticket,
                        PositionPatch {
                            max_extension_after_tp1: Some(bar.high),
                            ..Default::default()
                        },
                    );

                    let verdict = PostTp1Engine::evaluate(&PostTp1Context {
                        current_price: bar.close,
                        entry_price: position.entry_price,
                        tp1_price: position.tp1_price,
                        atr14: bar.atr14,
                        regime: known_regime(&regime),
                        momentum,
                        last_closed_bar_close: bar.close,
                        bars_since_tp1: bars_since,
                        previous_bar_close: previous_close,
                    });
                    debug!(
                        ticket = position.ticket,
                        decision = verdict.decision.as_str(),
                        reason = %verdict.reason,
                        "post-TP1 decision"
                    );
                    self.store.update_tp_exit_metadata(
                        position.ticket,
                        PositionPatch {
                            post_tp1_decision: Some(verdict.decision),
                            tp1_exit_reason: Some(verdict.reason.clone()),
                            ..Default::default()
                        },
                    );
                    match verdict.decision {
                        PostTpDecision::ExitTrade => {
                            self.close_ticket(&position, bar.close, &verdict.reason, &symbol_info)
                                .await;
                        }
                        PostTpDecision::Hold => {
                            if let Some(suggested) = verdict.suggested_stop {
                                self.raise_stop(&position, suggested);
                            }
                        }
                        _ => {}
                    }
                }
                TpState::Tp2Reached => {
                    let bars_since = position.bars_held_after_tp2 + 1;
                    self.store.update_position_tp_state(
                        position.ticket,
                        TpState::Tp2Reached,
                        None,
                        None,
                        None,
                        Some(bars_since),
                    );
                    self.store.update_tp_exit_metadata(
                        position.ticket,
                        PositionPatch {
                            max_extension_after_tp2: Some(bar.high),
                            ..Default::default()
                        },
                    );

                    let verdict = PostTp2Engine::evaluate(&PostTp2Context {
                        current_price: bar.close,
                        entry_price: position.entry_price,
                        tp1_price: position.tp1_price,
                        tp2_price: position.tp2_price,
                        atr14: bar.atr14,
                        regime: known_regime(&regime),
                        momentum,
                        structure,
                        last_closed_bar_close: bar.close,
                        bars_since_tp2: bars_since,
                        previous_bar_close: previous_close,
                        swing_low,
                    });
                    debug!(
                        ticket = position.ticket,
                        decision = verdict.decision.as_str(),
                        reason = %verdict.reason,
                        "post-TP2 decision"
                    );
                    self.store.update_tp_exit_metadata(
                        position.ticket,
                        PositionPatch {
                            post_tp2_decision: Some(verdict.decision),
                            tp2_exit_reason: Some(verdict.reason.clone()),
                            trailing_sl_level: verdict.trailing_stop,
                            trailing_sl_enabled: Some(verdict.trailing_stop.is_some()),
                            ..Default::default()
                        },
                    );
                    match verdict.decision {
                        PostTpDecision::ExitTrade => {
                            self.close_ticket(&position, bar.close, &verdict.reason, &symbol_info)
                                .await;
                        }
                        _ => {
                            if let Some(trail) = verdict.trailing_stop {
                                self.raise_stop(&position, trail);
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn raise_stop(&self, position: &Position, candidate: f64) {
        if candidate > position.current_stop_loss {
            self.store.update_position_tp_state(
                position.ticket,
                position.tp_state,
                Some(candidate),
                None,
                None,
                None,
            );
            self.events.post(ControllerEvent::StopRaised {
                ticket: position.ticket,
                new_stop: candidate,
            });
        }
    }

    async fn close_ticket(
        &self,
        position: &Position,
        price: f64,
        reason: &str,
        symbol_info: &SymbolInfo,
    ) {
        match self.broker.close_position(position.ticket, Some(price)).await {
            Ok(()) => {
                self.record_close(position, price, reason, symbol_info).await;
            }
            Err(e) => {
                error!(ticket = position.ticket, "broker close failed: {e}");
                self.events.post(ControllerEvent::HealthAlert {
                    message: format!("close of ticket {} failed: {e}", position.ticket),
                });
            }
        }
    }

    async fn record_close(
        &self,
        position: &Position,
        price: f64,
        reason: &str,
        symbol_info: &SymbolInfo,
    ) {
        if let Some(record) = self.store.close_position(
            position.ticket,
            price,
            reason,
            Utc::now(),
            symbol_info,
            &self.risk,
            None,
        ) {
            self.events.post(ControllerEvent::PositionClosed {
                ticket: record.ticket,
                exit_price: record.exit_price,
                reason: record.exit_reason.clone(),
                net_pl: record.net_pl,
            });
        }
    }

    async fn try_enter(&self, series: &BarSeries, idx: usize) -> Result<()> {
        let bar = series.get(idx).expect("validated index");
        let pattern = self.patterns.detect(series, idx);

        let symbol_info = self.broker.get_symbol_info().await?;
        let account = self.broker.get_account_info().await?;

        // Optional guard filters; anti-FOMO never blocks, the noise filter
        // blocks only when enabled.
        let movement_pips = idx
            .checked_sub(1)
            .and_then(|i| series.get(i))
            .map(|prev| (bar.close - prev.close) / symbol_info.point);
        let guard_flags = {
            let mut guard = self.guard.lock();
            let (fomo_ok, _) = guard.check_anti_fomo(idx as i64);
            let noise_ok = match movement_pips {
                Some(pips) => guard.filter_tick_noise(pips).0,
                None => true,
            };
            GuardFlags {
                tick_noise_filter_passed: noise_ok,
                anti_fomo_passed: fomo_ok,
            }
        };
        if !guard_flags.tick_noise_filter_passed {
            debug!("entry suppressed by tick noise filter");
            return Ok(());
        }

        let input = DecisionInput {
            bar_index: idx,
            series,
            pattern: pattern.as_ref(),
            account: AccountState {
                equity: account.equity,
                open_positions_count: self.store.open_position_count(),
                last_trade_bar: self.last_trade_bar(bar.time, idx),
            },
            direction: Direction::Long,
            symbol_info: Some(&symbol_info),
            source: DecisionSource::Live,
            guard_flags,
        };
        let output = self.decision_engine.evaluate(&input);
        self.events
            .post(ControllerEvent::Decision(Box::new(output.clone())));

        let Some(plan) = output.plan else {
            debug!(
                stage = output.stage.as_str(),
                fail_code = ?output.fail_code,
                "no trade"
            );
            return Ok(());
        };

        let order = MarketOrder {
            volume: plan.position_size,
            stop_loss: plan.planned_sl,
            take_profit: plan.planned_tp3,
            comment: format!("double-bottom breakout {}", self.config.mt5.magic_number),
        };
        let fill = match self.submit_with_retry(&order).await {
            Ok(fill) => fill,
            Err(e) => {
                error!("order submission failed: {e}");
                self.events.post(ControllerEvent::HealthAlert {
                    message: format!("order submission failed: {e}"),
                });
                return Ok(());
            }
        };

        self.guard.lock().record_signal(idx as i64);

        let position = Position {
            ticket: fill.ticket,
            direction: Direction::Long,
            entry_time: bar.time,
            entry_price: fill.fill_price,
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
            price_current: Some(fill.fill_price),
            unrealized_profit: Some(0.0),
            swap: 0.0,
        };
        info!(
            ticket = fill.ticket,
            entry = fill.fill_price,
            sl = plan.planned_sl,
            tp1 = plan.planned_tp1,
            tp2 = plan.planned_tp2,
            tp3 = plan.planned_tp3,
            volume = plan.position_size,
            "position opened"
        );
        self.store.open_position(position);
        self.events.post(ControllerEvent::PositionOpened {
            ticket: fill.ticket,
            entry_price: fill.fill_price,
            volume: plan.position_size,
        });
        Ok(())
    }

    async fn submit_with_retry(
        &self,
        order: &MarketOrder,
    ) -> Result<crate::broker::OrderFill, BrokerError> {
        let mut delay = Duration::from_secs(1);
        let mut attempt = 0;
        loop {
            match self.broker.submit_market_order(order).await {
                Ok(fill) => return Ok(fill),
                Err(e) if e.is_retryable() && attempt + 1 < ORDER_RETRY_LIMIT => {
                    attempt += 1;
                    warn!(attempt, "retryable order failure: {e}, backing off");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Express the cooldown anchor as a bar index relative to the current
    /// bar, the shape the decision engine's execution guards consume.
    fn last_trade_bar(&self, bar_time: DateTime<Utc>, idx: usize) -> i64 {
        match self.store.last_trade_time() {
            Some(last) => {
                let minutes = (bar_time - last).num_minutes().max(0);
                let bars = minutes / self.config.timeframe().minutes();
                idx as i64 - bars
            }
            None => idx as i64 - 9999,
        }
    }
}

/// The regime engine degrades invalid inputs to a zero-confidence RANGE
/// with zeroed distances; the post-TP engines treat that as no regime read
/// at all.
fn known_regime(state: &crate::models::RegimeState) -> Option<Regime> {
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
