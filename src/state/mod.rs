//! Position store / state manager
//!
//! The only long-lived mutable aggregate in the system. All operations are
//! serialized under a single mutex; every query hands back an owned
//! snapshot. Mutations persist to both storage paths: the SQLite database
//! (when configured) and the atomic JSON writer. The snapshot is built
//! while the mutex is held and handed to the writer after release.

pub mod database;
pub mod snapshot;
pub mod writer;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::engines::risk::RiskEngine;
use crate::models::{
    Position, RegimeState, SymbolInfo, TpState, TradeRecord, TradeStatistics,
};
pub use database::StateDatabase;
pub use snapshot::{SnapshotError, TradingSnapshot};
pub use writer::AtomicStateWriter;

/// Optional fields for a targeted position update. `None` leaves the field
/// untouched.
#[derive(Debug, Clone, Default)]
pub struct PositionPatch {
    pub tp_state: Option<TpState>,
    pub current_stop_loss: Option<f64>,
    pub tp_state_changed_at: Option<DateTime<Utc>>,
    pub bars_held_after_tp1: Option<u32>,
    pub bars_held_after_tp2: Option<u32>,
    pub max_extension_after_tp1: Option<f64>,
    pub max_extension_after_tp2: Option<f64>,
    pub post_tp1_decision: Option<crate::models::PostTpDecision>,
    pub post_tp2_decision: Option<crate::models::PostTpDecision>,
    pub tp1_exit_reason: Option<String>,
    pub tp2_exit_reason: Option<String>,
    pub trailing_sl_level: Option<f64>,
    pub trailing_sl_enabled: Option<bool>,
}

#[derive(Debug, Default)]
struct StoreInner {
    open_positions: Vec<Position>,
    trade_history: Vec<TradeRecord>,
    last_trade_time: Option<DateTime<Utc>>,
    total_trades: u64,
    winning_trades: u64,
    losing_trades: u64,
    total_profit: f64,
    last_regime_state: Option<RegimeState>,
}

impl StoreInner {
    fn snapshot(&self) -> TradingSnapshot {
        TradingSnapshot {
            open_positions: self.open_positions.clone(),
            trade_history: self.trade_history.clone(),
            last_trade_time: self.last_trade_time,
            total_trades: self.total_trades,
            winning_trades: self.winning_trades,
            losing_trades: self.losing_trades,
            total_profit: self.total_profit,
            last_regime_state: self.last_regime_state.clone(),
            saved_at: None,
        }
    }

    fn apply(&mut self, snapshot: TradingSnapshot) {
        self.open_positions = snapshot.open_positions;
        self.trade_history = snapshot.trade_history;
        self.total_trades = snapshot.total_trades;
        self.winning_trades = snapshot.winning_trades;
        self.losing_trades = snapshot.losing_trades;
        self.total_profit = snapshot.total_profit;
        self.last_regime_state = snapshot.last_regime_state;
        self.last_trade_time = snapshot.last_trade_time.or_else(|| self.derive_last_trade_time());
    }

    /// Recovery: when the cooldown anchor was never persisted, derive it as
    /// the max of every entry and exit time on record.
    fn derive_last_trade_time(&self) -> Option<DateTime<Utc>> {
        let entries = self.open_positions.iter().map(|p| p.entry_time);
        let exits = self.trade_history.iter().map(|t| t.exit_time);
        entries.chain(exits).max()
    }

    fn bump_last_trade_time(&mut self, event_time: DateTime<Utc>) {
        if self.last_trade_time.map_or(true, |t| event_time > t) {
            self.last_trade_time = Some(event_time);
        }
    }
}

pub struct StateManager {
    inner: Mutex<StoreInner>,
    writer: Option<AtomicStateWriter>,
    db: Option<Mutex<StateDatabase>>,
    persistence_failures: AtomicU64,
}

impl StateManager {
    /// Build the store from configuration and load any persisted state.
    /// Load order: database structured tables, database audit snapshot,
    /// JSON file (checksum-validated), backups newest to oldest, fresh.
    pub fn new(config: &AppConfig) -> Result<Self> {
        let writer = AtomicStateWriter::new(
            &config.data.state_file,
            &config.data.backup_dir,
            writer::DEFAULT_BATCH_INTERVAL,
            writer::DEFAULT_MAX_BACKUPS,
        )?;

        let db = match &config.data.db_url {
            Some(url) => match StateDatabase::open(url) {
                Ok(db) => Some(Mutex::new(db)),
                Err(e) => {
                    error!("state database unavailable, file storage only: {e:#}");
                    None
                }
            },
            None => None,
        };

        let manager = Self {
            inner: Mutex::new(StoreInner::default()),
            writer: Some(writer),
            db,
            persistence_failures: AtomicU64::new(0),
        };
        manager.load();
        Ok(manager)
    }

    /// In-memory store for backtests: no writer thread, no database.
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            writer: None,
            db: None,
            persistence_failures: AtomicU64::new(0),
        }
    }

    fn load(&self) {
        let mut loaded: Option<TradingSnapshot> = None;

        if let Some(db) = &self.db {
            match db.lock().load_latest() {
                Ok(Some(snapshot)) => loaded = Some(snapshot),
                Ok(None) => {}
                Err(e) => warn!("db load failed: {e:#}"),
            }
        }

        if loaded.is_none() {
            if let Some(writer) = &self.writer {
                loaded = writer.load_with_validation();
                // Backfill the database from the file so both paths agree.
                if let (Some(snapshot), Some(db)) = (&loaded, &self.db) {
                    if let Err(e) = db.lock().save_state(snapshot) {
                        warn!("db backfill from file failed: {e:#}");
                    } else {
                        info!("database backfilled from JSON snapshot");
                    }
                }
            }
        }

        match loaded {
            Some(snapshot) => {
                let mut inner = self.inner.lock();
                inner.apply(snapshot);
                info!(
                    total_trades = inner.total_trades,
                    total_profit = inner.total_profit,
                    open_positions = inner.open_positions.len(),
                    last_trade_time = ?inner.last_trade_time,
                    "state loaded"
                );
            }
            None => {
                warn!("no valid persisted state found, starting fresh");
            }
        }
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Register a new open position (pyramiding supported) and persist.
    pub fn open_position(&self, position: Position) {
        let snapshot = {
            let mut inner = self.inner.lock();
            inner.bump_last_trade_time(position.entry_time);
            info!(
                ticket = position.ticket,
                entry = position.entry_price,
                tp_state = position.tp_state.as_str(),
                total_open = inner.open_positions.len() + 1,
                "position opened"
            );
            inner.open_positions.push(position);
            inner.snapshot()
        };
        self.persist(snapshot);
    }

    /// Close a position: compute P/L through the risk engine, normalize and
    /// validate the exit reason, append the trade record, update totals and
    /// the cooldown anchor, persist.
    #[allow(clippy::too_many_arguments)]
    pub fn close_position(
        &self,
        ticket: u64,
        exit_price: f64,
        exit_reason: &str,
        exit_time: DateTime<Utc>,
        symbol_info: &SymbolInfo,
        risk_engine: &RiskEngine,
        swap: Option<f64>,
    ) -> Option<TradeRecord> {
        let (record, snapshot) = {
            let mut inner = self.inner.lock();
            let idx = inner
                .open_positions
                .iter()
                .position(|p| p.ticket == ticket)?;
            let position = inner.open_positions.remove(idx);

            let pl = risk_engine.profit_loss(
                position.volume,
                position.entry_price,
                exit_price,
                symbol_info,
            );
            let swap_value = swap.unwrap_or(position.swap);
            let net_pl = pl.net_pl + swap_value;

            let reason = Self::validate_exit_reason(
                &position,
                exit_price,
                &Self::normalize_exit_reason(exit_reason),
            );

            let record = TradeRecord {
                ticket: position.ticket,
                entry_time: position.entry_time,
                exit_time,
                entry_price: position.entry_price,
                exit_price,
                stop_loss: position.initial_stop_loss,
                take_profit: position.take_profit,
                volume: position.volume,
                gross_pl: pl.gross_pl,
                commission: pl.commission,
                swap: swap_value,
                net_pl,
                exit_reason: reason.clone(),
                is_winner: net_pl > 0.0,
                pattern_snapshot: position.pattern_snapshot.clone(),
            };

            inner.trade_history.push(record.clone());
            inner.total_trades += 1;
            inner.total_profit += net_pl;
            if net_pl > 0.0 {
                inner.winning_trades += 1;
            } else {
                inner.losing_trades += 1;
            }
            inner.bump_last_trade_time(exit_time);

            info!(
                ticket,
                profit = net_pl,
                reason = %reason,
                remaining = inner.open_positions.len(),
                "position closed"
            );
            (record, inner.snapshot())
        };
        self.persist(snapshot);
        Some(record)
    }

    /// TP state transition with optional stop raise and bar counters.
    /// Backwards transitions are an invariant violation: logged, refused,
    /// nothing mutated. Stop updates go through the monotone raise.
    pub fn update_position_tp_state(
        &self,
        ticket: u64,
        new_state: TpState,
        new_stop_loss: Option<f64>,
        transition_time: Option<DateTime<Utc>>,
        bars_after_tp1: Option<u32>,
        bars_after_tp2: Option<u32>,
    ) -> bool {
        let result = {
            let mut inner = self.inner.lock();
            let Some(position) = inner
                .open_positions
                .iter_mut()
                .find(|p| p.ticket == ticket)
            else {
                warn!(ticket, "position not found for TP state update");
                return false;
            };

            if new_state.rank() < position.tp_state.rank() {
                error!(
                    ticket,
                    from = position.tp_state.as_str(),
                    to = new_state.as_str(),
                    "invariant violation: TP state moving backwards, refused"
                );
                return false;
            }

            let old_state = position.tp_state;
            position.tp_state = new_state;
            if let Some(at) = transition_time {
                position.tp_state_changed_at = Some(at);
            }
            let mut applied_sl = None;
            if let Some(sl) = new_stop_loss {
                if position.raise_stop(sl) {
                    applied_sl = Some(sl);
                } else if sl < position.current_stop_loss {
                    debug!(
                        ticket,
                        candidate = sl,
                        current = position.current_stop_loss,
                        "stop raise ignored, would lower the stop"
                    );
                }
            }
            if let Some(bars) = bars_after_tp1 {
                position.bars_held_after_tp1 = bars;
            }
            if let Some(bars) = bars_after_tp2 {
                position.bars_held_after_tp2 = bars;
            }

            info!(
                ticket,
                from = old_state.as_str(),
                to = new_state.as_str(),
                new_sl = ?applied_sl,
                "TP state updated"
            );

            (
                PositionPatch {
                    tp_state: Some(new_state),
                    current_stop_loss: Some(position.current_stop_loss),
                    tp_state_changed_at: transition_time,
                    bars_held_after_tp1: bars_after_tp1,
                    bars_held_after_tp2: bars_after_tp2,
                    ..Default::default()
                },
                inner.snapshot(),
            )
        };

        self.persist_patch(ticket, result);
        true
    }

    /// Free-form metadata patch for the post-TP engines' bookkeeping.
    pub fn update_tp_exit_metadata(&self, ticket: u64, patch: PositionPatch) -> bool {
        let result = {
            let mut inner = self.inner.lock();
            let Some(position) = inner
                .open_positions
                .iter_mut()
                .find(|p| p.ticket == ticket)
            else {
                warn!(ticket, "position not found for metadata update");
                return false;
            };

            if let Some(decision) = patch.post_tp1_decision {
                position.post_tp1_decision = decision;
            }
            if let Some(decision) = patch.post_tp2_decision {
                position.post_tp2_decision = decision;
            }
            if let Some(reason) = &patch.tp1_exit_reason {
                position.tp1_exit_reason = Some(reason.clone());
            }
            if let Some(reason) = &patch.tp2_exit_reason {
                position.tp2_exit_reason = Some(reason.clone());
            }
            if let Some(level) = patch.trailing_sl_level {
                position.trailing_sl_level = Some(level);
            }
            if let Some(enabled) = patch.trailing_sl_enabled {
                position.trailing_sl_enabled = enabled;
            }
            if let Some(ext) = patch.max_extension_after_tp1 {
                if ext > position.max_extension_after_tp1 {
                    position.max_extension_after_tp1 = ext;
                }
            }
            if let Some(ext) = patch.max_extension_after_tp2 {
                if ext > position.max_extension_after_tp2 {
                    position.max_extension_after_tp2 = ext;
                }
            }

            debug!(ticket, "TP exit metadata updated");
            (patch, inner.snapshot())
        };

        self.persist_patch(ticket, result);
        true
    }

    /// Refresh broker-reported marks on an open position. No persistence:
    /// these fields change every tick and are rewritten on the next
    /// mutation anyway.
    pub fn update_market_fields(
        &self,
        ticket: u64,
        price_current: f64,
        unrealized_profit: f64,
        swap: f64,
    ) -> bool {
        let mut inner = self.inner.lock();
        let Some(position) = inner
            .open_positions
            .iter_mut()
            .find(|p| p.ticket == ticket)
        else {
            return false;
        };
        position.price_current = Some(price_current);
        position.unrealized_profit = Some(unrealized_profit);
        position.swap = swap;
        true
    }

    /// Cache the latest regime read and persist it with the state.
    pub fn set_regime_state(&self, regime: RegimeState) {
        let snapshot = {
            let mut inner = self.inner.lock();
            inner.last_regime_state = Some(regime);
            inner.snapshot()
        };
        self.persist(snapshot);
    }

    // ------------------------------------------------------------------
    // Queries (owned snapshots)
    // ------------------------------------------------------------------

    pub fn has_open_position(&self) -> bool {
        !self.inner.lock().open_positions.is_empty()
    }

    pub fn open_position_count(&self) -> usize {
        self.inner.lock().open_positions.len()
    }

    pub fn positions(&self) -> Vec<Position> {
        self.inner.lock().open_positions.clone()
    }

    pub fn position(&self, ticket: u64) -> Option<Position> {
        self.inner
            .lock()
            .open_positions
            .iter()
            .find(|p| p.ticket == ticket)
            .cloned()
    }

    pub fn can_open_new_position(&self, max_positions: usize) -> bool {
        self.inner.lock().open_positions.len() < max_positions
    }

    pub fn last_trade_time(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().last_trade_time
    }

    pub fn is_in_cooldown(&self, now: DateTime<Utc>, cooldown_hours: f64) -> bool {
        let Some(last) = self.inner.lock().last_trade_time else {
            return false;
        };
        let elapsed_hours = (now - last).num_seconds() as f64 / 3600.0;
        elapsed_hours < cooldown_hours
    }

    pub fn last_regime_state(&self) -> Option<RegimeState> {
        self.inner.lock().last_regime_state.clone()
    }

    pub fn recent_trades(&self, count: usize) -> Vec<TradeRecord> {
        let inner = self.inner.lock();
        let skip = inner.trade_history.len().saturating_sub(count);
        inner.trade_history[skip..].to_vec()
    }

    pub fn statistics(&self) -> TradeStatistics {
        let inner = self.inner.lock();
        let winners: Vec<f64> = inner
            .trade_history
            .iter()
            .filter(|t| t.net_pl > 0.0)
            .map(|t| t.net_pl)
            .collect();
        let losers: Vec<f64> = inner
            .trade_history
            .iter()
            .filter(|t| t.net_pl <= 0.0)
            .map(|t| t.net_pl)
            .collect();

        let win_rate = if inner.total_trades > 0 {
            inner.winning_trades as f64 / inner.total_trades as f64 * 100.0
        } else {
            0.0
        };
        let average_win = if winners.is_empty() {
            0.0
        } else {
            winners.iter().sum::<f64>() / winners.len() as f64
        };
        let average_loss = if losers.is_empty() {
            0.0
        } else {
            losers.iter().sum::<f64>() / losers.len() as f64
        };
        let loss_sum: f64 = losers.iter().sum();
        let profit_factor = if loss_sum != 0.0 {
            (winners.iter().sum::<f64>() / loss_sum).abs()
        } else {
            0.0
        };

        TradeStatistics {
            total_trades: inner.total_trades,
            winning_trades: inner.winning_trades,
            losing_trades: inner.losing_trades,
            win_rate,
            total_profit: inner.total_profit,
            average_win,
            average_loss,
            profit_factor,
            last_trade_time: inner.last_trade_time,
        }
    }

    pub fn snapshot(&self) -> TradingSnapshot {
        self.inner.lock().snapshot()
    }

    pub fn persistence_failures(&self) -> u64 {
        self.persistence_failures.load(Ordering::Relaxed)
            + self.writer.as_ref().map_or(0, |w| w.failed_writes())
    }

    // ------------------------------------------------------------------
    // Persistence plumbing
    // ------------------------------------------------------------------

    fn persist(&self, snapshot: TradingSnapshot) {
        if let Some(db) = &self.db {
            if let Err(e) = db.lock().save_state(&snapshot) {
                self.persistence_failures.fetch_add(1, Ordering::Relaxed);
                error!("db state save failed: {e:#}");
            }
        }
        if let Some(writer) = &self.writer {
            writer.queue_write(snapshot);
        }
    }

    fn persist_patch(&self, ticket: u64, (patch, snapshot): (PositionPatch, TradingSnapshot)) {
        if let Some(db) = &self.db {
            if let Err(e) = db.lock().update_position(ticket, &patch) {
                self.persistence_failures.fetch_add(1, Ordering::Relaxed);
                error!(ticket, "db position update failed: {e:#}");
            }
        }
        if let Some(writer) = &self.writer {
            writer.queue_write(snapshot);
        }
    }

    /// Numeric exit reasons from the broker become readable text; the UI
    /// and exports rely on this never being a bare number.
    fn normalize_exit_reason(exit_reason: &str) -> String {
        let trimmed = exit_reason.trim();
        if trimmed.is_empty() {
            return "Unknown".to_string();
        }
        if let Ok(price) = trimmed.parse::<f64>() {
            return format!("Exit price {price:.2}");
        }
        trimmed.to_string()
    }

    /// Check the label against the actual exit price. A take-profit label
    /// on a price that never reached the level is replaced: "Stop Loss"
    /// when the stop was hit, "Unknown Closure" otherwise, with a warning.
    /// Only labels claiming a TP fill are checked; descriptive reasons
    /// that merely mention a level pass through.
    fn validate_exit_reason(position: &Position, exit_price: f64, reason: &str) -> String {
        const EPS: f64 = 1e-6;
        let label = reason.trim();
        let claims_tp = matches!(
            label,
            "TP1" | "TP2" | "TP3" | "TP1 Exit" | "TP2 Exit" | "TP3 Exit" | "Take Profit"
        );
        if claims_tp {
            let tp_hit = match label {
                "TP1" | "TP1 Exit" => exit_price + EPS >= position.tp1_price,
                "TP2" | "TP2 Exit" => exit_price + EPS >= position.tp2_price,
                _ => exit_price + EPS >= position.tp3_price,
            };
            if !tp_hit {
                let substitute = if exit_price <= position.current_stop_loss + EPS {
                    "Stop Loss"
                } else {
                    "Unknown Closure"
                };
                warn!(
                    ticket = position.ticket,
                    exit_price,
                    label = reason,
                    substitute,
                    "exit reason does not match exit price, corrected"
                );
                return substitute.to_string();
            }
        }
        reason.to_string()
    }

    /// Force the pending snapshot to disk. A successful flush implies the
    /// snapshot is durable.
    pub fn flush(&self) -> Result<()> {
        if let Some(writer) = &self.writer {
            writer.flush()?;
        }
        Ok(())
    }

    /// Flush, stop the writer thread, close the database.
    pub fn shutdown(&self) {
        info!("shutting down state manager");
        if let Some(writer) = &self.writer {
            writer.stop();
        }
        // The database closes on drop; WAL checkpointing happens there.
        info!("state manager shutdown complete");
    }

    /// Synchronous write of the current state, bypassing the batch window.
    /// Used by tests and by shutdown paths that must not race the writer.
    pub fn persist_now(&self) -> Result<()> {
        let snapshot = self.inner.lock().snapshot();
        if let Some(db) = &self.db {
            db.lock().save_state(&snapshot)?;
        }
        if let Some(writer) = &self.writer {
            writer.queue_write(snapshot);
            writer.flush()?;
        }
        Ok(())
    }
}

/// Writer batch interval re-export for callers configuring their own.
pub fn default_batch_interval() -> Duration {
    writer::DEFAULT_BATCH_INTERVAL
}
