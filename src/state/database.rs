//! SQLite-backed state storage
//!
//! Schema-versioned through a migrations table. Saves are one immediate
//! transaction: delete-and-reinsert the positions and trades tables, upsert
//! the singleton trading-state row, and append the full JSON document to
//! `state_snapshots` for audit. Later schema versions may rebuild tables
//! but must preserve `state_snapshots` contents.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info, warn};

use super::snapshot::TradingSnapshot;
use super::PositionPatch;
use crate::models::{
    Direction, Pattern, Position, PostTpDecision, RegimeState, TpState, TradeRecord,
};

struct Migration {
    version: i64,
    statements: &'static [&'static str],
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        statements: &[
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS state_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL,
                data TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS positions (
                ticket INTEGER PRIMARY KEY,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ticket INTEGER,
                data TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        ],
    },
    Migration {
        version: 2,
        statements: &[
            "DROP TABLE IF EXISTS positions",
            "CREATE TABLE positions (
                ticket INTEGER PRIMARY KEY,
                direction INTEGER NOT NULL,
                entry_time TEXT NOT NULL,
                entry_price REAL NOT NULL,
                volume REAL NOT NULL,
                initial_stop_loss REAL NOT NULL,
                current_stop_loss REAL NOT NULL,
                take_profit REAL NOT NULL,
                tp1_price REAL NOT NULL,
                tp2_price REAL NOT NULL,
                tp3_price REAL NOT NULL,
                tp_state TEXT NOT NULL DEFAULT 'IN_TRADE',
                tp_state_changed_at TEXT,
                bars_held_after_tp1 INTEGER NOT NULL DEFAULT 0,
                bars_held_after_tp2 INTEGER NOT NULL DEFAULT 0,
                max_extension_after_tp1 REAL NOT NULL DEFAULT 0.0,
                max_extension_after_tp2 REAL NOT NULL DEFAULT 0.0,
                post_tp1_decision TEXT NOT NULL DEFAULT 'NOT_REACHED',
                post_tp2_decision TEXT NOT NULL DEFAULT 'NOT_REACHED',
                tp1_exit_reason TEXT,
                tp2_exit_reason TEXT,
                trailing_sl_level REAL,
                trailing_sl_enabled INTEGER NOT NULL DEFAULT 0,
                atr_at_entry REAL NOT NULL DEFAULT 0.0,
                pattern_snapshot TEXT,
                price_current REAL,
                unrealized_profit REAL,
                swap REAL NOT NULL DEFAULT 0.0,
                updated_at TEXT NOT NULL
            )",
            "DROP TABLE IF EXISTS trades",
            "CREATE TABLE trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ticket INTEGER NOT NULL,
                entry_time TEXT NOT NULL,
                exit_time TEXT NOT NULL,
                entry_price REAL NOT NULL,
                exit_price REAL NOT NULL,
                stop_loss REAL NOT NULL,
                take_profit REAL NOT NULL,
                volume REAL NOT NULL,
                gross_pl REAL NOT NULL,
                commission REAL NOT NULL DEFAULT 0.0,
                swap REAL NOT NULL DEFAULT 0.0,
                net_pl REAL NOT NULL,
                exit_reason TEXT NOT NULL,
                is_winner INTEGER NOT NULL,
                pattern_snapshot TEXT,
                created_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS trading_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                last_trade_time TEXT,
                total_trades INTEGER NOT NULL DEFAULT 0,
                winning_trades INTEGER NOT NULL DEFAULT 0,
                losing_trades INTEGER NOT NULL DEFAULT 0,
                total_profit REAL NOT NULL DEFAULT 0.0,
                last_regime_state TEXT,
                saved_at TEXT NOT NULL
            )",
        ],
    },
];

pub struct StateDatabase {
    conn: Connection,
}

impl StateDatabase {
    /// Open (and migrate) the database behind a `sqlite://` URL or a plain
    /// file path.
    pub fn open(db_url: &str) -> Result<Self> {
        let path = Self::parse_sqlite_url(db_url)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating db dir {}", parent.display()))?;
        }
        let conn = Connection::open(&path)
            .with_context(|| format!("opening state db {}", path.display()))?;
        // Crash safety and concurrency; NORMAL is the documented tradeoff
        // for WAL.
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        let mut db = Self { conn };
        db.apply_migrations()?;
        info!(path = %path.display(), "state database ready");
        Ok(db)
    }

    fn parse_sqlite_url(db_url: &str) -> Result<PathBuf> {
        if db_url.is_empty() {
            anyhow::bail!("db_url is required for database storage");
        }
        if let Some(path) = db_url.strip_prefix("sqlite:///") {
            return Ok(PathBuf::from(path));
        }
        if let Some(path) = db_url.strip_prefix("sqlite://") {
            return Ok(PathBuf::from(path));
        }
        if db_url.contains("://") {
            anyhow::bail!("unsupported database URL: {db_url}");
        }
        Ok(PathBuf::from(db_url))
    }

    fn apply_migrations(&mut self) -> Result<()> {
        for migration in MIGRATIONS {
            if self.is_migration_applied(migration.version)? {
                continue;
            }
            let tx = self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)?;
            for statement in migration.statements {
                tx.execute(statement, [])?;
            }
            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                params![migration.version, Utc::now().to_rfc3339()],
            )?;
            tx.commit()?;
            info!(version = migration.version, "applied db migration");
        }
        Ok(())
    }

    fn is_migration_applied(&self, version: i64) -> Result<bool> {
        let result = self.conn.query_row(
            "SELECT 1 FROM schema_migrations WHERE version = ?1",
            params![version],
            |_| Ok(()),
        );
        match result {
            Ok(()) => Ok(true),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(false),
            // schema_migrations does not exist yet on a fresh database.
            Err(rusqlite::Error::SqliteFailure(_, _)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn has_data(&self) -> Result<bool> {
        for table in ["state_snapshots", "positions", "trades"] {
            let found: Option<i64> = self
                .conn
                .query_row(&format!("SELECT 1 FROM {table} LIMIT 1"), [], |row| {
                    row.get(0)
                })
                .optional()?;
            if found.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Persist the full snapshot in one immediate transaction with
    /// rollback on any failure.
    pub fn save_state(&mut self, snapshot: &TradingSnapshot) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute("DELETE FROM positions", [])?;
        for position in &snapshot.open_positions {
            Self::insert_position(&tx, position, &now)?;
        }

        tx.execute("DELETE FROM trades", [])?;
        for trade in &snapshot.trade_history {
            Self::insert_trade(&tx, trade, &now)?;
        }

        tx.execute("DELETE FROM trading_state", [])?;
        tx.execute(
            "INSERT INTO trading_state (
                id, last_trade_time, total_trades, winning_trades,
                losing_trades, total_profit, last_regime_state, saved_at
            ) VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                snapshot.last_trade_time.map(|t| t.to_rfc3339()),
                snapshot.total_trades as i64,
                snapshot.winning_trades as i64,
                snapshot.losing_trades as i64,
                snapshot.total_profit,
                snapshot
                    .last_regime_state
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                now,
            ],
        )?;

        tx.execute(
            "INSERT INTO state_snapshots (created_at, data) VALUES (?1, ?2)",
            params![now, serde_json::to_string(snapshot)?],
        )?;

        tx.commit().context("committing state save")?;
        debug!(
            positions = snapshot.open_positions.len(),
            trades = snapshot.trade_history.len(),
            "state saved to database"
        );
        Ok(())
    }

    /// Load order: structured tables first, then the newest audit snapshot.
    pub fn load_latest(&self) -> Result<Option<TradingSnapshot>> {
        if let Some(snapshot) = self.load_from_tables()? {
            return Ok(Some(snapshot));
        }
        let row: Option<String> = self
            .conn
            .query_row(
                "SELECT data FROM state_snapshots ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match row {
            Some(data) => {
                warn!("structured tables empty, falling back to latest audit snapshot");
                Ok(Some(serde_json::from_str(&data)?))
            }
            None => Ok(None),
        }
    }

    fn load_from_tables(&self) -> Result<Option<TradingSnapshot>> {
        let state_row = self
            .conn
            .query_row(
                "SELECT last_trade_time, total_trades, winning_trades, losing_trades,
                        total_profit, last_regime_state, saved_at
                 FROM trading_state WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, f64>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((last_trade_time, total, winners, losers, profit, regime_json, saved_at)) =
            state_row
        else {
            return Ok(None);
        };

        let mut positions = Vec::new();
        let mut stmt = self.conn.prepare_cached(
            "SELECT ticket, direction, entry_time, entry_price, volume, initial_stop_loss,
                    current_stop_loss, take_profit, tp1_price, tp2_price, tp3_price, tp_state,
                    tp_state_changed_at, bars_held_after_tp1, bars_held_after_tp2,
                    max_extension_after_tp1, max_extension_after_tp2, post_tp1_decision,
                    post_tp2_decision, tp1_exit_reason, tp2_exit_reason, trailing_sl_level,
                    trailing_sl_enabled, atr_at_entry, pattern_snapshot, price_current,
                    unrealized_profit, swap
             FROM positions ORDER BY ticket",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            positions.push(Self::position_from_row(row)?);
        }

        let mut trades = Vec::new();
        let mut stmt = self.conn.prepare_cached(
            "SELECT ticket, entry_time, exit_time, entry_price, exit_price, stop_loss,
                    take_profit, volume, gross_pl, commission, swap, net_pl, exit_reason,
                    is_winner, pattern_snapshot
             FROM trades ORDER BY id",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            trades.push(Self::trade_from_row(row)?);
        }

        let last_regime_state: Option<RegimeState> = regime_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(Some(TradingSnapshot {
            open_positions: positions,
            trade_history: trades,
            last_trade_time: parse_time_opt(last_trade_time.as_deref())?,
            total_trades: total.max(0) as u64,
            winning_trades: winners.max(0) as u64,
            losing_trades: losers.max(0) as u64,
            total_profit: profit,
            last_regime_state,
            saved_at: parse_time_opt(Some(&saved_at))?,
        }))
    }

    /// Targeted update of one position's mutable fields, used for TP state
    /// transitions so a single mutation does not rewrite every table.
    pub fn update_position(&mut self, ticket: u64, patch: &PositionPatch) -> Result<bool> {
        let mut fields: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        let push = |fields: &mut Vec<String>,
                        values: &mut Vec<Box<dyn rusqlite::ToSql>>,
                        column: &str,
                        value: Box<dyn rusqlite::ToSql>| {
            fields.push(format!("{column} = ?{}", values.len() + 1));
            values.push(value);
        };

        if let Some(state) = patch.tp_state {
            push(&mut fields, &mut values, "tp_state", Box::new(state.as_str()));
        }
        if let Some(sl) = patch.current_stop_loss {
            push(&mut fields, &mut values, "current_stop_loss", Box::new(sl));
        }
        if let Some(at) = patch.tp_state_changed_at {
            push(
                &mut fields,
                &mut values,
                "tp_state_changed_at",
                Box::new(at.to_rfc3339()),
            );
        }
        if let Some(bars) = patch.bars_held_after_tp1 {
            push(
                &mut fields,
                &mut values,
                "bars_held_after_tp1",
                Box::new(bars as i64),
            );
        }
        if let Some(bars) = patch.bars_held_after_tp2 {
            push(
                &mut fields,
                &mut values,
                "bars_held_after_tp2",
                Box::new(bars as i64),
            );
        }
        if let Some(ext) = patch.max_extension_after_tp1 {
            push(
                &mut fields,
                &mut values,
                "max_extension_after_tp1",
                Box::new(ext),
            );
        }
        if let Some(ext) = patch.max_extension_after_tp2 {
            push(
                &mut fields,
                &mut values,
                "max_extension_after_tp2",
                Box::new(ext),
            );
        }
        if let Some(decision) = patch.post_tp1_decision {
            push(
                &mut fields,
                &mut values,
                "post_tp1_decision",
                Box::new(decision.as_str()),
            );
        }
        if let Some(decision) = patch.post_tp2_decision {
            push(
                &mut fields,
                &mut values,
                "post_tp2_decision",
                Box::new(decision.as_str()),
            );
        }
        if let Some(reason) = &patch.tp1_exit_reason {
            push(
                &mut fields,
                &mut values,
                "tp1_exit_reason",
                Box::new(reason.clone()),
            );
        }
        if let Some(reason) = &patch.tp2_exit_reason {
            push(
                &mut fields,
                &mut values,
                "tp2_exit_reason",
                Box::new(reason.clone()),
            );
        }
        if let Some(level) = patch.trailing_sl_level {
            push(
                &mut fields,
                &mut values,
                "trailing_sl_level",
                Box::new(level),
            );
        }
        if let Some(enabled) = patch.trailing_sl_enabled {
            push(
                &mut fields,
                &mut values,
                "trailing_sl_enabled",
                Box::new(enabled as i64),
            );
        }

        if fields.is_empty() {
            return Ok(false);
        }
        push(
            &mut fields,
            &mut values,
            "updated_at",
            Box::new(Utc::now().to_rfc3339()),
        );
        values.push(Box::new(ticket as i64));

        let sql = format!(
            "UPDATE positions SET {} WHERE ticket = ?{}",
            fields.join(", "),
            values.len()
        );

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(&sql, rusqlite::params_from_iter(values.iter()))?;
        tx.commit()?;
        Ok(changed > 0)
    }

    pub fn close(self) {
        // Dropping the connection commits nothing; ensure WAL is flushed.
        if let Err((_, e)) = self.conn.close() {
            warn!("failed to close state database: {e}");
        } else {
            info!("state database closed");
        }
    }

    fn insert_position(tx: &rusqlite::Transaction<'_>, p: &Position, now: &str) -> Result<()> {
        tx.execute(
            "INSERT INTO positions (
                ticket, direction, entry_time, entry_price, volume, initial_stop_loss,
                current_stop_loss, take_profit, tp1_price, tp2_price, tp3_price, tp_state,
                tp_state_changed_at, bars_held_after_tp1, bars_held_after_tp2,
                max_extension_after_tp1, max_extension_after_tp2, post_tp1_decision,
                post_tp2_decision, tp1_exit_reason, tp2_exit_reason, trailing_sl_level,
                trailing_sl_enabled, atr_at_entry, pattern_snapshot, price_current,
                unrealized_profit, swap, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                      ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29)",
            params![
                p.ticket as i64,
                p.direction.sign() as i64,
                p.entry_time.to_rfc3339(),
                p.entry_price,
                p.volume,
                p.initial_stop_loss,
                p.current_stop_loss,
                p.take_profit,
                p.tp1_price,
                p.tp2_price,
                p.tp3_price,
                p.tp_state.as_str(),
                p.tp_state_changed_at.map(|t| t.to_rfc3339()),
                p.bars_held_after_tp1 as i64,
                p.bars_held_after_tp2 as i64,
                p.max_extension_after_tp1,
                p.max_extension_after_tp2,
                p.post_tp1_decision.as_str(),
                p.post_tp2_decision.as_str(),
                p.tp1_exit_reason,
                p.tp2_exit_reason,
                p.trailing_sl_level,
                p.trailing_sl_enabled as i64,
                p.atr_at_entry,
                p.pattern_snapshot
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                p.price_current,
                p.unrealized_profit,
                p.swap,
                now,
            ],
        )?;
        Ok(())
    }

    fn position_from_row(row: &rusqlite::Row<'_>) -> Result<Position> {
        let direction: i64 = row.get(1)?;
        let tp_state: String = row.get(11)?;
        let post_tp1: String = row.get(17)?;
        let post_tp2: String = row.get(18)?;
        let pattern_json: Option<String> = row.get(24)?;
        Ok(Position {
            ticket: row.get::<_, i64>(0)? as u64,
            direction: if direction >= 0 {
                Direction::Long
            } else {
                Direction::Short
            },
            entry_time: parse_time(&row.get::<_, String>(2)?)?,
            entry_price: row.get(3)?,
            volume: row.get(4)?,
            initial_stop_loss: row.get(5)?,
            current_stop_loss: row.get(6)?,
            take_profit: row.get(7)?,
            tp1_price: row.get(8)?,
            tp2_price: row.get(9)?,
            tp3_price: row.get(10)?,
            tp_state: TpState::parse(&tp_state).unwrap_or(TpState::InTrade),
            tp_state_changed_at: parse_time_opt(row.get::<_, Option<String>>(12)?.as_deref())?,
            bars_held_after_tp1: row.get::<_, i64>(13)?.max(0) as u32,
            bars_held_after_tp2: row.get::<_, i64>(14)?.max(0) as u32,
            max_extension_after_tp1: row.get(15)?,
            max_extension_after_tp2: row.get(16)?,
            post_tp1_decision: PostTpDecision::parse(&post_tp1)
                .unwrap_or(PostTpDecision::NotReached),
            post_tp2_decision: PostTpDecision::parse(&post_tp2)
                .unwrap_or(PostTpDecision::NotReached),
            tp1_exit_reason: row.get(19)?,
            tp2_exit_reason: row.get(20)?,
            trailing_sl_level: row.get(21)?,
            trailing_sl_enabled: row.get::<_, i64>(22)? != 0,
            atr_at_entry: row.get(23)?,
            pattern_snapshot: pattern_json
                .as_deref()
                .map(serde_json::from_str::<Pattern>)
                .transpose()?,
            price_current: row.get(25)?,
            unrealized_profit: row.get(26)?,
            swap: row.get(27)?,
        })
    }

    fn insert_trade(tx: &rusqlite::Transaction<'_>, t: &TradeRecord, now: &str) -> Result<()> {
        tx.execute(
            "INSERT INTO trades (
                ticket, entry_time, exit_time, entry_price, exit_price, stop_loss,
                take_profit, volume, gross_pl, commission, swap, net_pl, exit_reason,
                is_winner, pattern_snapshot, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                t.ticket as i64,
                t.entry_time.to_rfc3339(),
                t.exit_time.to_rfc3339(),
                t.entry_price,
                t.exit_price,
                t.stop_loss,
                t.take_profit,
                t.volume,
                t.gross_pl,
                t.commission,
                t.swap,
                t.net_pl,
                t.exit_reason,
                t.is_winner as i64,
                t.pattern_snapshot
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                now,
            ],
        )?;
        Ok(())
    }

    fn trade_from_row(row: &rusqlite::Row<'_>) -> Result<TradeRecord> {
        let pattern_json: Option<String> = row.get(14)?;
        Ok(TradeRecord {
            ticket: row.get::<_, i64>(0)? as u64,
            entry_time: parse_time(&row.get::<_, String>(1)?)?,
            exit_time: parse_time(&row.get::<_, String>(2)?)?,
            entry_price: row.get(3)?,
            exit_price: row.get(4)?,
            stop_loss: row.get(5)?,
            take_profit: row.get(6)?,
            volume: row.get(7)?,
            gross_pl: row.get(8)?,
            commission: row.get(9)?,
            swap: row.get(10)?,
            net_pl: row.get(11)?,
            exit_reason: row.get(12)?,
            is_winner: row.get::<_, i64>(13)? != 0,
            pattern_snapshot: pattern_json
                .as_deref()
                .map(serde_json::from_str::<Pattern>)
                .transpose()?,
        })
    }
}

fn parse_time(text: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(text)
        .with_context(|| format!("invalid timestamp in db: {text}"))?
        .with_timezone(&Utc))
}

fn parse_time_opt(text: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    text.map(parse_time).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PatternPoint;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn position(ticket: u64) -> Position {
        Position {
            ticket,
            direction: Direction::Long,
            entry_time: Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap(),
            entry_price: 2000.0,
            volume: 0.1,
            initial_stop_loss: 1990.0,
            current_stop_loss: 1990.0,
            take_profit: 2020.0,
            tp1_price: 2014.0,
            tp2_price: 2018.0,
            tp3_price: 2020.0,
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
            pattern_snapshot: Some(Pattern {
                left_low: PatternPoint {
                    price: 1990.0,
                    bar_index: 0,
                },
                right_low: PatternPoint {
                    price: 1990.5,
                    bar_index: 6,
                },
                neckline: 2000.0,
                quality_score: Some(7.5),
            }),
            price_current: Some(2005.0),
            unrealized_profit: Some(50.0),
            swap: -0.4,
        }
    }

    fn trade(ticket: u64, net_pl: f64) -> TradeRecord {
        TradeRecord {
            ticket,
            entry_time: Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap(),
            exit_time: Utc.with_ymd_and_hms(2024, 1, 2, 15, 0, 0).unwrap(),
            entry_price: 2000.0,
            exit_price: 2000.0 + net_pl / 10.0,
            stop_loss: 1990.0,
            take_profit: 2020.0,
            volume: 0.1,
            gross_pl: net_pl,
            commission: 0.0,
            swap: 0.0,
            net_pl,
            exit_reason: "TP3 Exit".to_string(),
            is_winner: net_pl > 0.0,
            pattern_snapshot: None,
        }
    }

    fn snapshot() -> TradingSnapshot {
        TradingSnapshot {
            open_positions: vec![position(1), position(2)],
            trade_history: vec![trade(10, 120.0), trade(11, -60.0)],
            last_trade_time: Some(Utc.with_ymd_and_hms(2024, 1, 2, 15, 0, 0).unwrap()),
            total_trades: 2,
            winning_trades: 1,
            losing_trades: 1,
            total_profit: 60.0,
            last_regime_state: None,
            saved_at: None,
        }
    }

    fn open_db(dir: &TempDir) -> StateDatabase {
        let url = format!("sqlite:///{}", dir.path().join("state.db").display());
        StateDatabase::open(&url).unwrap()
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut db = open_db(&dir);
        let snap = snapshot();
        db.save_state(&snap).unwrap();
        let loaded = db.load_latest().unwrap().unwrap();
        assert!(snap.same_state(&loaded));
        assert_eq!(loaded.open_positions.len(), 2);
        assert_eq!(loaded.trade_history.len(), 2);
        assert_eq!(loaded.total_trades, 2);
        let p = &loaded.open_positions[0];
        assert_eq!(p.ticket, 1);
        assert_eq!(p.pattern_snapshot.as_ref().unwrap().quality_score, Some(7.5));
    }

    #[test]
    fn empty_db_loads_nothing() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        assert!(!db.has_data().unwrap());
        assert!(db.load_latest().unwrap().is_none());
    }

    #[test]
    fn resave_replaces_tables_and_appends_audit() {
        let dir = TempDir::new().unwrap();
        let mut db = open_db(&dir);
        db.save_state(&snapshot()).unwrap();
        let mut second = snapshot();
        second.open_positions.pop();
        db.save_state(&second).unwrap();

        let loaded = db.load_latest().unwrap().unwrap();
        assert_eq!(loaded.open_positions.len(), 1);

        let audit_rows: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM state_snapshots", [], |r| r.get(0))
            .unwrap();
        assert_eq!(audit_rows, 2);
    }

    #[test]
    fn targeted_position_update() {
        let dir = TempDir::new().unwrap();
        let mut db = open_db(&dir);
        db.save_state(&snapshot()).unwrap();

        let patch = PositionPatch {
            tp_state: Some(TpState::Tp1Reached),
            current_stop_loss: Some(2000.0),
            bars_held_after_tp1: Some(1),
            ..Default::default()
        };
        assert!(db.update_position(1, &patch).unwrap());

        let loaded = db.load_latest().unwrap().unwrap();
        let p = loaded.open_positions.iter().find(|p| p.ticket == 1).unwrap();
        assert_eq!(p.tp_state, TpState::Tp1Reached);
        assert_eq!(p.current_stop_loss, 2000.0);
        assert_eq!(p.bars_held_after_tp1, 1);

        // Unknown ticket touches nothing.
        assert!(!db.update_position(99, &patch).unwrap());
    }

    #[test]
    fn empty_patch_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let mut db = open_db(&dir);
        db.save_state(&snapshot()).unwrap();
        assert!(!db.update_position(1, &PositionPatch::default()).unwrap());
    }

    #[test]
    fn reopen_preserves_data() {
        let dir = TempDir::new().unwrap();
        {
            let mut db = open_db(&dir);
            db.save_state(&snapshot()).unwrap();
            db.close();
        }
        let db = open_db(&dir);
        assert!(db.has_data().unwrap());
        let loaded = db.load_latest().unwrap().unwrap();
        assert_eq!(loaded.total_trades, 2);
    }

    #[test]
    fn plain_path_urls_accepted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plain.db");
        let db = StateDatabase::open(path.to_str().unwrap()).unwrap();
        assert!(!db.has_data().unwrap());
        assert!(StateDatabase::open("postgres://nope").is_err());
    }
}
