//! Simulated broker
//!
//! Implements the bridge over a preloaded bar series and an in-memory
//! book. The controller path is byte-identical between live and sim; only
//! this adapter changes. Tests use the failure-injection knobs to exercise
//! retry and reconnect handling.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;

use super::{BrokerBridge, BrokerError, BrokerPosition, MarketOrder, OrderFill};
use crate::models::{AccountInfo, AccountKind, Bar, BarSeries, SymbolInfo};

struct SimBook {
    balance: f64,
    next_ticket: u64,
    open: Vec<BrokerPosition>,
}

pub struct SimBroker {
    bars: Vec<Bar>,
    /// Index of the newest visible bar (treated as still forming).
    cursor: Mutex<usize>,
    symbol_info: SymbolInfo,
    connected: AtomicBool,
    book: Mutex<SimBook>,
    /// Fail the next N order submissions with a retryable error.
    fail_submissions: AtomicU32,
    /// Fail heartbeats until cleared.
    heartbeat_down: AtomicBool,
}

impl SimBroker {
    pub fn new(bars: Vec<Bar>, initial_balance: f64) -> Self {
        let start = bars.len().min(2).saturating_sub(1);
        Self {
            bars,
            cursor: Mutex::new(start),
            symbol_info: SymbolInfo::xauusd(),
            connected: AtomicBool::new(false),
            book: Mutex::new(SimBook {
                balance: initial_balance,
                next_ticket: 1000,
                open: Vec::new(),
            }),
            fail_submissions: AtomicU32::new(0),
            heartbeat_down: AtomicBool::new(false),
        }
    }

    /// Advance the visible window one bar. Returns false at end of data.
    pub fn advance(&self) -> bool {
        let mut cursor = self.cursor.lock();
        if *cursor + 1 < self.bars.len() {
            *cursor += 1;
            true
        } else {
            false
        }
    }

    pub fn set_cursor(&self, index: usize) {
        *self.cursor.lock() = index.min(self.bars.len().saturating_sub(1));
    }

    /// Price used for fills and marks: the close of the last closed bar.
    fn mark_price(&self) -> Option<f64> {
        let cursor = *self.cursor.lock();
        cursor.checked_sub(1).map(|i| self.bars[i].close)
    }

    pub fn inject_submission_failures(&self, count: u32) {
        self.fail_submissions.store(count, Ordering::SeqCst);
    }

    pub fn set_heartbeat_down(&self, down: bool) {
        self.heartbeat_down.store(down, Ordering::SeqCst);
    }

    pub fn balance(&self) -> f64 {
        self.book.lock().balance
    }

    /// Settle a ticket against the book at the given price, crediting the
    /// price difference. Used by `close_position` and by tests simulating
    /// broker-side stop fills.
    pub fn settle(&self, ticket: u64, price: f64) -> Result<(), BrokerError> {
        let mut book = self.book.lock();
        let idx = book
            .open
            .iter()
            .position(|p| p.ticket == ticket)
            .ok_or_else(|| BrokerError::Rejected(format!("unknown ticket {ticket}")))?;
        let position = book.open.remove(idx);
        let pl = (price - position.price_open) * position.volume * self.symbol_info.contract_size;
        book.balance += pl;
        debug!(ticket, price, pl, "sim position settled");
        Ok(())
    }

    fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::ConnectionLost("sim broker disconnected".into()))
        }
    }
}

#[async_trait]
impl BrokerBridge for SimBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn heartbeat(&self) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        if self.heartbeat_down.load(Ordering::SeqCst) {
            return Err(BrokerError::IpcSendFailed("heartbeat timeout".into()));
        }
        Ok(())
    }

    async fn get_bars(&self, count: usize) -> Result<BarSeries, BrokerError> {
        self.ensure_connected()?;
        let cursor = *self.cursor.lock();
        let end = (cursor + 1).min(self.bars.len());
        let start = end.saturating_sub(count);
        Ok(BarSeries::new(self.bars[start..end].to_vec()))
    }

    async fn get_symbol_info(&self) -> Result<SymbolInfo, BrokerError> {
        self.ensure_connected()?;
        Ok(self.symbol_info.clone())
    }

    async fn get_account_info(&self) -> Result<AccountInfo, BrokerError> {
        self.ensure_connected()?;
        let book = self.book.lock();
        let unrealized: f64 = book.open.iter().map(|p| p.profit).sum();
        Ok(AccountInfo {
            login: 7_000_001,
            server: "SimBroker-Demo".to_string(),
            balance: book.balance,
            equity: book.balance + unrealized,
            margin: 0.0,
            free_margin: book.balance,
            currency: "USD".to_string(),
            leverage: 100,
            kind: AccountKind::Demo,
        })
    }

    async fn get_current_tick(&self) -> Result<Option<f64>, BrokerError> {
        self.ensure_connected()?;
        Ok(self.mark_price())
    }

    async fn get_open_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        self.ensure_connected()?;
        let mark = self.mark_price();
        let mut book = self.book.lock();
        if let Some(mark) = mark {
            for position in &mut book.open {
                position.price_current = mark;
                position.profit = (mark - position.price_open)
                    * position.volume
                    * self.symbol_info.contract_size;
            }
        }
        Ok(book.open.clone())
    }

    async fn submit_market_order(&self, order: &MarketOrder) -> Result<OrderFill, BrokerError> {
        self.ensure_connected()?;
        if self
            .fail_submissions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BrokerError::IpcSendFailed("sim transport glitch".into()));
        }
        let fill_price = self
            .mark_price()
            .ok_or_else(|| BrokerError::Other("no price available".into()))?;
        if order.stop_loss >= fill_price {
            return Err(BrokerError::InvalidStops(format!(
                "sl {} >= price {}",
                order.stop_loss, fill_price
            )));
        }

        let mut book = self.book.lock();
        let ticket = book.next_ticket;
        book.next_ticket += 1;
        book.open.push(BrokerPosition {
            ticket,
            price_open: fill_price,
            price_current: fill_price,
            stop_loss: order.stop_loss,
            take_profit: order.take_profit,
            volume: order.volume,
            profit: 0.0,
            swap: 0.0,
        });
        debug!(ticket, fill_price, volume = order.volume, "sim order filled");
        Ok(OrderFill {
            ticket,
            fill_price,
            timestamp: Utc::now(),
        })
    }

    async fn close_position(&self, ticket: u64, price: Option<f64>) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        let price = price
            .or_else(|| self.mark_price())
            .ok_or_else(|| BrokerError::Other("no price available".into()))?;
        self.settle(ticket, price)
    }
}
