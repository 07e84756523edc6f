//! Broker bridge port
//!
//! The core talks to the outside world through this narrow trait. Errors
//! are categorized so the controller can tell a retryable IPC hiccup from
//! a hard rejection. Account-type detection (demo vs live) happens on the
//! bridge side; the core only consumes the classification.

pub mod sim;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{AccountInfo, AccountKind, BarSeries, SymbolInfo};

pub use sim::SimBroker;

#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// Transport failure; safe to retry with backoff.
    #[error("IPC send failed: {0}")]
    IpcSendFailed(String),
    #[error("invalid stops: {0}")]
    InvalidStops(String),
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("not enough money: {0}")]
    NotEnoughMoney(String),
    #[error("market closed")]
    MarketClosed,
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("broker error: {0}")]
    Other(String),
}

impl BrokerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::IpcSendFailed(_))
    }

    pub fn is_connection_lost(&self) -> bool {
        matches!(self, BrokerError::ConnectionLost(_))
    }
}

/// A market order request. Long-only by construction: there is no side
/// field to get wrong.
#[derive(Debug, Clone)]
pub struct MarketOrder {
    pub volume: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub comment: String,
}

/// Broker confirmation of a filled order.
#[derive(Debug, Clone, Copy)]
pub struct OrderFill {
    pub ticket: u64,
    pub fill_price: f64,
    pub timestamp: DateTime<Utc>,
}

/// Broker-side view of an open position, used to refresh marks and to
/// reconcile externally closed tickets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub ticket: u64,
    pub price_open: f64,
    pub price_current: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub volume: f64,
    pub profit: f64,
    pub swap: f64,
}

#[async_trait]
pub trait BrokerBridge: Send + Sync {
    async fn connect(&self) -> Result<(), BrokerError>;
    async fn disconnect(&self) -> Result<(), BrokerError>;
    /// Cheap liveness probe used by the controller's heartbeat task.
    async fn heartbeat(&self) -> Result<(), BrokerError>;
    /// The most recent `count` bars, last element possibly still forming.
    async fn get_bars(&self, count: usize) -> Result<BarSeries, BrokerError>;
    async fn get_symbol_info(&self) -> Result<SymbolInfo, BrokerError>;
    async fn get_account_info(&self) -> Result<AccountInfo, BrokerError>;
    /// Current bid, or `None` when no tick is available.
    async fn get_current_tick(&self) -> Result<Option<f64>, BrokerError>;
    async fn get_open_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError>;
    async fn submit_market_order(&self, order: &MarketOrder) -> Result<OrderFill, BrokerError>;
    async fn close_position(&self, ticket: u64, price: Option<f64>) -> Result<(), BrokerError>;
}

/// Demo vs live from the terminal's server name and trade-mode string.
pub fn classify_account(server: &str, trade_mode: &str) -> AccountKind {
    let server = server.to_ascii_lowercase();
    let mode = trade_mode.to_ascii_lowercase();
    if mode.contains("demo") || server.contains("demo") || server.contains("trial") {
        AccountKind::Demo
    } else if mode.contains("real") || mode.contains("live") {
        AccountKind::Live
    } else {
        AccountKind::Unknown
    }
}
