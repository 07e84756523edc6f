//! Persisted state snapshot
//!
//! One root JSON document holds everything the system must survive a
//! restart with. Integrity is an MD5 over the sorted-keys serialization of
//! the document without its `_checksum` field; `serde_json`'s default map
//! is ordered, so serializing a `Value` already yields sorted keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{Position, RegimeState, TradeRecord};

pub const CHECKSUM_FIELD: &str = "_checksum";

/// The root persisted document. Field names are the on-disk layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradingSnapshot {
    pub open_positions: Vec<Position>,
    pub trade_history: Vec<TradeRecord>,
    pub last_trade_time: Option<DateTime<Utc>>,
    pub total_trades: u64,
    pub winning_trades: u64,
    pub losing_trades: u64,
    pub total_profit: f64,
    pub last_regime_state: Option<RegimeState>,
    /// Stamped by the writer at persist time.
    pub saved_at: Option<DateTime<Utc>>,
}

impl TradingSnapshot {
    /// Serialize with a fresh `saved_at` and an attached `_checksum`.
    pub fn to_signed_json(&self, saved_at: DateTime<Utc>) -> Result<String, serde_json::Error> {
        let mut stamped = self.clone();
        stamped.saved_at = Some(saved_at);
        let mut value = serde_json::to_value(&stamped)?;
        let checksum = checksum_of(&value);
        if let Value::Object(map) = &mut value {
            map.insert(CHECKSUM_FIELD.to_string(), Value::String(checksum));
        }
        serde_json::to_string_pretty(&value)
    }

    /// Parse a signed document, verifying the checksum when one is present.
    pub fn from_signed_json(data: &str) -> Result<Self, SnapshotError> {
        let mut value: Value = serde_json::from_str(data)?;
        let stored = match &mut value {
            Value::Object(map) => map.remove(CHECKSUM_FIELD),
            _ => return Err(SnapshotError::NotAnObject),
        };
        if let Some(Value::String(stored)) = stored {
            let computed = checksum_of(&value);
            if stored != computed {
                return Err(SnapshotError::ChecksumMismatch { stored, computed });
            }
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Deep equality ignoring `saved_at`, for the reload-identity law.
    pub fn same_state(&self, other: &Self) -> bool {
        let strip = |snapshot: &Self| {
            let mut copy = snapshot.clone();
            copy.saved_at = None;
            serde_json::to_value(copy).ok()
        };
        strip(self) == strip(other)
    }
}

/// Hex MD5 over the sorted-keys compact serialization.
pub fn checksum_of(value: &Value) -> String {
    format!("{:x}", md5::compute(value.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot checksum mismatch: stored {stored}, computed {computed}")]
    ChecksumMismatch { stored: String, computed: String },
    #[error("snapshot root is not a JSON object")]
    NotAnObject,
    #[error("snapshot parse error: {0}")]
    Parse(#[from] serde_json::Error),
}
