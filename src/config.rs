//! Application configuration
//!
//! Layered: TOML file first, then environment variable overrides applied
//! last. Validation is fail-fast; an invalid configuration terminates the
//! process with exit code 2 before anything connects or trades.

use std::env;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::Timeframe;

/// Strategy block: double-bottom detection and entry filter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    #[serde(default = "default_pivot_lookback")]
    pub pivot_lookback_left: usize,
    #[serde(default = "default_pivot_lookback")]
    pub pivot_lookback_right: usize,
    /// Maximum price difference between the two lows, in price units.
    /// Enforced by the external pattern detector; carried here so the
    /// pattern snapshot records what the detector ran with.
    #[serde(default = "default_equality_tolerance")]
    pub equality_tolerance: f64,
    #[serde(default = "default_min_bars_between")]
    pub min_bars_between: i64,
    #[serde(default = "default_atr_multiplier_stop")]
    pub atr_multiplier_stop: f64,
    #[serde(default = "default_rr_long")]
    pub risk_reward_ratio_long: f64,
    #[serde(default = "default_momentum_atr_threshold")]
    pub momentum_atr_threshold: f64,
    #[serde(default)]
    pub enable_momentum_filter: bool,
    #[serde(default = "default_cooldown_hours")]
    pub cooldown_hours: f64,
    #[serde(default = "default_pyramiding")]
    pub pyramiding: usize,
    /// Entry quality gate; `None` disables the stage.
    #[serde(default)]
    pub quality_score_threshold: Option<f64>,
    /// Minimum ATR accepted by the risk model. Values below this are
    /// treated as a data-quality problem for gold.
    #[serde(default = "default_atr_min")]
    pub atr_min: f64,
}

fn default_pivot_lookback() -> usize {
    5
}
fn default_equality_tolerance() -> f64 {
    2.0
}
fn default_min_bars_between() -> i64 {
    5
}
fn default_atr_multiplier_stop() -> f64 {
    2.0
}
fn default_rr_long() -> f64 {
    2.0
}
fn default_momentum_atr_threshold() -> f64 {
    0.5
}
fn default_cooldown_hours() -> f64 {
    5.0
}
fn default_pyramiding() -> usize {
    3
}
fn default_atr_min() -> f64 {
    0.5
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            pivot_lookback_left: default_pivot_lookback(),
            pivot_lookback_right: default_pivot_lookback(),
            equality_tolerance: default_equality_tolerance(),
            min_bars_between: default_min_bars_between(),
            atr_multiplier_stop: default_atr_multiplier_stop(),
            risk_reward_ratio_long: default_rr_long(),
            momentum_atr_threshold: default_momentum_atr_threshold(),
            enable_momentum_filter: false,
            cooldown_hours: default_cooldown_hours(),
            pyramiding: default_pyramiding(),
            quality_score_threshold: None,
            atr_min: default_atr_min(),
        }
    }
}

/// Risk block: sizing and account protection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_risk_percent")]
    pub risk_percent: f64,
    #[serde(default)]
    pub commission_per_lot: f64,
    #[serde(default = "default_max_drawdown")]
    pub max_drawdown_percent: f64,
}

fn default_risk_percent() -> f64 {
    1.0
}
fn default_max_drawdown() -> f64 {
    10.0
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_percent: default_risk_percent(),
            commission_per_lot: 0.0,
            max_drawdown_percent: default_max_drawdown(),
        }
    }
}

/// Broker terminal block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mt5Config {
    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default = "default_timeframe")]
    pub timeframe: String,
    #[serde(default = "default_magic_number")]
    pub magic_number: i64,
}

fn default_symbol() -> String {
    "XAUUSD".to_string()
}
fn default_timeframe() -> String {
    "H1".to_string()
}
fn default_magic_number() -> i64 {
    234_000
}

impl Default for Mt5Config {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            timeframe: default_timeframe(),
            magic_number: default_magic_number(),
        }
    }
}

/// Data block: history depth and persistence locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_bars_to_fetch")]
    pub bars_to_fetch: usize,
    #[serde(default = "default_state_file")]
    pub state_file: String,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: String,
    /// `sqlite:///path/to/state.db`; `None` disables the database backend
    /// and keeps the JSON snapshot as the only store.
    #[serde(default)]
    pub db_url: Option<String>,
}

fn default_bars_to_fetch() -> usize {
    500
}
fn default_state_file() -> String {
    "data/state.json".to_string()
}
fn default_backup_dir() -> String {
    "data/backups".to_string()
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            bars_to_fetch: default_bars_to_fetch(),
            state_file: default_state_file(),
            backup_dir: default_backup_dir(),
            db_url: None,
        }
    }
}

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub mt5: Mt5Config,
    #[serde(default)]
    pub data: DataConfig,
}

impl AppConfig {
    /// Load from a TOML file, then apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults + environment overrides, for running without a config file.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment variables win over file values. Unparseable values are
    /// ignored so a stray export cannot silently change semantics.
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_f64("AURUM_RISK_PERCENT") {
            self.risk.risk_percent = v;
        }
        if let Some(v) = env_f64("AURUM_COMMISSION_PER_LOT") {
            self.risk.commission_per_lot = v;
        }
        if let Some(v) = env_f64("AURUM_ATR_MULTIPLIER_STOP") {
            self.strategy.atr_multiplier_stop = v;
        }
        if let Some(v) = env_f64("AURUM_RR_LONG") {
            self.strategy.risk_reward_ratio_long = v;
        }
        if let Some(v) = env_f64("AURUM_COOLDOWN_HOURS") {
            self.strategy.cooldown_hours = v;
        }
        if let Some(v) = env_usize("AURUM_PYRAMIDING") {
            self.strategy.pyramiding = v;
        }
        if let Some(v) = env_bool("AURUM_ENABLE_MOMENTUM_FILTER") {
            self.strategy.enable_momentum_filter = v;
        }
        if let Ok(v) = env::var("AURUM_SYMBOL") {
            if !v.trim().is_empty() {
                self.mt5.symbol = v;
            }
        }
        if let Ok(v) = env::var("AURUM_TIMEFRAME") {
            if !v.trim().is_empty() {
                self.mt5.timeframe = v;
            }
        }
        if let Ok(v) = env::var("AURUM_STATE_FILE") {
            if !v.trim().is_empty() {
                self.data.state_file = v;
            }
        }
        if let Ok(v) = env::var("AURUM_BACKUP_DIR") {
            if !v.trim().is_empty() {
                self.data.backup_dir = v;
            }
        }
        if let Ok(v) = env::var("AURUM_DB_URL") {
            if !v.trim().is_empty() {
                self.data.db_url = Some(v);
            }
        }
    }

    /// Reject configurations that would make the engines misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.strategy.pyramiding < 1 {
            anyhow::bail!("strategy.pyramiding must be >= 1");
        }
        if self.strategy.atr_multiplier_stop <= 0.0 {
            anyhow::bail!("strategy.atr_multiplier_stop must be > 0");
        }
        if self.strategy.risk_reward_ratio_long <= 0.0 {
            anyhow::bail!("strategy.risk_reward_ratio_long must be > 0");
        }
        if self.risk.risk_percent <= 0.0 {
            anyhow::bail!("risk.risk_percent must be > 0");
        }
        if self.strategy.min_bars_between < 1 {
            anyhow::bail!("strategy.min_bars_between must be >= 1");
        }
        if Timeframe::parse(&self.mt5.timeframe).is_none() {
            anyhow::bail!(
                "mt5.timeframe must be one of M1, M5, M15, M30, H1, H4, D1, W1, MN1 (got {})",
                self.mt5.timeframe
            );
        }
        Ok(())
    }

    pub fn timeframe(&self) -> Timeframe {
        // validate() has already run; default keeps accessors infallible.
        Timeframe::parse(&self.mt5.timeframe).unwrap_or(Timeframe::H1)
    }

    /// Cooldown expressed in bars of the configured timeframe.
    pub fn cooldown_bars(&self) -> i64 {
        self.timeframe().hours_to_bars(self.strategy.cooldown_hours)
    }
}

fn env_f64(name: &str) -> Option<f64> {
    env::var(name).ok()?.trim().parse().ok()
}

fn env_usize(name: &str) -> Option<usize> {
    env::var(name).ok()?.trim().parse().ok()
}

fn env_bool(name: &str) -> Option<bool> {
    match env::var(name).ok()?.trim() {
        "1" | "true" | "TRUE" | "on" | "ON" | "yes" => Some(true),
        "0" | "false" | "FALSE" | "off" | "OFF" | "no" => Some(false),
        _ => None,
    }
}
