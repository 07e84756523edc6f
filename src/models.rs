//! Core domain types shared by the engines, the position store, and the
//! broker bridge. Prices are 64-bit floats; timestamps are `DateTime<Utc>`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Trade direction. The decision engine is long-only; `Short` exists so a
/// short request can be rejected with an explicit fail code instead of a
/// silent no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for long, -1 for short.
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        }
    }
}

/// Chart timeframe. Bar-close arithmetic converts through `minutes()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
    W1,
    MN1,
}

impl Timeframe {
    pub fn minutes(&self) -> i64 {
        match self {
            Timeframe::M1 => 1,
            Timeframe::M5 => 5,
            Timeframe::M15 => 15,
            Timeframe::M30 => 30,
            Timeframe::H1 => 60,
            Timeframe::H4 => 240,
            Timeframe::D1 => 1440,
            Timeframe::W1 => 10_080,
            Timeframe::MN1 => 43_200,
        }
    }

    /// Converts the cooldown setting (hours) into whole bars for the
    /// decision engine's execution guards. Rounds up so a partial bar still
    /// counts as cooldown.
    pub fn hours_to_bars(&self, hours: f64) -> i64 {
        ((hours * 60.0) / self.minutes() as f64).ceil() as i64
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_uppercase().as_str() {
            "M1" => Some(Timeframe::M1),
            "M5" => Some(Timeframe::M5),
            "M15" => Some(Timeframe::M15),
            "M30" => Some(Timeframe::M30),
            "H1" => Some(Timeframe::H1),
            "H4" => Some(Timeframe::H4),
            "D1" => Some(Timeframe::D1),
            "W1" => Some(Timeframe::W1),
            "MN1" => Some(Timeframe::MN1),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "M1",
            Timeframe::M5 => "M5",
            Timeframe::M15 => "M15",
            Timeframe::M30 => "M30",
            Timeframe::H1 => "H1",
            Timeframe::H4 => "H4",
            Timeframe::D1 => "D1",
            Timeframe::W1 => "W1",
            Timeframe::MN1 => "MN1",
        }
    }
}

/// A single OHLC bar with its derived indicator columns.
///
/// Indicator fields are `NAN` during warmup; consumers must check
/// `is_finite()` before using them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub tick_volume: Option<u64>,
    pub ema50: f64,
    pub ema200: f64,
    pub atr14: f64,
}

impl Bar {
    /// Absolute body size (close vs open), the momentum filter input.
    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    pub fn is_down_bar(&self) -> bool {
        self.close < self.open
    }

    /// OHLC fields are all finite numbers.
    pub fn ohlc_finite(&self) -> bool {
        self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite()
    }
}

/// Ordered bar history. The LAST element may be the currently forming bar;
/// decision code must only read up to `last_closed_index()`.
#[derive(Debug, Clone, Default)]
pub struct BarSeries {
    bars: Vec<Bar>,
}

impl BarSeries {
    pub fn new(bars: Vec<Bar>) -> Self {
        Self { bars }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Bar> {
        self.bars.get(index)
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn push(&mut self, bar: Bar) {
        self.bars.push(bar);
    }

    /// Index of the last fully closed bar. The final element is treated as
    /// possibly still forming.
    pub fn last_closed_index(&self) -> Option<usize> {
        self.bars.len().checked_sub(2)
    }

    pub fn last_closed(&self) -> Option<&Bar> {
        self.last_closed_index().and_then(|i| self.bars.get(i))
    }
}

/// One anchor point of a detected pattern.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PatternPoint {
    pub price: f64,
    pub bar_index: usize,
}

/// Double-bottom pattern as exposed by the detector on the last closed bar.
///
/// Detection internals are external to this crate; the engines consume the
/// finished view. `quality_score` is optional and only used when the
/// quality gate is configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub left_low: PatternPoint,
    pub right_low: PatternPoint,
    pub neckline: f64,
    pub quality_score: Option<f64>,
}

impl Pattern {
    pub fn bars_between(&self) -> i64 {
        self.right_low.bar_index as i64 - self.left_low.bar_index as i64
    }
}

/// Discrete market regime label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Regime {
    Bull,
    Bear,
    Range,
}

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::Bull => "BULL",
            Regime::Bear => "BEAR",
            Regime::Range => "RANGE",
        }
    }
}

/// Full regime evaluation, cached by the state manager and persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeState {
    pub regime: Regime,
    pub confidence: f64,
    pub ema50_ema200_distance_pct: f64,
    pub price_ema50_distance_pct: f64,
}

impl Default for RegimeState {
    fn default() -> Self {
        Self {
            regime: Regime::Range,
            confidence: 0.0,
            ema50_ema200_distance_pct: 0.0,
            price_ema50_distance_pct: 0.0,
        }
    }
}

/// Momentum read from the recent closed-bar window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MomentumState {
    Strong,
    Moderate,
    Broken,
    Unknown,
}

/// Market structure read from recent swing lows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StructureState {
    HigherLows,
    LowerLow,
    Unknown,
}

/// Multi-level take-profit state machine. Transitions are forward-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TpState {
    InTrade,
    Tp1Reached,
    Tp2Reached,
    Exited,
}

impl TpState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TpState::InTrade => "IN_TRADE",
            TpState::Tp1Reached => "TP1_REACHED",
            TpState::Tp2Reached => "TP2_REACHED",
            TpState::Exited => "EXITED",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "IN_TRADE" => Some(TpState::InTrade),
            "TP1_REACHED" => Some(TpState::Tp1Reached),
            "TP2_REACHED" => Some(TpState::Tp2Reached),
            "EXITED" => Some(TpState::Exited),
            _ => None,
        }
    }

    /// Forward-only ordering used to reject backwards transitions.
    pub fn rank(&self) -> u8 {
        match self {
            TpState::InTrade => 0,
            TpState::Tp1Reached => 1,
            TpState::Tp2Reached => 2,
            TpState::Exited => 3,
        }
    }
}

/// Decision taken by the post-TP1 / post-TP2 engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PostTpDecision {
    NotReached,
    Hold,
    WaitNextBar,
    ExitTrade,
}

impl PostTpDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostTpDecision::NotReached => "NOT_REACHED",
            PostTpDecision::Hold => "HOLD",
            PostTpDecision::WaitNextBar => "WAIT_NEXT_BAR",
            PostTpDecision::ExitTrade => "EXIT_TRADE",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "NOT_REACHED" => Some(PostTpDecision::NotReached),
            "HOLD" => Some(PostTpDecision::Hold),
            "WAIT_NEXT_BAR" => Some(PostTpDecision::WaitNextBar),
            "EXIT_TRADE" => Some(PostTpDecision::ExitTrade),
            _ => None,
        }
    }
}

/// Broker symbol metadata needed for sizing and P/L.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    pub point: f64,
    pub tick_size: f64,
    pub tick_value: f64,
    pub volume_min: f64,
    pub volume_max: f64,
    pub volume_step: f64,
    pub contract_size: f64,
    pub digits: u32,
    pub spread: f64,
}

impl SymbolInfo {
    /// Gold contract defaults, used by tests and the simulated broker.
    pub fn xauusd() -> Self {
        Self {
            symbol: "XAUUSD".to_string(),
            point: 0.01,
            tick_size: 0.01,
            tick_value: 1.0,
            volume_min: 0.01,
            volume_max: 100.0,
            volume_step: 0.01,
            contract_size: 100.0,
            digits: 2,
            spread: 0.3,
        }
    }
}

/// Demo vs live classification, decided bridge-side from server and
/// trade-mode fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountKind {
    Demo,
    Live,
    Unknown,
}

/// Broker account snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub login: i64,
    pub server: String,
    pub balance: f64,
    pub equity: f64,
    pub margin: f64,
    pub free_margin: f64,
    pub currency: String,
    pub leverage: i64,
    pub kind: AccountKind,
}

/// The slice of account state the decision engine needs. Kept deliberately
/// small so live and backtest build it identically.
#[derive(Debug, Clone, Copy)]
pub struct AccountState {
    pub equity: f64,
    pub open_positions_count: usize,
    /// Bar index of the most recent trade event. Callers with no prior
    /// trades pass a large negative sentinel; the engine only subtracts.
    pub last_trade_bar: i64,
}

/// An open position tracked by the state manager.
///
/// Mutated only by the multi-level TP engine (state transitions, stop
/// raises) and by the store on broker-reported exits. `current_stop_loss`
/// is monotone non-decreasing for longs over the position's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub ticket: u64,
    pub direction: Direction,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub volume: f64,
    pub initial_stop_loss: f64,
    pub current_stop_loss: f64,
    /// Final target; equals `tp3_price`.
    pub take_profit: f64,
    pub tp1_price: f64,
    pub tp2_price: f64,
    pub tp3_price: f64,
    pub tp_state: TpState,
    pub tp_state_changed_at: Option<DateTime<Utc>>,
    pub bars_held_after_tp1: u32,
    pub bars_held_after_tp2: u32,
    pub max_extension_after_tp1: f64,
    pub max_extension_after_tp2: f64,
    pub post_tp1_decision: PostTpDecision,
    pub post_tp2_decision: PostTpDecision,
    pub tp1_exit_reason: Option<String>,
    pub tp2_exit_reason: Option<String>,
    pub trailing_sl_level: Option<f64>,
    pub trailing_sl_enabled: bool,
    pub atr_at_entry: f64,
    pub pattern_snapshot: Option<Pattern>,
    // Broker-reported fields, refreshed each tick/bar.
    pub price_current: Option<f64>,
    pub unrealized_profit: Option<f64>,
    pub swap: f64,
}

impl Position {
    /// Raise the stop, never lower it. Returns true when the stop moved.
    pub fn raise_stop(&mut self, candidate: f64) -> bool {
        if candidate > self.current_stop_loss {
            self.current_stop_loss = candidate;
            true
        } else {
            false
        }
    }
}

/// Immutable record of a completed trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub ticket: u64,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub volume: f64,
    pub gross_pl: f64,
    pub commission: f64,
    pub swap: f64,
    pub net_pl: f64,
    pub exit_reason: String,
    pub is_winner: bool,
    pub pattern_snapshot: Option<Pattern>,
}

/// Aggregate performance statistics derived from the trade history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeStatistics {
    pub total_trades: u64,
    pub winning_trades: u64,
    pub losing_trades: u64,
    pub win_rate: f64,
    pub total_profit: f64,
    pub average_win: f64,
    pub average_loss: f64,
    pub profit_factor: f64,
    pub last_trade_time: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bar(close: f64) -> Bar {
        Bar {
            time: Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap(),
            open: close - 1.0,
            high: close + 1.0,
            low: close - 2.0,
            close,
            tick_volume: None,
            ema50: close - 3.0,
            ema200: close - 6.0,
            atr14: 5.0,
        }
    }

    #[test]
    fn last_closed_skips_forming_bar() {
        let series = BarSeries::new(vec![bar(2000.0), bar(2001.0), bar(2002.0)]);
        assert_eq!(series.last_closed_index(), Some(1));
        assert_eq!(series.last_closed().unwrap().close, 2001.0);
    }

    #[test]
    fn last_closed_needs_two_bars() {
        let series = BarSeries::new(vec![bar(2000.0)]);
        assert_eq!(series.last_closed_index(), None);
        assert!(BarSeries::default().last_closed().is_none());
    }

    #[test]
    fn raise_stop_is_monotone() {
        let mut pos = Position {
            ticket: 1,
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
            pattern_snapshot: None,
            price_current: None,
            unrealized_profit: None,
            swap: 0.0,
        };
        assert!(pos.raise_stop(2000.0));
        assert!(!pos.raise_stop(1995.0));
        assert_eq!(pos.current_stop_loss, 2000.0);
    }

    #[test]
    fn tp_state_round_trips_through_strings() {
        for state in [
            TpState::InTrade,
            TpState::Tp1Reached,
            TpState::Tp2Reached,
            TpState::Exited,
        ] {
            assert_eq!(TpState::parse(state.as_str()), Some(state));
        }
    }

    #[test]
    fn timeframe_parse_round_trips() {
        for tf in ["M1", "M5", "M15", "M30", "H1", "H4", "D1", "W1", "MN1"] {
            assert_eq!(Timeframe::parse(tf).unwrap().as_str(), tf);
        }
        assert!(Timeframe::parse("H2").is_none());
    }

    #[test]
    fn cooldown_hours_convert_to_bars() {
        assert_eq!(Timeframe::H1.hours_to_bars(5.0), 5);
        assert_eq!(Timeframe::M15.hours_to_bars(1.0), 4);
        assert_eq!(Timeframe::H4.hours_to_bars(5.0), 2);
    }
}
