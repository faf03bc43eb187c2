use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// How the trailing distance is chosen each tick
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum TrailingMode {
    /// Fixed configured percentage
    Static,
    /// Percentage picked from the volatility bucket
    #[default]
    Dynamic,
}

impl fmt::Display for TrailingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrailingMode::Static => write!(f, "STATIC"),
            TrailingMode::Dynamic => write!(f, "DYNAMIC"),
        }
    }
}

/// Lifecycle of an exit-managed position
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionState {
    Open,
    /// Exit intent dispatched, waiting for fill confirmation
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    TrailingStop,
    TimeStop,
    Manual,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::TakeProfit => "TAKE_PROFIT",
            ExitReason::TrailingStop => "TRAILING_STOP",
            ExitReason::TimeStop => "TIME_STOP",
            ExitReason::Manual => "MANUAL",
        };
        write!(f, "{}", s)
    }
}

/// One open (or closing) long position under TP/SL management
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub symbol: String,
    pub entry_price: f64,
    pub quantity: f64,
    pub max_price_seen: f64, // Peak since entry, drives the trailing stop
    pub tp_price: f64,
    pub sl_price: f64,
    pub trailing_active: bool,
    #[serde(default)]
    pub break_even_done: bool,
    #[serde(default)]
    pub mode: TrailingMode,
    pub state: PositionState,
    #[serde(default = "Utc::now")]
    pub opened_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_reason: Option<ExitReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closing_since: Option<DateTime<Utc>>,
}

impl Position {
    /// Fractional gain of `price` over entry (0.05 = +5%)
    pub fn gain_pct(&self, price: f64) -> f64 {
        (price - self.entry_price) / self.entry_price
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.quantity
    }

    pub fn is_open(&self) -> bool {
        self.state == PositionState::Open
    }
}

/// Archived record of a position after its exit fill was confirmed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClosedPosition {
    pub id: Uuid,
    pub symbol: String,
    pub entry_price: f64,
    pub quantity: f64,
    pub fill_price: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub duration_secs: i64,
    pub exit_reason: Option<ExitReason>,
    pub state: PositionState,
}

/// State of the TPSL autoloop
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum LoopState {
    #[default]
    Stopped,
    Running,
    Paused,
    /// Monitoring and exits continue, state cannot be persisted
    Degraded,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoopState::Stopped => "STOPPED",
            LoopState::Running => "RUNNING",
            LoopState::Paused => "PAUSED",
            LoopState::Degraded => "DEGRADED",
        };
        write!(f, "{}", s)
    }
}

/// Price observation held in the in-memory cache
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PriceSample {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
}
