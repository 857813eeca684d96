use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::trade::Trade;

/// Execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    /// Simulated fills, no venue orders
    #[default]
    Paper,
    /// Every order goes to the broker
    Live,
}

impl TradingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradingMode::Paper => "paper",
            TradingMode::Live => "live",
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, TradingMode::Live)
    }
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "paper" => Ok(TradingMode::Paper),
            "live" => Ok(TradingMode::Live),
            _ => Err(format!("Unknown trading mode: {}", s)),
        }
    }
}

/// Executor session states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Stopped,
    Running,
    Paused,
    /// Startup failed after the loop was requested
    Error,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Stopped => "STOPPED",
            SessionState::Running => "RUNNING",
            SessionState::Paused => "PAUSED",
            SessionState::Error => "ERROR",
        }
    }

    /// Check if this state can transition to another state
    pub fn can_transition_to(&self, target: SessionState) -> bool {
        use SessionState::*;

        match (self, target) {
            (Stopped, Running) => true,

            (Running, Paused) => true,
            (Running, Stopped) => true,
            (Running, Error) => true,

            (Paused, Running) => true,
            (Paused, Stopped) => true,

            // Retry after a failed start, or clear it
            (Error, Running) => true,
            (Error, Stopped) => true,

            _ => false,
        }
    }

    /// Loop task is alive in this state
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Running | SessionState::Paused)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for SessionState {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, String> {
        match s.to_uppercase().as_str() {
            "STOPPED" => Ok(SessionState::Stopped),
            "RUNNING" => Ok(SessionState::Running),
            "PAUSED" => Ok(SessionState::Paused),
            "ERROR" => Ok(SessionState::Error),
            _ => Err(format!("Unknown state: {}", s)),
        }
    }
}

/// One run of the executor, from `start()` to `stop()`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingSession {
    pub id: Uuid,
    pub mode: TradingMode,
    pub strategy: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub starting_capital: Decimal,
    pub final_capital: Option<Decimal>,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub realized_pnl: Decimal,
    /// Open-position P&L at the moment the session was finalized
    pub unrealized_pnl: Decimal,
    pub commission: Decimal,
}

impl TradingSession {
    pub fn new(mode: TradingMode, strategy: impl Into<String>, starting_capital: Decimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            mode,
            strategy: strategy.into(),
            started_at: Utc::now(),
            ended_at: None,
            starting_capital,
            final_capital: None,
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            commission: Decimal::ZERO,
        }
    }

    /// Fold a closed trade into the session counters
    pub fn record_trade(&mut self, trade: &Trade) {
        self.total_trades += 1;
        if trade.pnl > Decimal::ZERO {
            self.winning_trades += 1;
        } else if trade.pnl < Decimal::ZERO {
            self.losing_trades += 1;
        }
        self.realized_pnl += trade.pnl;
        self.commission += trade.commission;
    }

    pub fn finalize(&mut self, final_capital: Decimal, unrealized_pnl: Decimal) {
        self.ended_at = Some(Utc::now());
        self.final_capital = Some(final_capital);
        self.unrealized_pnl = unrealized_pnl;
    }

    pub fn is_finalized(&self) -> bool {
        self.ended_at.is_some()
    }
}
