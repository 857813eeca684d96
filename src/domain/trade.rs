use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::market::Instrument;
use super::position::PositionSide;

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TargetHit,
    Signal,
    Manual,
    PeriodEnd,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TargetHit => "target_hit",
            ExitReason::Signal => "signal",
            ExitReason::Manual => "manual",
            ExitReason::PeriodEnd => "period_end",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    Closed,
}

/// Closed round-trip. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub instrument: Instrument,
    pub side: PositionSide,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: u64,
    pub stop_loss: Option<Decimal>,
    pub target: Option<Decimal>,
    /// Net of `commission`
    pub pnl: Decimal,
    /// Net P&L as percent of entry notional
    pub pnl_pct: Decimal,
    /// Entry plus exit commission
    pub commission: Decimal,
    pub exit_reason: ExitReason,
    pub status: TradeStatus,
    pub strategy: String,
}

impl Trade {
    /// Build a closed trade from gross P&L and total commission
    #[allow(clippy::too_many_arguments)]
    pub fn closed(
        instrument: Instrument,
        side: PositionSide,
        entry_time: DateTime<Utc>,
        exit_time: DateTime<Utc>,
        entry_price: Decimal,
        exit_price: Decimal,
        quantity: u64,
        stop_loss: Option<Decimal>,
        target: Option<Decimal>,
        gross_pnl: Decimal,
        commission: Decimal,
        exit_reason: ExitReason,
        strategy: String,
    ) -> Self {
        let pnl = gross_pnl - commission;
        let notional = entry_price * Decimal::from(quantity);
        let pnl_pct = if notional.is_zero() {
            Decimal::ZERO
        } else {
            (pnl / notional * Decimal::ONE_HUNDRED).round_dp(4)
        };

        Self {
            instrument,
            side,
            entry_time,
            exit_time,
            entry_price,
            exit_price,
            quantity,
            stop_loss,
            target,
            pnl,
            pnl_pct,
            commission,
            exit_reason,
            status: TradeStatus::Closed,
            strategy,
        }
    }

    pub fn is_win(&self) -> bool {
        self.pnl > Decimal::ZERO
    }

    pub fn holding_minutes(&self) -> i64 {
        (self.exit_time - self.entry_time).num_minutes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_trade_pnl_is_net_of_commission() {
        let now = Utc::now();
        let trade = Trade::closed(
            Instrument::new("NSE", "TCS"),
            PositionSide::Long,
            now,
            now,
            dec!(1000),
            dec!(1010),
            10,
            Some(dec!(990)),
            None,
            dec!(100),
            dec!(40),
            ExitReason::Manual,
            "test".into(),
        );
        assert_eq!(trade.pnl, dec!(60));
        assert_eq!(trade.pnl_pct, dec!(0.6));
        assert!(trade.is_win());
        assert_eq!(trade.exit_reason.to_string(), "manual");
    }
}
