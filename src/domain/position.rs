use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::market::Instrument;
use super::order::OrderSide;
use super::trade::ExitReason;

/// Direction of an open position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn opposite(&self) -> Self {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }

    /// Order side that opens or adds to this position
    pub fn entry_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces or closes this position
    pub fn exit_side(&self) -> OrderSide {
        self.entry_side().opposite()
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

/// Gross P&L of closing `quantity` units.
///
/// LONG: `(exit - entry) * qty`, SHORT: `(entry - exit) * qty`.
/// Shared by the live tracker and the backtest engine.
pub fn calculate_pnl(side: PositionSide, entry: Decimal, exit: Decimal, quantity: u64) -> Decimal {
    let qty = Decimal::from(quantity);
    match side {
        PositionSide::Long => (exit - entry) * qty,
        PositionSide::Short => (entry - exit) * qty,
    }
}

/// Evaluate stop-loss and target against a price range.
///
/// Stop-loss is checked first: when one update (or one candle) satisfies
/// both, the exit is reported as `StopLoss`. For a single mark price pass
/// the same value as `low` and `high`. Returns the triggered reason and the
/// level that was crossed.
pub fn check_exit(
    side: PositionSide,
    stop_loss: Option<Decimal>,
    target: Option<Decimal>,
    low: Decimal,
    high: Decimal,
) -> Option<(ExitReason, Decimal)> {
    match side {
        PositionSide::Long => {
            if let Some(stop) = stop_loss {
                if low <= stop {
                    return Some((ExitReason::StopLoss, stop));
                }
            }
            if let Some(target) = target {
                if high >= target {
                    return Some((ExitReason::TargetHit, target));
                }
            }
        }
        PositionSide::Short => {
            if let Some(stop) = stop_loss {
                if high >= stop {
                    return Some((ExitReason::StopLoss, stop));
                }
            }
            if let Some(target) = target {
                if low <= target {
                    return Some((ExitReason::TargetHit, target));
                }
            }
        }
    }
    None
}

/// Open position for one `exchange:symbol` key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub instrument: Instrument,
    pub side: PositionSide,
    /// Always > 0 while the position exists
    pub quantity: u64,
    /// Volume-weighted mean of all same-side fills since open
    pub average_price: Decimal,
    pub mark_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub target: Option<Decimal>,
    pub unrealized_pnl: Decimal,
    /// Entry commission not yet attributed to a closed trade
    pub entry_commission: Decimal,
    pub opened_at: DateTime<Utc>,
    pub strategy: String,
    pub order_id: Option<String>,
}

impl Position {
    pub fn key(&self) -> String {
        self.instrument.key()
    }

    /// Re-mark at a new price and recompute unrealized P&L
    pub fn mark(&mut self, price: Decimal) {
        self.mark_price = price;
        self.unrealized_pnl = calculate_pnl(self.side, self.average_price, price, self.quantity);
    }

    /// Share of the pending entry commission belonging to `quantity` units
    pub fn commission_share(&self, quantity: u64) -> Decimal {
        if self.quantity == 0 || quantity >= self.quantity {
            return self.entry_commission;
        }
        self.entry_commission * Decimal::from(quantity) / Decimal::from(self.quantity)
    }

    /// Evaluate exits against a single mark price
    pub fn exit_at_mark(&self, mark: Decimal) -> Option<(ExitReason, Decimal)> {
        check_exit(self.side, self.stop_loss, self.target, mark, mark)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_pnl_formula() {
        assert_eq!(calculate_pnl(PositionSide::Long, dec!(100), dec!(110), 5), dec!(50));
        assert_eq!(calculate_pnl(PositionSide::Long, dec!(100), dec!(95), 5), dec!(-25));
        assert_eq!(calculate_pnl(PositionSide::Short, dec!(100), dec!(90), 5), dec!(50));
        assert_eq!(calculate_pnl(PositionSide::Short, dec!(100), dec!(104), 5), dec!(-20));
    }

    #[test]
    fn test_stop_checked_before_target() {
        // Range touches both levels: stop wins for either side
        let long = check_exit(PositionSide::Long, Some(dec!(95)), Some(dec!(110)), dec!(94), dec!(111));
        assert_eq!(long, Some((ExitReason::StopLoss, dec!(95))));

        let short = check_exit(PositionSide::Short, Some(dec!(105)), Some(dec!(90)), dec!(89), dec!(106));
        assert_eq!(short, Some((ExitReason::StopLoss, dec!(105))));
    }

    #[test]
    fn test_target_and_no_trigger() {
        assert_eq!(
            check_exit(PositionSide::Long, Some(dec!(95)), Some(dec!(110)), dec!(100), dec!(110)),
            Some((ExitReason::TargetHit, dec!(110)))
        );
        assert_eq!(
            check_exit(PositionSide::Short, Some(dec!(105)), Some(dec!(90)), dec!(90), dec!(100)),
            Some((ExitReason::TargetHit, dec!(90)))
        );
        assert_eq!(
            check_exit(PositionSide::Long, Some(dec!(95)), Some(dec!(110)), dec!(96), dec!(109)),
            None
        );
        assert_eq!(check_exit(PositionSide::Long, None, None, dec!(1), dec!(1000)), None);
    }
}
