//! Trading cost model shared by paper fills and the backtest engine.
//!
//! Commission per fill: `commission_per_trade + notional * commission_pct / 100`.
//! Slippage moves the fill price against the order by `slippage_pct` percent.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::OrderSide;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostModel {
    /// Flat amount charged on every fill
    pub commission_per_trade: Decimal,
    /// Percent of fill notional
    pub commission_pct: Decimal,
    /// Adverse price move applied to simulated fills, percent
    pub slippage_pct: Decimal,
}

impl CostModel {
    pub fn new(commission_per_trade: Decimal, commission_pct: Decimal, slippage_pct: Decimal) -> Self {
        Self {
            commission_per_trade,
            commission_pct,
            slippage_pct,
        }
    }

    /// No commission, no slippage
    pub fn zero() -> Self {
        Self::default()
    }

    /// Commission for one fill of `quantity` at `price`
    pub fn commission(&self, price: Decimal, quantity: u64) -> Decimal {
        let notional = price * Decimal::from(quantity);
        self.commission_per_trade + notional * self.commission_pct / Decimal::ONE_HUNDRED
    }

    /// Fill price after slippage: buys pay up, sells receive less
    pub fn apply_slippage(&self, price: Decimal, side: OrderSide) -> Decimal {
        if self.slippage_pct.is_zero() {
            return price;
        }
        let shift = price * self.slippage_pct / Decimal::ONE_HUNDRED;
        match side {
            OrderSide::Buy => price + shift,
            OrderSide::Sell => price - shift,
        }
    }

    /// Commission charged on both legs of a round-trip at the given prices
    pub fn round_trip_commission(&self, entry: Decimal, exit: Decimal, quantity: u64) -> Decimal {
        self.commission(entry, quantity) + self.commission(exit, quantity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_commission_flat_plus_pct() {
        let model = CostModel::new(dec!(20), dec!(0.03), dec!(0));
        // 20 + 100 * 500 * 0.03%
        assert_eq!(model.commission(dec!(500), 100), dec!(35));
        assert_eq!(model.round_trip_commission(dec!(500), dec!(500), 100), dec!(70));
    }

    #[test]
    fn test_slippage_is_adverse() {
        let model = CostModel::new(dec!(0), dec!(0), dec!(0.1));
        assert_eq!(model.apply_slippage(dec!(1000), OrderSide::Buy), dec!(1001));
        assert_eq!(model.apply_slippage(dec!(1000), OrderSide::Sell), dec!(999));
        assert_eq!(CostModel::zero().apply_slippage(dec!(1000), OrderSide::Buy), dec!(1000));
    }
}
