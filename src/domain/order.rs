use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::market::Instrument;
use super::position::PositionSide;
use crate::error::{OrderError, Result, TradeCoreError};

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    /// Side of the position this order opens or adds to
    pub fn position_side(&self) -> PositionSide {
        match self {
            OrderSide::Buy => PositionSide::Long,
            OrderSide::Sell => PositionSide::Short,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    /// Stop-loss limit: triggers at `trigger_price`, then rests at `price`
    StopLoss,
    /// Stop-loss market: triggers at `trigger_price`, then executes at market
    StopLossMarket,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::StopLoss => "SL",
            OrderType::StopLossMarket => "SL-M",
        }
    }

    pub fn needs_price(&self) -> bool {
        matches!(self, OrderType::Limit | OrderType::StopLoss)
    }

    pub fn needs_trigger(&self) -> bool {
        matches!(self, OrderType::StopLoss | OrderType::StopLossMarket)
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Product flag (margin treatment at the venue)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProductType {
    /// Intraday, squared off by the venue at session end
    #[default]
    Intraday,
    /// Cash-and-carry delivery
    Delivery,
    /// Carry-forward derivatives
    Normal,
}

impl ProductType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductType::Intraday => "INTRADAY",
            ProductType::Delivery => "DELIVERY",
            ProductType::Normal => "NORMAL",
        }
    }
}

/// Order validity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Validity {
    #[default]
    Day,
    /// Immediate or cancel
    Ioc,
}

impl Validity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Validity::Day => "DAY",
            Validity::Ioc => "IOC",
        }
    }
}

/// Order status
///
/// `PENDING -> PLACED -> {OPEN -> COMPLETE | CANCELLED | REJECTED} | FAILED`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    /// Created locally, not yet sent
    Pending,
    /// Accepted by the venue (or paper engine)
    Placed,
    /// Resting at the venue
    Open,
    /// Fully executed
    Complete,
    /// Cancelled before completion
    Cancelled,
    /// Rejected by the venue
    Rejected,
    /// Placement failed before reaching the venue
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Placed => "PLACED",
            OrderStatus::Open => "OPEN",
            OrderStatus::Complete => "COMPLETE",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Complete
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::Failed
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Check if this status can transition to another status
    pub fn can_transition_to(&self, target: OrderStatus) -> bool {
        use OrderStatus::*;

        match (self, target) {
            (Pending, Placed) | (Pending, Failed) => true,

            (Placed, Open)
            | (Placed, Complete)
            | (Placed, Cancelled)
            | (Placed, Rejected) => true,

            (Open, Complete) | (Open, Cancelled) | (Open, Rejected) => true,

            _ => false,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order request (what we want to do)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub instrument: Instrument,
    pub side: OrderSide,
    pub quantity: u64,
    pub order_type: OrderType,
    /// Requested (limit) price; for MARKET orders the reference price used for paper fills
    pub price: Option<Decimal>,
    pub trigger_price: Option<Decimal>,
    pub product: ProductType,
    pub validity: Validity,
    /// Originating strategy tag
    pub tag: Option<String>,
}

impl OrderRequest {
    pub fn market(
        instrument: Instrument,
        side: OrderSide,
        quantity: u64,
        reference_price: Decimal,
    ) -> Self {
        Self {
            instrument,
            side,
            quantity,
            order_type: OrderType::Market,
            price: Some(reference_price),
            trigger_price: None,
            product: ProductType::Intraday,
            validity: Validity::Day,
            tag: None,
        }
    }

    pub fn limit(instrument: Instrument, side: OrderSide, quantity: u64, price: Decimal) -> Self {
        Self {
            order_type: OrderType::Limit,
            ..Self::market(instrument, side, quantity, price)
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Reject malformed requests before they reach a venue
    pub fn validate(&self) -> std::result::Result<(), OrderError> {
        if self.quantity == 0 {
            return Err(OrderError::InvalidQuantity(self.quantity));
        }
        if self.order_type.needs_price() && self.price.map_or(true, |p| p <= Decimal::ZERO) {
            return Err(OrderError::PriceRequired {
                order_type: self.order_type.to_string(),
            });
        }
        if self.order_type.needs_trigger()
            && self.trigger_price.map_or(true, |p| p <= Decimal::ZERO)
        {
            return Err(OrderError::PriceRequired {
                order_type: format!("{} trigger", self.order_type),
            });
        }
        Ok(())
    }
}

/// Changes requested on a working order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModifyRequest {
    pub quantity: Option<u64>,
    pub price: Option<Decimal>,
    pub trigger_price: Option<Decimal>,
    pub order_type: Option<OrderType>,
}

impl ModifyRequest {
    pub fn is_empty(&self) -> bool {
        self.quantity.is_none()
            && self.price.is_none()
            && self.trigger_price.is_none()
            && self.order_type.is_none()
    }
}

/// Order (tracked in our system)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Local id, or the venue id once placed live
    pub id: String,
    pub instrument: Instrument,
    pub side: OrderSide,
    pub quantity: u64,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub trigger_price: Option<Decimal>,
    pub product: ProductType,
    pub validity: Validity,
    pub status: OrderStatus,
    pub filled_quantity: u64,
    pub average_price: Option<Decimal>,
    pub tag: Option<String>,
    pub status_message: Option<String>,
    /// Raw execution-venue response
    pub raw_response: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub modified_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn from_request(id: impl Into<String>, request: &OrderRequest) -> Self {
        Self {
            id: id.into(),
            instrument: request.instrument.clone(),
            side: request.side,
            quantity: request.quantity,
            order_type: request.order_type,
            price: request.price,
            trigger_price: request.trigger_price,
            product: request.product,
            validity: request.validity,
            status: OrderStatus::Pending,
            filled_quantity: 0,
            average_price: None,
            tag: request.tag.clone(),
            status_message: None,
            raw_response: None,
            created_at: Utc::now(),
            modified_at: None,
            cancelled_at: None,
            completed_at: None,
        }
    }

    /// Move to a new status, enforcing the lifecycle. Same-status updates are no-ops.
    pub fn transition(&mut self, to: OrderStatus) -> Result<()> {
        if self.status == to {
            return Ok(());
        }
        if !self.status.can_transition_to(to) {
            return Err(TradeCoreError::InvalidStateTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }

        let now = Utc::now();
        match to {
            OrderStatus::Complete => self.completed_at = Some(now),
            OrderStatus::Cancelled => self.cancelled_at = Some(now),
            _ => {}
        }
        self.status = to;
        Ok(())
    }

    /// Record a full execution
    pub fn fill(&mut self, quantity: u64, average_price: Decimal) -> Result<()> {
        self.transition(OrderStatus::Complete)?;
        self.filled_quantity = quantity;
        self.average_price = Some(average_price);
        Ok(())
    }

    /// Whether any quantity executed, including before a cancel landed
    pub fn has_execution(&self) -> bool {
        self.status == OrderStatus::Complete || self.filled_quantity > 0
    }

    /// Apply a modification to a working order
    pub fn apply_modification(&mut self, modify: &ModifyRequest) -> Result<()> {
        if self.status.is_terminal() {
            return Err(OrderError::AlreadyTerminal {
                order_id: self.id.clone(),
                status: self.status.to_string(),
            }
            .into());
        }
        if let Some(quantity) = modify.quantity {
            self.quantity = quantity;
        }
        if let Some(price) = modify.price {
            self.price = Some(price);
        }
        if let Some(trigger) = modify.trigger_price {
            self.trigger_price = Some(trigger);
        }
        if let Some(order_type) = modify.order_type {
            self.order_type = order_type;
        }
        self.modified_at = Some(Utc::now());
        Ok(())
    }
}

/// Acknowledgement returned by a venue on placement or status query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub status: OrderStatus,
    pub filled_quantity: u64,
    pub average_price: Option<Decimal>,
    pub message: Option<String>,
    pub raw: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request() -> OrderRequest {
        OrderRequest::market(Instrument::new("NSE", "SBIN"), OrderSide::Buy, 10, dec!(600))
    }

    #[test]
    fn test_valid_transitions() {
        use OrderStatus::*;

        assert!(Pending.can_transition_to(Placed));
        assert!(Pending.can_transition_to(Failed));
        assert!(Placed.can_transition_to(Open));
        assert!(Placed.can_transition_to(Complete));
        assert!(Open.can_transition_to(Complete));
        assert!(Open.can_transition_to(Cancelled));
        assert!(Open.can_transition_to(Rejected));

        assert!(!Pending.can_transition_to(Complete));
        assert!(!Placed.can_transition_to(Failed));
        assert!(!Complete.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Open));
        assert!(!Failed.can_transition_to(Placed));
    }

    #[test]
    fn test_terminal_order_is_immutable() {
        let mut order = Order::from_request("o-1", &request());
        order.transition(OrderStatus::Placed).unwrap();
        order.fill(10, dec!(601)).unwrap();
        assert!(order.completed_at.is_some());

        assert!(order.transition(OrderStatus::Cancelled).is_err());
        let modify = ModifyRequest {
            quantity: Some(5),
            ..Default::default()
        };
        assert!(order.apply_modification(&modify).is_err());
        assert_eq!(order.quantity, 10);
    }

    #[test]
    fn test_request_validation() {
        assert!(request().validate().is_ok());

        let mut zero = request();
        zero.quantity = 0;
        assert!(zero.validate().is_err());

        let mut limit = OrderRequest::limit(Instrument::new("NSE", "SBIN"), OrderSide::Sell, 1, dec!(0));
        assert!(limit.validate().is_err());
        limit.price = Some(dec!(590));
        assert!(limit.validate().is_ok());

        let mut sl = request();
        sl.order_type = OrderType::StopLossMarket;
        assert!(sl.validate().is_err());
        sl.trigger_price = Some(dec!(580));
        assert!(sl.validate().is_ok());
    }
}
