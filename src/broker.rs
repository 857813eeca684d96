use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::mpsc;

use crate::domain::{Candle, Instrument, ModifyRequest, OrderAck, OrderRequest, Quote, Tick};
use crate::error::BrokerError;

pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Candle resolution requested from the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandleInterval {
    Minute,
    FiveMinute,
    FifteenMinute,
    Hour,
    Day,
}

impl CandleInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::FiveMinute => "5minute",
            Self::FifteenMinute => "15minute",
            Self::Hour => "60minute",
            Self::Day => "day",
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            Self::Minute => Duration::minutes(1),
            Self::FiveMinute => Duration::minutes(5),
            Self::FifteenMinute => Duration::minutes(15),
            Self::Hour => Duration::hours(1),
            Self::Day => Duration::days(1),
        }
    }
}

impl fmt::Display for CandleInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CandleInterval {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "minute" | "1minute" | "1m" => Ok(Self::Minute),
            "5minute" | "5m" => Ok(Self::FiveMinute),
            "15minute" | "15m" => Ok(Self::FifteenMinute),
            "60minute" | "hour" | "1h" => Ok(Self::Hour),
            "day" | "1d" => Ok(Self::Day),
            _ => Err("invalid interval; expected minute|5minute|15minute|60minute|day"),
        }
    }
}

/// Net position as reported by the venue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub instrument: Instrument,
    /// Signed: positive long, negative short
    pub quantity: i64,
    pub average_price: Decimal,
    pub last_price: Decimal,
    pub pnl: Decimal,
}

/// Account funds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Margins {
    pub available: Decimal,
    pub used: Decimal,
    pub total: Decimal,
}

fn unsupported(feature: &str, broker: &str) -> BrokerError {
    BrokerError::DataUnavailable(format!(
        "{} is not implemented for broker '{}'",
        feature, broker
    ))
}

/// Broker capability consumed by the order manager and market data feed.
///
/// Vendor adapters map their own failures into [`BrokerError`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerClient: Send + Sync {
    fn name(&self) -> &str;

    async fn get_quote(&self, instrument: &Instrument) -> BrokerResult<Quote>;

    async fn get_historical_candles(
        &self,
        instrument: &Instrument,
        interval: CandleInterval,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> BrokerResult<Vec<Candle>>;

    async fn place_order(&self, request: &OrderRequest) -> BrokerResult<OrderAck>;

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<OrderAck>;

    async fn get_order_status(&self, order_id: &str) -> BrokerResult<OrderAck>;

    async fn modify_order(&self, order_id: &str, _modify: &ModifyRequest) -> BrokerResult<OrderAck> {
        Err(BrokerError::OrderRejected(format!(
            "modify of {} is not supported by broker '{}'",
            order_id,
            self.name()
        )))
    }

    async fn get_positions(&self) -> BrokerResult<Vec<BrokerPosition>> {
        Err(unsupported("get_positions", self.name()))
    }

    async fn get_margins(&self) -> BrokerResult<Margins> {
        Err(unsupported("get_margins", self.name()))
    }

    /// Stream ticks for the given instruments until the receiver is dropped
    async fn subscribe(&self, _instruments: &[Instrument]) -> BrokerResult<mpsc::Receiver<Tick>> {
        Err(unsupported("subscribe", self.name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_interval_accepts_aliases() {
        assert_eq!("5m".parse::<CandleInterval>().unwrap(), CandleInterval::FiveMinute);
        assert_eq!("DAY".parse::<CandleInterval>().unwrap(), CandleInterval::Day);
        assert_eq!(CandleInterval::Hour.duration(), Duration::hours(1));
        assert!("weekly".parse::<CandleInterval>().is_err());
    }
}
