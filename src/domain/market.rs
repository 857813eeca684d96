use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A tradable instrument, keyed as `EXCHANGE:SYMBOL`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Instrument {
    pub exchange: String,
    pub symbol: String,
}

impl Instrument {
    pub fn new(exchange: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            symbol: symbol.into(),
        }
    }

    /// Position key (`exchange:symbol`)
    pub fn key(&self) -> String {
        position_key(&self.exchange, &self.symbol)
    }
}

/// Build the `exchange:symbol` key used for positions and quote caches
pub fn position_key(exchange: &str, symbol: &str) -> String {
    format!("{}:{}", exchange, symbol)
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange, self.symbol)
    }
}

impl FromStr for Instrument {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().split_once(':') {
            Some((exchange, symbol)) if !exchange.is_empty() && !symbol.is_empty() => {
                Ok(Instrument::new(exchange.to_uppercase(), symbol.to_uppercase()))
            }
            _ => Err(format!("invalid instrument '{}'; expected EXCHANGE:SYMBOL", raw)),
        }
    }
}

/// Latest quote for an instrument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub instrument: Instrument,
    /// Last traded price
    pub last_price: Decimal,
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    /// Session high/low when the venue reports them
    pub high: Option<Decimal>,
    pub low: Option<Decimal>,
    pub volume: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    pub fn from_last_price(instrument: Instrument, last_price: Decimal) -> Self {
        Self {
            instrument,
            last_price,
            best_bid: None,
            best_ask: None,
            high: None,
            low: None,
            volume: None,
            timestamp: Utc::now(),
        }
    }

    /// Get mid price, falling back to the last traded price
    pub fn mid_price(&self) -> Decimal {
        match (self.best_bid, self.best_ask) {
            (Some(bid), Some(ask)) => (bid + ask) / Decimal::TWO,
            _ => self.last_price,
        }
    }

    /// Quote age in whole seconds
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.timestamp).num_seconds()
    }
}

/// Streaming tick pushed by the broker subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub instrument: Instrument,
    pub last_price: Decimal,
    pub volume: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

/// OHLCV bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    /// Check OHLC consistency
    pub fn is_valid(&self) -> bool {
        self.low <= self.high
            && self.low <= self.open
            && self.low <= self.close
            && self.high >= self.open
            && self.high >= self.close
            && self.low > Decimal::ZERO
    }
}
