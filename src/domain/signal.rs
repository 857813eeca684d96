use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::order::OrderSide;
use super::position::PositionSide;
use crate::error::{Result, TradeCoreError};

/// Price levels attached to an entry decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySignal {
    pub price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub target: Option<Decimal>,
    pub reason: String,
}

/// Decision returned by a signal source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "UPPERCASE")]
pub enum Signal {
    Buy(EntrySignal),
    Sell(EntrySignal),
    Close { reason: String },
}

impl Signal {
    pub fn buy(price: Decimal, stop_loss: Option<Decimal>, target: Option<Decimal>, reason: impl Into<String>) -> Self {
        Signal::Buy(EntrySignal {
            price,
            stop_loss,
            target,
            reason: reason.into(),
        })
    }

    pub fn sell(price: Decimal, stop_loss: Option<Decimal>, target: Option<Decimal>, reason: impl Into<String>) -> Self {
        Signal::Sell(EntrySignal {
            price,
            stop_loss,
            target,
            reason: reason.into(),
        })
    }

    pub fn close(reason: impl Into<String>) -> Self {
        Signal::Close {
            reason: reason.into(),
        }
    }

    /// Order side for entries; `None` for `Close`
    pub fn side(&self) -> Option<OrderSide> {
        match self {
            Signal::Buy(_) => Some(OrderSide::Buy),
            Signal::Sell(_) => Some(OrderSide::Sell),
            Signal::Close { .. } => None,
        }
    }

    pub fn entry(&self) -> Option<&EntrySignal> {
        match self {
            Signal::Buy(entry) | Signal::Sell(entry) => Some(entry),
            Signal::Close { .. } => None,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Signal::Buy(entry) | Signal::Sell(entry) => &entry.reason,
            Signal::Close { reason } => reason,
        }
    }
}

/// Loosely-typed signal as handed over by an external generator.
///
/// Converted into [`Signal`] at the boundary; invalid payloads never reach
/// the executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalPayload {
    pub action: String,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub target: Option<Decimal>,
    #[serde(default)]
    pub reason: Option<String>,
}

fn validate_levels(side: PositionSide, entry: &EntrySignal) -> Result<()> {
    if entry.price <= Decimal::ZERO {
        return Err(TradeCoreError::InvalidSignal(format!(
            "entry price must be positive, got {}",
            entry.price
        )));
    }

    let (stop_wrong_side, target_wrong_side) = match side {
        PositionSide::Long => (
            entry.stop_loss.map_or(false, |s| s >= entry.price),
            entry.target.map_or(false, |t| t <= entry.price),
        ),
        PositionSide::Short => (
            entry.stop_loss.map_or(false, |s| s <= entry.price),
            entry.target.map_or(false, |t| t >= entry.price),
        ),
    };

    if stop_wrong_side {
        return Err(TradeCoreError::InvalidSignal(format!(
            "{} stop {:?} on wrong side of entry {}",
            side, entry.stop_loss, entry.price
        )));
    }
    if target_wrong_side {
        return Err(TradeCoreError::InvalidSignal(format!(
            "{} target {:?} on wrong side of entry {}",
            side, entry.target, entry.price
        )));
    }
    Ok(())
}

impl Signal {
    /// Check price and level consistency for entries
    pub fn validate(&self) -> Result<()> {
        match self {
            Signal::Buy(entry) => validate_levels(PositionSide::Long, entry),
            Signal::Sell(entry) => validate_levels(PositionSide::Short, entry),
            Signal::Close { .. } => Ok(()),
        }
    }
}

impl TryFrom<SignalPayload> for Signal {
    type Error = TradeCoreError;

    fn try_from(payload: SignalPayload) -> Result<Self> {
        let reason = payload.reason.unwrap_or_default();
        let action = payload.action.trim().to_uppercase();

        let signal = match action.as_str() {
            "CLOSE" | "EXIT" => return Ok(Signal::Close { reason }),
            "BUY" | "SELL" => {
                let price = payload.price.ok_or_else(|| {
                    TradeCoreError::InvalidSignal(format!("{} signal without price", action))
                })?;
                let entry = EntrySignal {
                    price,
                    stop_loss: payload.stop_loss,
                    target: payload.target,
                    reason,
                };
                if action == "BUY" {
                    Signal::Buy(entry)
                } else {
                    Signal::Sell(entry)
                }
            }
            other => {
                return Err(TradeCoreError::InvalidSignal(format!(
                    "unknown action '{}'",
                    other
                )))
            }
        };

        signal.validate()?;
        Ok(signal)
    }
}
