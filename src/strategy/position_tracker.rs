//! Position Tracker
//!
//! Open-position bookkeeping keyed by `exchange:symbol`:
//! - same-side fills re-average the entry price
//! - opposite-side fills realize P&L (partial close, full close, or reversal)
//! - mark-to-market refresh reports stop-loss/target triggers, stop first
//!
//! [`PositionBook`] is the synchronous core shared with the backtest engine;
//! [`PositionTracker`] wraps it for the live executor.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::domain::{
    calculate_pnl, check_exit, ExitReason, Instrument, OrderSide, Position, PositionSide, Trade,
};
use crate::error::{Result, TradeCoreError};
use crate::persistence::TradeStore;
use crate::strategy::costs::CostModel;

/// An execution to book against the position table
#[derive(Debug, Clone)]
pub struct Fill {
    pub instrument: Instrument,
    pub side: OrderSide,
    pub quantity: u64,
    pub price: Decimal,
    /// Commission charged on this fill
    pub commission: Decimal,
    pub stop_loss: Option<Decimal>,
    pub target: Option<Decimal>,
    pub strategy: String,
    pub order_id: Option<String>,
    /// Reason recorded if this fill reduces or closes a position
    pub exit_reason: Option<ExitReason>,
    pub timestamp: DateTime<Utc>,
}

impl Fill {
    pub fn new(instrument: Instrument, side: OrderSide, quantity: u64, price: Decimal) -> Self {
        Self {
            instrument,
            side,
            quantity,
            price,
            commission: Decimal::ZERO,
            stop_loss: None,
            target: None,
            strategy: String::new(),
            order_id: None,
            exit_reason: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_levels(mut self, stop_loss: Option<Decimal>, target: Option<Decimal>) -> Self {
        self.stop_loss = stop_loss;
        self.target = target;
        self
    }

    pub fn with_commission(mut self, commission: Decimal) -> Self {
        self.commission = commission;
        self
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = strategy.into();
        self
    }

    pub fn with_order_id(mut self, order_id: impl Into<String>) -> Self {
        self.order_id = Some(order_id.into());
        self
    }

    pub fn with_exit_reason(mut self, reason: ExitReason) -> Self {
        self.exit_reason = Some(reason);
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// What a fill did to the book
#[derive(Debug, Clone, Default)]
pub struct FillOutcome {
    /// Net realized P&L, the sum of `trades[..].pnl`
    pub realized_pnl: Decimal,
    pub trades: Vec<Trade>,
    /// Position for the key after the fill
    pub position: Option<Position>,
}

/// Stop-loss or target crossed for an open position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitTrigger {
    pub key: String,
    pub instrument: Instrument,
    pub side: PositionSide,
    pub quantity: u64,
    pub reason: ExitReason,
    /// Stop or target level that was crossed
    pub level: Decimal,
    /// Price that crossed it
    pub mark: Decimal,
}

impl ExitTrigger {
    fn new(position: &Position, reason: ExitReason, level: Decimal, mark: Decimal) -> Self {
        Self {
            key: position.key(),
            instrument: position.instrument.clone(),
            side: position.side,
            quantity: position.quantity,
            reason,
            level,
            mark,
        }
    }
}

/// Part of `total` attributable to `part` out of `of` units
fn pro_rata(total: Decimal, part: u64, of: u64) -> Decimal {
    if of == 0 || part >= of {
        return total;
    }
    total * Decimal::from(part) / Decimal::from(of)
}

/// Synchronous position table. At most one position per key.
#[derive(Debug, Clone, Default)]
pub struct PositionBook {
    positions: BTreeMap<String, Position>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    fn open(fill: &Fill, quantity: u64, commission: Decimal) -> Position {
        let mut position = Position {
            instrument: fill.instrument.clone(),
            side: fill.side.position_side(),
            quantity,
            average_price: fill.price,
            mark_price: fill.price,
            stop_loss: fill.stop_loss,
            target: fill.target,
            unrealized_pnl: Decimal::ZERO,
            entry_commission: commission,
            opened_at: fill.timestamp,
            strategy: fill.strategy.clone(),
            order_id: fill.order_id.clone(),
        };
        position.mark(fill.price);
        position
    }

    fn realize(
        position: &Position,
        quantity: u64,
        exit_price: Decimal,
        exit_commission: Decimal,
        reason: ExitReason,
        at: DateTime<Utc>,
    ) -> Trade {
        let gross = calculate_pnl(position.side, position.average_price, exit_price, quantity);
        let commission = position.commission_share(quantity) + exit_commission;
        Trade::closed(
            position.instrument.clone(),
            position.side,
            position.opened_at,
            at,
            position.average_price,
            exit_price,
            quantity,
            position.stop_loss,
            position.target,
            gross,
            commission,
            reason,
            position.strategy.clone(),
        )
    }

    /// Book a fill: open, add, reduce, close or reverse
    pub fn apply_fill(&mut self, fill: Fill) -> FillOutcome {
        let key = fill.instrument.key();
        let incoming = fill.side.position_side();

        let Some(mut existing) = self.positions.remove(&key) else {
            let position = Self::open(&fill, fill.quantity, fill.commission);
            self.positions.insert(key, position.clone());
            return FillOutcome {
                position: Some(position),
                ..Default::default()
            };
        };

        if existing.side == incoming {
            let old_qty = Decimal::from(existing.quantity);
            let add_qty = Decimal::from(fill.quantity);
            existing.average_price =
                (existing.average_price * old_qty + fill.price * add_qty) / (old_qty + add_qty);
            existing.quantity += fill.quantity;
            existing.entry_commission += fill.commission;
            if fill.stop_loss.is_some() {
                existing.stop_loss = fill.stop_loss;
            }
            if fill.target.is_some() {
                existing.target = fill.target;
            }
            existing.mark(fill.price);
            self.positions.insert(key, existing.clone());
            return FillOutcome {
                position: Some(existing),
                ..Default::default()
            };
        }

        let reason = fill.exit_reason.unwrap_or(ExitReason::Signal);

        if fill.quantity >= existing.quantity {
            let closed_qty = existing.quantity;
            let exit_commission = pro_rata(fill.commission, closed_qty, fill.quantity);
            let trade = Self::realize(&existing, closed_qty, fill.price, exit_commission, reason, fill.timestamp);

            let remainder = fill.quantity - closed_qty;
            let position = (remainder > 0).then(|| {
                let reversed = Self::open(&fill, remainder, fill.commission - exit_commission);
                self.positions.insert(key, reversed.clone());
                reversed
            });

            return FillOutcome {
                realized_pnl: trade.pnl,
                trades: vec![trade],
                position,
            };
        }

        // Partial close: average price unchanged
        let trade = Self::realize(&existing, fill.quantity, fill.price, fill.commission, reason, fill.timestamp);
        existing.entry_commission -= existing.commission_share(fill.quantity);
        existing.quantity -= fill.quantity;
        existing.mark(fill.price);
        self.positions.insert(key, existing.clone());

        FillOutcome {
            realized_pnl: trade.pnl,
            trades: vec![trade],
            position: Some(existing),
        }
    }

    /// Re-mark positions and report exits, ordered by key
    pub fn refresh(&mut self, marks: &HashMap<String, Decimal>) -> Vec<ExitTrigger> {
        let mut triggers = Vec::new();
        for (key, position) in self.positions.iter_mut() {
            let Some(&mark) = marks.get(key) else {
                continue;
            };
            position.mark(mark);
            if let Some((reason, level)) = position.exit_at_mark(mark) {
                triggers.push(ExitTrigger::new(position, reason, level, mark));
            }
        }
        triggers
    }

    /// Evaluate a price range (one candle) against the position's levels
    pub fn check_range(&self, key: &str, low: Decimal, high: Decimal) -> Option<ExitTrigger> {
        let position = self.positions.get(key)?;
        let (reason, level) = check_exit(position.side, position.stop_loss, position.target, low, high)?;
        let mark = if reason == ExitReason::StopLoss && position.side == PositionSide::Long
            || reason == ExitReason::TargetHit && position.side == PositionSide::Short
        {
            low
        } else {
            high
        };
        Some(ExitTrigger::new(position, reason, level, mark))
    }

    pub fn mark(&mut self, key: &str, price: Decimal) -> bool {
        match self.positions.get_mut(key) {
            Some(position) => {
                position.mark(price);
                true
            }
            None => false,
        }
    }

    /// Close the whole position at `exit_price` (the mark when `None`)
    pub fn close(
        &mut self,
        key: &str,
        exit_price: Option<Decimal>,
        exit_commission: Decimal,
        reason: ExitReason,
        at: DateTime<Utc>,
    ) -> Option<Trade> {
        let position = self.positions.remove(key)?;
        let price = exit_price.unwrap_or(position.mark_price);
        Some(Self::realize(&position, position.quantity, price, exit_commission, reason, at))
    }

    pub fn update_levels(&mut self, key: &str, stop_loss: Option<Decimal>, target: Option<Decimal>) -> bool {
        match self.positions.get_mut(key) {
            Some(position) => {
                position.stop_loss = stop_loss;
                position.target = target;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Position> {
        self.positions.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.positions.contains_key(key)
    }

    pub fn positions(&self) -> Vec<Position> {
        self.positions.values().cloned().collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.positions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        self.positions.values().map(|p| p.unrealized_pnl).sum()
    }
}

/// Live position tracker
pub struct PositionTracker {
    book: Mutex<PositionBook>,
    costs: CostModel,
    store: Arc<dyn TradeStore>,
    session_id: RwLock<Option<Uuid>>,
}

impl PositionTracker {
    pub fn new(costs: CostModel, store: Arc<dyn TradeStore>) -> Self {
        Self {
            book: Mutex::new(PositionBook::new()),
            costs,
            store,
            session_id: RwLock::new(None),
        }
    }

    /// Session that closed trades are recorded against
    pub async fn set_session(&self, session_id: Option<Uuid>) {
        *self.session_id.write().await = session_id;
    }

    async fn persist(&self, trades: &[Trade]) {
        let session_id = *self.session_id.read().await;
        for trade in trades {
            if let Err(e) = self.store.record_trade(session_id, trade).await {
                error!(symbol = %trade.instrument, "Failed to persist trade: {}", e);
            }
        }
    }

    pub async fn add_fill(&self, fill: Fill) -> Result<FillOutcome> {
        if fill.quantity == 0 || fill.price <= Decimal::ZERO {
            return Err(TradeCoreError::Validation(format!(
                "fill for {} needs positive quantity and price",
                fill.instrument
            )));
        }

        let outcome = {
            let mut book = self.book.lock().await;
            debug!(
                symbol = %fill.instrument, side = %fill.side, qty = fill.quantity, price = %fill.price,
                "Applying fill"
            );
            book.apply_fill(fill)
        };

        for trade in &outcome.trades {
            info!(
                symbol = %trade.instrument, side = %trade.side, qty = trade.quantity,
                entry = %trade.entry_price, exit = %trade.exit_price, pnl = %trade.pnl,
                reason = %trade.exit_reason, "Position closed"
            );
        }
        self.persist(&outcome.trades).await;
        Ok(outcome)
    }

    pub async fn refresh(&self, marks: &HashMap<String, Decimal>) -> Vec<ExitTrigger> {
        self.book.lock().await.refresh(marks)
    }

    /// Close one position locally. Exit commission comes from the cost model.
    pub async fn close(
        &self,
        instrument: &Instrument,
        exit_price: Option<Decimal>,
        reason: ExitReason,
    ) -> Option<Trade> {
        let trade = {
            let mut book = self.book.lock().await;
            let key = instrument.key();
            let position = book.get(&key)?;
            let price = exit_price.unwrap_or(position.mark_price);
            let commission = self.costs.commission(price, position.quantity);
            book.close(&key, Some(price), commission, reason, Utc::now())?
        };

        info!(symbol = %instrument, pnl = %trade.pnl, reason = %reason, "Position closed");
        self.persist(std::slice::from_ref(&trade)).await;
        Some(trade)
    }

    /// Close everything, at the supplied marks where present
    pub async fn close_all(&self, marks: &HashMap<String, Decimal>, reason: ExitReason) -> Vec<Trade> {
        let trades: Vec<Trade> = {
            let mut book = self.book.lock().await;
            let now = Utc::now();
            book.keys()
                .into_iter()
                .filter_map(|key| {
                    let position = book.get(&key)?;
                    let price = marks.get(&key).copied().unwrap_or(position.mark_price);
                    let commission = self.costs.commission(price, position.quantity);
                    book.close(&key, Some(price), commission, reason, now)
                })
                .collect()
        };
        self.persist(&trades).await;
        trades
    }

    pub async fn update_levels(
        &self,
        instrument: &Instrument,
        stop_loss: Option<Decimal>,
        target: Option<Decimal>,
    ) -> bool {
        self.book
            .lock()
            .await
            .update_levels(&instrument.key(), stop_loss, target)
    }

    pub async fn get(&self, instrument: &Instrument) -> Option<Position> {
        self.book.lock().await.get(&instrument.key()).cloned()
    }

    pub async fn positions(&self) -> Vec<Position> {
        self.book.lock().await.positions()
    }

    pub async fn count(&self) -> usize {
        self.book.lock().await.len()
    }

    pub async fn unrealized_pnl(&self) -> Decimal {
        self.book.lock().await.unrealized_pnl()
    }
}
