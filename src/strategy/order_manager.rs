use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerClient, BrokerResult};
use crate::domain::{ModifyRequest, Order, OrderAck, OrderRequest, OrderStatus, OrderType, TradingMode};
use crate::error::{OrderError, Result, TradeCoreError};
use crate::persistence::TradeStore;
use crate::strategy::costs::CostModel;

#[derive(Default)]
struct OrderBook {
    /// Non-terminal orders
    active: HashMap<String, Order>,
    /// Terminal orders, immutable
    completed: HashMap<String, Order>,
}

impl OrderBook {
    fn insert(&mut self, order: Order) {
        if order.status.is_terminal() {
            self.active.remove(&order.id);
            self.completed.insert(order.id.clone(), order);
        } else {
            self.active.insert(order.id.clone(), order);
        }
    }

    fn lookup_active(&mut self, order_id: &str) -> std::result::Result<&mut Order, OrderError> {
        if let Some(order) = self.completed.get(order_id) {
            return Err(OrderError::AlreadyTerminal {
                order_id: order_id.to_string(),
                status: order.status.to_string(),
            });
        }
        self.active.get_mut(order_id).ok_or_else(|| OrderError::NotFound {
            order_id: order_id.to_string(),
        })
    }
}

/// Outcome of a best-effort cancel sweep
#[derive(Debug, Clone, Default)]
pub struct CancelSummary {
    pub cancelled: Vec<String>,
    /// Orders the venue executed, fully or in part, before the cancel landed
    pub filled: Vec<Order>,
    /// Order id and failure message
    pub failed: Vec<(String, String)>,
}

/// Fold a venue acknowledgement into the local order record
fn apply_ack(order: &mut Order, ack: &OrderAck) -> Result<()> {
    match ack.status {
        // Venue lagging behind the local record
        OrderStatus::Pending => {}
        OrderStatus::Complete => {
            if order.status != OrderStatus::Complete {
                let quantity = if ack.filled_quantity > 0 {
                    ack.filled_quantity
                } else {
                    order.quantity
                };
                let price = ack.average_price.or(order.price).ok_or_else(|| {
                    TradeCoreError::Internal(format!("order {} completed without a fill price", order.id))
                })?;
                order.fill(quantity, price)?;
            }
        }
        OrderStatus::Failed if order.status != OrderStatus::Pending => {
            order.transition(OrderStatus::Rejected)?;
        }
        OrderStatus::Cancelled => {
            order.transition(OrderStatus::Cancelled)?;
            // Partial execution ahead of the cancel
            if ack.filled_quantity > 0 {
                order.filled_quantity = ack.filled_quantity;
                order.average_price = ack.average_price.or(order.average_price);
            }
        }
        other => order.transition(other)?,
    }

    if ack.message.is_some() {
        order.status_message = ack.message.clone();
    }
    if ack.raw.is_some() {
        order.raw_response = ack.raw.clone();
    }
    Ok(())
}

/// Order lifecycle over a paper engine or a live broker.
///
/// The order book lock is held for the whole of each operation, broker
/// round-trip included, so placement and cancellation of the same id never
/// interleave.
pub struct OrderManager {
    mode: TradingMode,
    broker: Arc<dyn BrokerClient>,
    store: Arc<dyn TradeStore>,
    costs: CostModel,
    book: Mutex<OrderBook>,
}

impl OrderManager {
    pub fn new(
        mode: TradingMode,
        broker: Arc<dyn BrokerClient>,
        store: Arc<dyn TradeStore>,
        costs: CostModel,
    ) -> Self {
        Self {
            mode,
            broker,
            store,
            costs,
            book: Mutex::new(OrderBook::default()),
        }
    }

    pub fn mode(&self) -> TradingMode {
        self.mode
    }

    async fn persist(&self, order: &Order) {
        if let Err(e) = self.store.record_order(order).await {
            error!(order_id = %order.id, "Failed to persist order: {}", e);
        }
    }

    /// Place an order. Venue failures leave a FAILED record and return the error.
    pub async fn place(&self, request: &OrderRequest) -> Result<Order> {
        request.validate()?;
        let mut book = self.book.lock().await;

        let order = match self.mode {
            TradingMode::Paper => self.place_paper(request)?,
            TradingMode::Live => {
                let mut order = Order::from_request(Uuid::new_v4().to_string(), request);
                match self.broker.place_order(request).await {
                    Ok(ack) => {
                        order.id = ack.order_id.clone();
                        order.transition(OrderStatus::Placed)?;
                        apply_ack(&mut order, &ack)?;
                    }
                    Err(e) => {
                        warn!(
                            symbol = %request.instrument, side = %request.side, qty = request.quantity,
                            "Order placement failed: {}", e
                        );
                        order.transition(OrderStatus::Failed)?;
                        order.status_message = Some(e.to_string());
                        self.persist(&order).await;
                        book.insert(order);
                        return Err(e.into());
                    }
                }
                order
            }
        };

        info!(
            order_id = %order.id, symbol = %order.instrument, side = %order.side,
            qty = order.quantity, order_type = %order.order_type, status = %order.status,
            "Order placed"
        );
        self.persist(&order).await;
        book.insert(order.clone());
        Ok(order)
    }

    fn place_paper(&self, request: &OrderRequest) -> Result<Order> {
        let id = format!("PAPER-{}", Uuid::new_v4().simple());
        let mut order = Order::from_request(id, request);
        order.transition(OrderStatus::Placed)?;

        if request.order_type == OrderType::Market {
            let reference = request.price.ok_or_else(|| {
                TradeCoreError::OrderRejected("paper market order needs a reference price".into())
            })?;
            let fill_price = self.costs.apply_slippage(reference, request.side);
            order.fill(request.quantity, fill_price)?;
        } else {
            order.transition(OrderStatus::Open)?;
        }
        Ok(order)
    }

    /// Modify a working order
    pub async fn modify(&self, order_id: &str, modify: &ModifyRequest) -> Result<Order> {
        if modify.is_empty() {
            return Err(TradeCoreError::Validation("empty modification".into()));
        }
        let mut book = self.book.lock().await;
        let order = book.lookup_active(order_id)?;

        let ack = match self.mode {
            TradingMode::Live => Some(self.broker.modify_order(order_id, modify).await?),
            TradingMode::Paper => None,
        };
        order.apply_modification(modify)?;
        if let Some(ack) = ack {
            apply_ack(order, &ack)?;
        }

        let updated = order.clone();
        info!(order_id, "Order modified");
        self.persist(&updated).await;
        book.insert(updated.clone());
        Ok(updated)
    }

    /// Cancel a working order.
    ///
    /// Live venues may answer with the order's real end state. A COMPLETE or
    /// REJECTED ack is recorded as such and returned, so callers must check
    /// the status rather than assume CANCELLED.
    pub async fn cancel(&self, order_id: &str) -> Result<Order> {
        let mut book = self.book.lock().await;
        let order = book.lookup_active(order_id)?;

        match self.mode {
            TradingMode::Live => {
                let ack = self.broker.cancel_order(order_id).await?;
                apply_ack(order, &ack)?;
            }
            TradingMode::Paper => order.transition(OrderStatus::Cancelled)?,
        }

        let updated = order.clone();
        if updated.status == OrderStatus::Cancelled {
            info!(order_id, filled = updated.filled_quantity, "Order cancelled");
        } else {
            warn!(order_id, status = %updated.status, "Cancel acknowledged with another status");
        }
        self.persist(&updated).await;
        book.insert(updated.clone());
        Ok(updated)
    }

    /// Current state of an order, refreshed from the venue when live and active
    pub async fn get_status(&self, order_id: &str) -> Result<Order> {
        let mut book = self.book.lock().await;
        if let Some(order) = book.completed.get(order_id) {
            return Ok(order.clone());
        }
        let order = book.active.get_mut(order_id).ok_or_else(|| OrderError::NotFound {
            order_id: order_id.to_string(),
        })?;

        if self.mode.is_live() {
            let before = order.status;
            let ack = self.fetch_status(order_id).await?;
            apply_ack(order, &ack)?;
            if order.status != before {
                let updated = order.clone();
                self.persist(&updated).await;
                book.insert(updated.clone());
                return Ok(updated);
            }
        }
        Ok(order.clone())
    }

    /// Cancel every working order, continuing past individual failures
    pub async fn cancel_all(&self) -> CancelSummary {
        let ids: Vec<String> = self.book.lock().await.active.keys().cloned().collect();
        let mut summary = CancelSummary::default();

        for id in ids {
            match self.cancel(&id).await {
                Ok(order) if order.has_execution() => summary.filled.push(order),
                Ok(order) if order.status == OrderStatus::Cancelled => summary.cancelled.push(id),
                Ok(order) => {
                    let message = format!("order ended {}", order.status);
                    summary.failed.push((id, message));
                }
                Err(e) => {
                    error!(order_id = %id, "Cancel failed: {}", e);
                    summary.failed.push((id, e.to_string()));
                }
            }
        }
        summary
    }

    /// Venue status query, retried once when the failure is transient
    async fn fetch_status(&self, order_id: &str) -> BrokerResult<OrderAck> {
        match self.broker.get_order_status(order_id).await {
            Err(e) if e.is_transient() => {
                debug!(order_id, "Transient status failure, retrying: {}", e);
                self.broker.get_order_status(order_id).await
            }
            other => other,
        }
    }

    /// Poll every non-terminal order and return those that reached a terminal state
    pub async fn update_statuses(&self) -> Vec<Order> {
        if !self.mode.is_live() {
            return Vec::new();
        }

        let mut book = self.book.lock().await;
        let ids: Vec<String> = book.active.keys().cloned().collect();
        let mut finished = Vec::new();

        for id in ids {
            let ack = match self.fetch_status(&id).await {
                Ok(ack) => ack,
                Err(e) => {
                    warn!(order_id = %id, "Status poll failed: {}", e);
                    continue;
                }
            };
            let Some(order) = book.active.get_mut(&id) else {
                continue;
            };
            let before = order.status;
            if let Err(e) = apply_ack(order, &ack) {
                warn!(order_id = %id, "Ignoring status update: {}", e);
                continue;
            }
            if order.status == before {
                continue;
            }

            let updated = order.clone();
            self.persist(&updated).await;
            if updated.status.is_terminal() {
                debug!(order_id = %id, status = %updated.status, "Order reached terminal state");
                finished.push(updated.clone());
            }
            book.insert(updated);
        }

        if !finished.is_empty() {
            info!(count = finished.len(), at = %Utc::now(), "Order statuses advanced");
        }
        finished
    }

    pub async fn order(&self, order_id: &str) -> Option<Order> {
        let book = self.book.lock().await;
        book.active
            .get(order_id)
            .or_else(|| book.completed.get(order_id))
            .cloned()
    }

    pub async fn active_orders(&self) -> Vec<Order> {
        self.book.lock().await.active.values().cloned().collect()
    }

    pub async fn completed_orders(&self) -> Vec<Order> {
        self.book.lock().await.completed.values().cloned().collect()
    }

    pub async fn pending_count(&self) -> usize {
        self.book.lock().await.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockBrokerClient;
    use crate::domain::{Instrument, OrderSide};
    use crate::error::BrokerError;
    use crate::persistence::MemoryStore;
    use rust_decimal_macros::dec;

    fn market(side: OrderSide) -> OrderRequest {
        OrderRequest::market(Instrument::new("NSE", "SBIN"), side, 10, dec!(600))
    }

    fn ack(id: &str, status: OrderStatus, avg: Option<rust_decimal::Decimal>) -> OrderAck {
        OrderAck {
            order_id: id.to_string(),
            status,
            filled_quantity: if status == OrderStatus::Complete { 10 } else { 0 },
            average_price: avg,
            message: None,
            raw: Some(serde_json::json!({ "order_id": id })),
        }
    }

    fn manager(mode: TradingMode, broker: MockBrokerClient) -> (OrderManager, MemoryStore) {
        let store = MemoryStore::new();
        let costs = CostModel::new(dec!(0), dec!(0), dec!(0.1));
        (
            OrderManager::new(mode, Arc::new(broker), Arc::new(store.clone()), costs),
            store,
        )
    }

    #[tokio::test]
    async fn test_paper_market_order_completes_with_slippage() {
        let (orders, store) = manager(TradingMode::Paper, MockBrokerClient::new());

        let order = orders.place(&market(OrderSide::Buy)).await.unwrap();
        assert!(order.id.starts_with("PAPER-"));
        assert_eq!(order.status, OrderStatus::Complete);
        assert_eq!(order.average_price, Some(dec!(600.6)));
        assert_eq!(orders.pending_count().await, 0);
        assert_eq!(store.order(&order.id).await.unwrap().status, OrderStatus::Complete);
    }

    #[tokio::test]
    async fn test_paper_limit_order_rests_until_cancelled() {
        let (orders, _store) = manager(TradingMode::Paper, MockBrokerClient::new());
        let request = OrderRequest::limit(Instrument::new("NSE", "SBIN"), OrderSide::Buy, 10, dec!(590));

        let order = orders.place(&request).await.unwrap();
        assert_eq!(order.status, OrderStatus::Open);

        let modified = orders
            .modify(&order.id, &ModifyRequest { price: Some(dec!(592)), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(modified.price, Some(dec!(592)));

        let cancelled = orders.cancel(&order.id).await.unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert!(cancelled.cancelled_at.is_some());

        // Terminal orders cannot be touched again
        assert!(orders.cancel(&order.id).await.is_err());
        assert!(orders.modify(&order.id, &ModifyRequest { quantity: Some(1), ..Default::default() }).await.is_err());
        assert!(matches!(orders.cancel("nope").await, Err(TradeCoreError::OrderNotFound(_))));
    }

    #[tokio::test]
    async fn test_live_order_uses_venue_status() {
        let mut broker = MockBrokerClient::new();
        broker
            .expect_place_order()
            .times(1)
            .returning(|_| Ok(ack("V-1", OrderStatus::Complete, Some(dec!(601)))));
        let (orders, _store) = manager(TradingMode::Live, broker);

        let order = orders.place(&market(OrderSide::Buy)).await.unwrap();
        assert_eq!(order.id, "V-1");
        assert_eq!(order.status, OrderStatus::Complete);
        assert_eq!(order.average_price, Some(dec!(601)));
        assert!(order.raw_response.is_some());
    }

    #[tokio::test]
    async fn test_live_placement_failure_leaves_failed_record() {
        let mut broker = MockBrokerClient::new();
        broker
            .expect_place_order()
            .returning(|_| Err(BrokerError::RateLimited("429".into())));
        let (orders, store) = manager(TradingMode::Live, broker);

        let err = orders.place(&market(OrderSide::Sell)).await.unwrap_err();
        assert!(matches!(err, TradeCoreError::Broker(BrokerError::RateLimited(_))));

        let stored = store.orders().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, OrderStatus::Failed);
        assert_eq!(orders.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_update_statuses_moves_completed_orders() {
        let mut broker = MockBrokerClient::new();
        broker
            .expect_place_order()
            .returning(|_| Ok(ack("V-2", OrderStatus::Open, None)));
        broker
            .expect_get_order_status()
            .returning(|id| Ok(ack(id, OrderStatus::Complete, Some(dec!(599.5)))));
        let (orders, _store) = manager(TradingMode::Live, broker);

        let placed = orders.place(&market(OrderSide::Buy)).await.unwrap();
        assert_eq!(placed.status, OrderStatus::Open);
        assert_eq!(orders.pending_count().await, 1);

        let finished = orders.update_statuses().await;
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].average_price, Some(dec!(599.5)));
        assert_eq!(orders.pending_count().await, 0);
        assert_eq!(orders.completed_orders().await.len(), 1);

        // Nothing left to poll
        assert!(orders.update_statuses().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_all_is_best_effort() {
        let mut broker = MockBrokerClient::new();
        let mut seq = 0;
        broker.expect_place_order().returning(move |_| {
            seq += 1;
            Ok(ack(&format!("V-{}", seq), OrderStatus::Open, None))
        });
        broker.expect_cancel_order().returning(|id| {
            if id == "V-1" {
                Err(BrokerError::ConnectionFailed("reset".into()))
            } else {
                Ok(ack(id, OrderStatus::Cancelled, None))
            }
        });
        let (orders, _store) = manager(TradingMode::Live, broker);

        orders.place(&market(OrderSide::Buy)).await.unwrap();
        orders.place(&market(OrderSide::Buy)).await.unwrap();

        let summary = orders.cancel_all().await;
        assert_eq!(summary.cancelled, vec!["V-2".to_string()]);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, "V-1");
        assert_eq!(orders.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_cancel_ack_keeps_venue_outcome() {
        let mut broker = MockBrokerClient::new();
        let mut seq = 0;
        broker.expect_place_order().returning(move |_| {
            seq += 1;
            Ok(ack(&format!("V-{}", seq), OrderStatus::Open, None))
        });
        broker.expect_cancel_order().returning(|id| match id {
            // Filled before the cancel reached the venue
            "V-1" => Ok(ack(id, OrderStatus::Complete, Some(dec!(601)))),
            "V-2" => Ok(ack(id, OrderStatus::Cancelled, None)),
            "V-3" => Ok(ack(id, OrderStatus::Rejected, None)),
            _ => Ok(OrderAck {
                filled_quantity: 4,
                average_price: Some(dec!(600.5)),
                ..ack(id, OrderStatus::Cancelled, None)
            }),
        });
        let (orders, store) = manager(TradingMode::Live, broker);
        for _ in 0..4 {
            orders.place(&market(OrderSide::Buy)).await.unwrap();
        }

        let single = orders.cancel("V-1").await.unwrap();
        assert_eq!(single.status, OrderStatus::Complete);
        assert_eq!(single.filled_quantity, 10);
        assert_eq!(single.average_price, Some(dec!(601)));
        assert_eq!(store.order("V-1").await.unwrap().status, OrderStatus::Complete);

        let summary = orders.cancel_all().await;
        assert_eq!(summary.cancelled, vec!["V-2".to_string()]);
        assert_eq!(summary.failed, vec![("V-3".to_string(), "order ended REJECTED".to_string())]);
        assert_eq!(summary.filled.len(), 1);
        let partial = &summary.filled[0];
        assert_eq!(partial.id, "V-4");
        assert_eq!(partial.status, OrderStatus::Cancelled);
        assert_eq!(partial.filled_quantity, 4);
        assert_eq!(partial.average_price, Some(dec!(600.5)));
        assert_eq!(orders.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_status_poll_retries_transient_failures_only() {
        let mut broker = MockBrokerClient::new();
        let mut seq = 0;
        broker.expect_place_order().returning(move |_| {
            seq += 1;
            Ok(ack(&format!("V-{}", seq), OrderStatus::Open, None))
        });
        let mut calls = 0;
        broker.expect_get_order_status().times(3).returning(move |id| {
            calls += 1;
            match (id, calls) {
                ("V-1", 1) => Err(BrokerError::RateLimited("429".into())),
                ("V-1", _) => Ok(ack(id, OrderStatus::Complete, Some(dec!(600)))),
                _ => Err(BrokerError::DataUnavailable("unknown order".into())),
            }
        });
        let (orders, _store) = manager(TradingMode::Live, broker);
        orders.place(&market(OrderSide::Buy)).await.unwrap();

        let finished = orders.update_statuses().await;
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].id, "V-1");

        // Permanent failures are not retried
        orders.place(&market(OrderSide::Buy)).await.unwrap();
        assert!(orders.update_statuses().await.is_empty());
        assert_eq!(orders.pending_count().await, 1);
    }
}
