use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::TradeStore;
use crate::domain::{Order, Trade, TradingSession};
use crate::error::Result;

#[derive(Default)]
struct Tables {
    orders: HashMap<String, Order>,
    trades: Vec<(Option<Uuid>, Trade)>,
    sessions: HashMap<Uuid, TradingSession>,
}

/// In-process store used for paper runs, backtests and tests
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn order(&self, order_id: &str) -> Option<Order> {
        self.tables.read().await.orders.get(order_id).cloned()
    }

    pub async fn orders(&self) -> Vec<Order> {
        let tables = self.tables.read().await;
        let mut orders: Vec<Order> = tables.orders.values().cloned().collect();
        orders.sort_by_key(|o| o.created_at);
        orders
    }

    pub async fn trades(&self) -> Vec<Trade> {
        self.tables
            .read()
            .await
            .trades
            .iter()
            .map(|(_, t)| t.clone())
            .collect()
    }

    pub async fn session(&self, id: Uuid) -> Option<TradingSession> {
        self.tables.read().await.sessions.get(&id).cloned()
    }

    pub async fn sessions(&self) -> Vec<TradingSession> {
        self.tables.read().await.sessions.values().cloned().collect()
    }
}

#[async_trait]
impl TradeStore for MemoryStore {
    async fn record_order(&self, order: &Order) -> Result<()> {
        self.tables
            .write()
            .await
            .orders
            .insert(order.id.clone(), order.clone());
        Ok(())
    }

    async fn record_trade(&self, session_id: Option<Uuid>, trade: &Trade) -> Result<()> {
        self.tables
            .write()
            .await
            .trades
            .push((session_id, trade.clone()));
        Ok(())
    }

    async fn create_session(&self, session: &TradingSession) -> Result<()> {
        self.tables
            .write()
            .await
            .sessions
            .insert(session.id, session.clone());
        Ok(())
    }

    async fn update_session(&self, session: &TradingSession) -> Result<()> {
        self.create_session(session).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Instrument, OrderRequest, OrderSide, OrderStatus, TradingMode};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_order_upsert_keeps_latest_status() {
        let store = MemoryStore::new();
        let request = OrderRequest::market(Instrument::new("NSE", "SBIN"), OrderSide::Buy, 5, dec!(600));
        let mut order = Order::from_request("o-1", &request);

        store.record_order(&order).await.unwrap();
        order.transition(OrderStatus::Placed).unwrap();
        store.record_order(&order).await.unwrap();

        let orders = store.orders().await;
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, OrderStatus::Placed);
    }

    #[tokio::test]
    async fn test_session_update_overwrites() {
        let store = MemoryStore::new();
        let mut session = TradingSession::new(TradingMode::Paper, "test", dec!(1000));
        store.create_session(&session).await.unwrap();

        session.finalize(dec!(1100), dec!(0));
        store.update_session(&session).await.unwrap();

        let stored = store.session(session.id).await.unwrap();
        assert_eq!(stored.final_capital, Some(dec!(1100)));
    }
}
