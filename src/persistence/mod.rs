//! Persistence capability for orders, trades and trading sessions.
//!
//! The core only writes; reads are left to reporting tools working against
//! the backing store directly.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::{Order, Trade, TradingSession};
use crate::error::Result;

#[async_trait]
pub trait TradeStore: Send + Sync {
    /// Insert an order, or overwrite the stored row for the same id
    async fn record_order(&self, order: &Order) -> Result<()>;

    /// Append a closed trade
    async fn record_trade(&self, session_id: Option<Uuid>, trade: &Trade) -> Result<()>;

    async fn create_session(&self, session: &TradingSession) -> Result<()>;

    async fn update_session(&self, session: &TradingSession) -> Result<()>;
}
