use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::domain::{Order, Trade, TradingSession};
use crate::error::Result;
use crate::persistence::TradeStore;

/// PostgreSQL storage adapter
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TradeStore for PostgresStore {
    #[instrument(skip(self, order), fields(order_id = %order.id, status = %order.status))]
    async fn record_order(&self, order: &Order) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (
                order_id, exchange, symbol, side, quantity, order_type, price, trigger_price,
                product, validity, status, filled_quantity, average_price, tag, status_message,
                raw_response, created_at, modified_at, cancelled_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            ON CONFLICT (order_id) DO UPDATE SET
                quantity = EXCLUDED.quantity,
                order_type = EXCLUDED.order_type,
                price = EXCLUDED.price,
                trigger_price = EXCLUDED.trigger_price,
                status = EXCLUDED.status,
                filled_quantity = EXCLUDED.filled_quantity,
                average_price = EXCLUDED.average_price,
                status_message = EXCLUDED.status_message,
                raw_response = COALESCE(EXCLUDED.raw_response, orders.raw_response),
                modified_at = EXCLUDED.modified_at,
                cancelled_at = EXCLUDED.cancelled_at,
                completed_at = EXCLUDED.completed_at,
                updated_at = NOW()
            "#,
        )
        .bind(&order.id)
        .bind(&order.instrument.exchange)
        .bind(&order.instrument.symbol)
        .bind(order.side.to_string())
        .bind(order.quantity as i64)
        .bind(order.order_type.as_str())
        .bind(order.price)
        .bind(order.trigger_price)
        .bind(order.product.as_str())
        .bind(order.validity.as_str())
        .bind(order.status.as_str())
        .bind(order.filled_quantity as i64)
        .bind(order.average_price)
        .bind(&order.tag)
        .bind(&order.status_message)
        .bind(&order.raw_response)
        .bind(order.created_at)
        .bind(order.modified_at)
        .bind(order.cancelled_at)
        .bind(order.completed_at)
        .execute(&self.pool)
        .await?;

        debug!("order persisted");
        Ok(())
    }

    #[instrument(skip(self, trade), fields(symbol = %trade.instrument, reason = %trade.exit_reason))]
    async fn record_trade(&self, session_id: Option<Uuid>, trade: &Trade) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (
                session_id, exchange, symbol, side, entry_time, exit_time, entry_price,
                exit_price, quantity, stop_loss, target, pnl, pnl_pct, commission,
                exit_reason, status, strategy
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(session_id)
        .bind(&trade.instrument.exchange)
        .bind(&trade.instrument.symbol)
        .bind(trade.side.to_string())
        .bind(trade.entry_time)
        .bind(trade.exit_time)
        .bind(trade.entry_price)
        .bind(trade.exit_price)
        .bind(trade.quantity as i64)
        .bind(trade.stop_loss)
        .bind(trade.target)
        .bind(trade.pnl)
        .bind(trade.pnl_pct)
        .bind(trade.commission)
        .bind(trade.exit_reason.as_str())
        .bind("CLOSED")
        .bind(&trade.strategy)
        .execute(&self.pool)
        .await?;

        debug!(pnl = %trade.pnl, "trade persisted");
        Ok(())
    }

    #[instrument(skip(self, session), fields(session_id = %session.id))]
    async fn create_session(&self, session: &TradingSession) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trading_sessions (id, mode, strategy, started_at, starting_capital)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(session.id)
        .bind(session.mode.as_str())
        .bind(&session.strategy)
        .bind(session.started_at)
        .bind(session.starting_capital)
        .execute(&self.pool)
        .await?;

        info!(mode = %session.mode, "trading session created");
        Ok(())
    }

    #[instrument(skip(self, session), fields(session_id = %session.id))]
    async fn update_session(&self, session: &TradingSession) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE trading_sessions SET
                ended_at = $2,
                final_capital = $3,
                total_trades = $4,
                winning_trades = $5,
                losing_trades = $6,
                realized_pnl = $7,
                unrealized_pnl = $8,
                commission = $9,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(session.id)
        .bind(session.ended_at)
        .bind(session.final_capital)
        .bind(session.total_trades as i32)
        .bind(session.winning_trades as i32)
        .bind(session.losing_trades as i32)
        .bind(session.realized_pnl)
        .bind(session.unrealized_pnl)
        .bind(session.commission)
        .execute(&self.pool)
        .await?;

        debug!("trading session updated");
        Ok(())
    }
}
