use thiserror::Error;

/// Main error type for the execution core
#[derive(Error, Debug)]
pub enum TradeCoreError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Execution venue errors
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    // Market data errors
    #[error("Market data unavailable: {0}")]
    MarketDataUnavailable(String),

    // Order execution errors
    #[error("Order rejected: {0}")]
    OrderRejected(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // Signal boundary errors
    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    // Risk management errors
    #[error("Risk limit exceeded: {0}")]
    RiskLimitExceeded(String),

    #[error("Trading halted: {0}")]
    TradingHalted(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for TradeCoreError
pub type Result<T> = std::result::Result<T, TradeCoreError>;

/// Errors a broker adapter must map its vendor-specific failures into.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("order rejected: {0}")]
    OrderRejected(String),

    #[error("data unavailable: {0}")]
    DataUnavailable(String),
}

impl BrokerError {
    /// Whether retrying the same call later could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::ConnectionFailed(_) | BrokerError::RateLimited(_)
        )
    }
}

/// Specific error types for order lifecycle
#[derive(Error, Debug, Clone)]
pub enum OrderError {
    #[error("Order not found: {order_id}")]
    NotFound { order_id: String },

    #[error("Order {order_id} is already {status}")]
    AlreadyTerminal { order_id: String, status: String },

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(u64),

    #[error("Price required for {order_type} order")]
    PriceRequired { order_type: String },
}

/// Specific error types for risk management
#[derive(Error, Debug, Clone)]
pub enum RiskError {
    #[error("Max positions reached: {open} >= {limit}")]
    MaxPositions { open: usize, limit: u32 },

    #[error("Position value {value} exceeds limit {limit}")]
    PositionTooLarge {
        value: rust_decimal::Decimal,
        limit: rust_decimal::Decimal,
    },

    #[error("Trading halted: {reason}")]
    TradingHalted { reason: String },
}

impl From<OrderError> for TradeCoreError {
    fn from(err: OrderError) -> Self {
        match err {
            OrderError::NotFound { order_id } => TradeCoreError::OrderNotFound(order_id),
            other => TradeCoreError::OrderRejected(other.to_string()),
        }
    }
}

impl From<RiskError> for TradeCoreError {
    fn from(err: RiskError) -> Self {
        match err {
            RiskError::TradingHalted { reason } => TradeCoreError::TradingHalted(reason),
            other => TradeCoreError::RiskLimitExceeded(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_errors_map_into_core_error() {
        let err: TradeCoreError = BrokerError::RateLimited("429".into()).into();
        assert!(matches!(err, TradeCoreError::Broker(BrokerError::RateLimited(_))));
        assert_eq!(err.to_string(), "Broker error: rate limited: 429");
    }

    #[test]
    fn transient_broker_errors() {
        assert!(BrokerError::ConnectionFailed("reset".into()).is_transient());
        assert!(BrokerError::RateLimited("slow down".into()).is_transient());
        assert!(!BrokerError::AuthenticationFailed("bad token".into()).is_transient());
        assert!(!BrokerError::OrderRejected("margin".into()).is_transient());
    }

    #[test]
    fn order_not_found_keeps_its_identity() {
        let err: TradeCoreError = OrderError::NotFound {
            order_id: "abc".into(),
        }
        .into();
        assert!(matches!(err, TradeCoreError::OrderNotFound(id) if id == "abc"));
    }
}
