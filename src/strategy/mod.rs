//! Trading core
//!
//! Risk admission, order lifecycle, position accounting and the loops that
//! drive them.
//!
//! ## Architecture
//!
//! - `risk` / `order_manager` / `position_tracker` - live components, each
//!   behind its own lock
//! - `executor` - the scan loop wiring them to a broker and a signal source
//! - `backtest` - replays candles through the same sizing and position book
//! - `performance` - read-only analysis over closed trades

pub mod backtest;
pub mod costs;
pub mod executor;
pub mod market_data;
pub mod order_manager;
pub mod performance;
pub mod position_tracker;
pub mod risk;
pub mod signal;

pub use backtest::{load_candles_csv, BacktestConfig, BacktestEngine, BacktestResult, EquityPoint};
pub use costs::CostModel;
pub use executor::{
    EmergencyStopReport, ExecutorConfig, ExecutorStatus, IterationSummary, StrategyExecutor,
    TradingContext,
};
pub use market_data::{MarketDataFeed, QuoteCache};
pub use order_manager::{CancelSummary, OrderManager};
pub use performance::{PerformanceAnalyzer, PerformanceReport};
pub use position_tracker::{Fill, FillOutcome, PositionBook, PositionTracker};
pub use risk::{Admission, PositionSize, PositionSizer, RiskManager, RiskState};
pub use signal::{MarketView, MovingAverageCrossover, SignalSource};
