pub mod adapters;
pub mod broker;
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod persistence;
pub mod strategy;

pub use adapters::{PostgresStore, ReplayBroker};
pub use broker::{BrokerClient, BrokerResult};
pub use config::AppConfig;
pub use error::{BrokerError, Result, TradeCoreError};
pub use persistence::{MemoryStore, TradeStore};
pub use strategy::{
    BacktestConfig, BacktestEngine, BacktestResult, OrderManager, PerformanceAnalyzer,
    PerformanceReport, PositionTracker, RiskManager, StrategyExecutor, TradingContext,
};
