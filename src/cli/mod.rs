//! tradecore CLI
//!
//! Commands:
//! - `tradecore run` - Drive the executor against replayed candles
//! - `tradecore backtest` - Backtest the moving-average rule on a CSV file
//! - `tradecore config` - Configuration checks

pub mod backtest;
pub mod config;
pub mod runtime;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Trading execution core
#[derive(Parser, Debug)]
#[command(name = "tradecore")]
#[command(author, version, about = "Risk-gated trading execution core")]
pub struct Cli {
    /// Directory holding default.toml and per-environment overrides
    #[arg(long, global = true, env = "TRADECORE_CONFIG_DIR", default_value = "config")]
    pub config_dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the strategy executor against a replay broker
    Run(runtime::RunArgs),

    /// Backtest the moving-average crossover on historical candles
    Backtest(backtest::BacktestArgs),

    /// Configuration management
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

/// Moving-average rule parameters shared by `run` and `backtest`
#[derive(clap::Args, Debug, Clone)]
pub struct RuleArgs {
    /// Fast moving-average window
    #[arg(long, default_value = "5")]
    pub fast: usize,

    /// Slow moving-average window
    #[arg(long, default_value = "20")]
    pub slow: usize,

    /// Close longs on a bearish cross instead of going short
    #[arg(long)]
    pub long_only: bool,
}

impl RuleArgs {
    pub fn build(
        &self,
        risk: &crate::config::RiskConfig,
    ) -> crate::error::Result<crate::strategy::MovingAverageCrossover> {
        let rule = crate::strategy::MovingAverageCrossover::new(
            self.fast,
            self.slow,
            risk.default_stop_loss_pct,
            risk.risk_reward_ratio,
        )?;
        Ok(if self.long_only { rule.long_only() } else { rule })
    }
}
