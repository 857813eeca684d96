//! Configuration commands
//!
//! tradecore config check - Load and validate the layered configuration
//! tradecore config show  - Print the effective settings

use anyhow::{Context, Result};
use clap::Subcommand;
use std::path::Path;

use crate::config::AppConfig;

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Load and validate configuration, reporting every violation
    Check,

    /// Show the effective configuration after all layers
    Show,
}

impl ConfigCommands {
    pub fn run(self, config_dir: &Path) -> Result<()> {
        match self {
            Self::Check => check_config(config_dir),
            Self::Show => show_config(config_dir),
        }
    }
}

fn load(config_dir: &Path) -> Result<AppConfig> {
    AppConfig::load_from(config_dir)
        .with_context(|| format!("Failed to load configuration from {}", config_dir.display()))
}

fn check_config(config_dir: &Path) -> Result<()> {
    let config = load(config_dir)?;

    println!("\n  Validating configuration in {}...\n", config_dir.display());
    match config.validate() {
        Ok(()) => {
            println!("  \x1b[32m✓ Configuration valid\x1b[0m\n");
            Ok(())
        }
        Err(errors) => {
            for e in &errors {
                println!("  \x1b[31m✗ {}\x1b[0m", e);
            }
            println!();
            anyhow::bail!("{} configuration error(s)", errors.len())
        }
    }
}

fn show_config(config_dir: &Path) -> Result<()> {
    let config = load(config_dir)?;
    let t = &config.trading;
    let r = &config.risk;
    let c = &config.costs;

    println!("\n  [trading]");
    println!("  mode                    = {}", t.mode);
    println!("  symbols                 = {}", t.symbols.join(", "));
    println!("  strategy_name           = {}", t.strategy_name);
    println!("  scan_interval_seconds   = {}", t.scan_interval_seconds);
    println!("  stop_timeout_seconds    = {}", t.stop_timeout_seconds);
    println!("  quote_ttl_seconds       = {}", t.quote_ttl_seconds);

    println!("\n  [risk]");
    println!("  capital                 = {}", r.capital);
    println!("  max_risk_per_trade_pct  = {}", r.max_risk_per_trade_pct);
    println!("  max_position_size_pct   = {}", r.max_position_size_pct);
    println!("  max_daily_loss          = {}", r.max_daily_loss);
    println!("  max_daily_loss_pct      = {}", r.max_daily_loss_pct);
    println!("  max_positions           = {}", r.max_positions);
    println!("  max_drawdown_pct        = {}", r.max_drawdown_pct);
    println!("  risk_reward_ratio       = {}", r.risk_reward_ratio);
    println!("  default_stop_loss_pct   = {}", r.default_stop_loss_pct);

    println!("\n  [costs]");
    println!("  commission_per_trade    = {}", c.commission_per_trade);
    println!("  commission_pct          = {}", c.commission_pct);
    println!("  slippage_pct            = {}", c.slippage_pct);

    println!("\n  [database]");
    match &config.database {
        // Never echo credentials
        Some(db) => println!("  configured (max_connections = {})", db.max_connections),
        None => println!("  not configured, using in-memory store"),
    }
    println!();
    Ok(())
}
