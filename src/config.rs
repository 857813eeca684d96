use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;

use crate::domain::{Instrument, TradingMode};
use crate::strategy::costs::CostModel;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub trading: TradingConfig,
    pub risk: RiskConfig,
    #[serde(default)]
    pub costs: CostConfig,
    /// PostgreSQL persistence; in-memory store when absent
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradingConfig {
    /// Paper or live execution
    #[serde(default)]
    pub mode: TradingMode,
    /// Seconds between control-loop iterations
    #[serde(default = "default_scan_interval")]
    pub scan_interval_seconds: u64,
    /// Instruments to scan, as `EXCHANGE:SYMBOL`
    #[serde(default)]
    pub symbols: Vec<String>,
    /// Tag stamped on orders and positions
    #[serde(default = "default_strategy_name")]
    pub strategy_name: String,
    /// Upper bound on how long `stop()` waits for the loop to finish
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_seconds: u64,
    /// Quotes older than this are refetched from the broker
    #[serde(default = "default_quote_ttl")]
    pub quote_ttl_seconds: i64,
}

fn default_scan_interval() -> u64 {
    5
}

fn default_strategy_name() -> String {
    "default".to_string()
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_quote_ttl() -> i64 {
    30
}

impl TradingConfig {
    /// Parse the configured symbol list
    pub fn instruments(&self) -> Result<Vec<Instrument>, String> {
        self.symbols.iter().map(|s| s.parse::<Instrument>()).collect()
    }
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            mode: TradingMode::Paper,
            scan_interval_seconds: default_scan_interval(),
            symbols: Vec::new(),
            strategy_name: default_strategy_name(),
            stop_timeout_seconds: default_stop_timeout(),
            quote_ttl_seconds: default_quote_ttl(),
        }
    }
}

/// Risk limits. Percentages are in percent units (1.0 = 1%).
#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Starting capital
    pub capital: Decimal,
    /// Capital put at risk per trade
    pub max_risk_per_trade_pct: Decimal,
    /// Largest single position as a share of capital
    pub max_position_size_pct: Decimal,
    /// Absolute daily loss that halts trading
    pub max_daily_loss: Decimal,
    /// Daily loss as a share of day-open capital that halts trading
    pub max_daily_loss_pct: Decimal,
    /// Concurrent open positions
    pub max_positions: u32,
    /// Peak-to-current decline that halts trading
    pub max_drawdown_pct: Decimal,
    /// Target distance as a multiple of stop distance
    #[serde(default = "default_risk_reward")]
    pub risk_reward_ratio: Decimal,
    /// Stop distance used when a signal carries no stop
    #[serde(default = "default_stop_loss_pct")]
    pub default_stop_loss_pct: Decimal,
}

fn default_risk_reward() -> Decimal {
    Decimal::TWO
}

fn default_stop_loss_pct() -> Decimal {
    Decimal::ONE
}

impl Default for RiskConfig {
    fn default() -> Self {
        use rust_decimal_macros::dec;

        Self {
            capital: dec!(100000),
            max_risk_per_trade_pct: dec!(1),
            max_position_size_pct: dec!(50),
            max_daily_loss: dec!(5000),
            max_daily_loss_pct: dec!(5),
            max_positions: 5,
            max_drawdown_pct: dec!(15),
            risk_reward_ratio: default_risk_reward(),
            default_stop_loss_pct: default_stop_loss_pct(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CostConfig {
    /// Flat commission charged on every fill
    #[serde(default)]
    pub commission_per_trade: Decimal,
    /// Commission as percent of fill notional
    #[serde(default)]
    pub commission_pct: Decimal,
    /// Adverse slippage applied to simulated fills, percent of price
    #[serde(default)]
    pub slippage_pct: Decimal,
}

impl CostConfig {
    pub fn cost_model(&self) -> CostModel {
        CostModel::new(
            self.commission_per_trade,
            self.commission_pct,
            self.slippage_pct,
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for daily-rolling log files
    #[serde(default)]
    pub dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let defaults = RiskConfig::default();

        let builder = Config::builder()
            .set_default("trading.mode", "paper")?
            .set_default("trading.scan_interval_seconds", 5)?
            .set_default("risk.capital", defaults.capital.to_string())?
            .set_default(
                "risk.max_risk_per_trade_pct",
                defaults.max_risk_per_trade_pct.to_string(),
            )?
            .set_default(
                "risk.max_position_size_pct",
                defaults.max_position_size_pct.to_string(),
            )?
            .set_default("risk.max_daily_loss", defaults.max_daily_loss.to_string())?
            .set_default(
                "risk.max_daily_loss_pct",
                defaults.max_daily_loss_pct.to_string(),
            )?
            .set_default("risk.max_positions", i64::from(defaults.max_positions))?
            .set_default("risk.max_drawdown_pct", defaults.max_drawdown_pct.to_string())?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("TRADECORE_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (TRADECORE__RISK__CAPITAL, etc.)
            .add_source(
                Environment::with_prefix("TRADECORE")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Create a default configuration for CLI usage
    pub fn default_config(mode: TradingMode, symbols: Vec<String>) -> Self {
        Self {
            trading: TradingConfig {
                mode,
                symbols,
                ..TradingConfig::default()
            },
            risk: RiskConfig::default(),
            costs: CostConfig::default(),
            database: None,
            logging: LoggingConfig::default(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let hundred = Decimal::ONE_HUNDRED;

        if self.risk.capital <= Decimal::ZERO {
            errors.push("capital must be positive".to_string());
        }

        let pct_fields = [
            ("max_risk_per_trade_pct", self.risk.max_risk_per_trade_pct),
            ("max_position_size_pct", self.risk.max_position_size_pct),
            ("max_daily_loss_pct", self.risk.max_daily_loss_pct),
            ("max_drawdown_pct", self.risk.max_drawdown_pct),
        ];
        for (name, value) in pct_fields {
            if value <= Decimal::ZERO || value > hundred {
                errors.push(format!("{name} must be in (0, 100], got {value}"));
            }
        }

        if self.risk.max_daily_loss <= Decimal::ZERO {
            errors.push("max_daily_loss must be positive".to_string());
        }

        if self.risk.max_positions == 0 {
            errors.push("max_positions must be at least 1".to_string());
        }

        if self.risk.risk_reward_ratio <= Decimal::ZERO {
            errors.push("risk_reward_ratio must be positive".to_string());
        }

        if self.risk.default_stop_loss_pct <= Decimal::ZERO
            || self.risk.default_stop_loss_pct >= hundred
        {
            errors.push("default_stop_loss_pct must be in (0, 100)".to_string());
        }

        if self.trading.scan_interval_seconds == 0 {
            errors.push("scan_interval_seconds must be at least 1".to_string());
        }

        if let Err(e) = self.trading.instruments() {
            errors.push(e);
        }

        if self.costs.commission_per_trade < Decimal::ZERO
            || self.costs.commission_pct < Decimal::ZERO
            || self.costs.slippage_pct < Decimal::ZERO
        {
            errors.push("commission and slippage must not be negative".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default_config(TradingMode::Paper, vec!["NSE:RELIANCE".into()]);
        assert!(config.validate().is_ok());
        assert_eq!(config.trading.instruments().unwrap().len(), 1);
    }

    #[test]
    fn test_validate_collects_every_violation() {
        let mut config = AppConfig::default_config(TradingMode::Paper, vec!["bad".into()]);
        config.risk.capital = dec!(0);
        config.risk.max_drawdown_pct = dec!(150);
        config.risk.max_positions = 0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("capital")));
        assert!(errors.iter().any(|e| e.contains("max_drawdown_pct")));
        assert!(errors.iter().any(|e| e.contains("max_positions")));
        assert!(errors.iter().any(|e| e.contains("bad")));
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("default.toml"),
            r#"
[trading]
mode = "live"
scan_interval_seconds = 3
symbols = ["NSE:INFY", "NSE:TCS"]

[risk]
capital = "250000"
max_risk_per_trade_pct = "0.5"
max_position_size_pct = "25"
max_daily_loss = "4000"
max_daily_loss_pct = "2"
max_positions = 3
max_drawdown_pct = "10"

[costs]
commission_per_trade = "20"
slippage_pct = "0.05"
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(dir.path()).unwrap();
        assert_eq!(config.trading.mode, TradingMode::Live);
        assert_eq!(config.trading.scan_interval_seconds, 3);
        assert_eq!(config.risk.capital, dec!(250000));
        assert_eq!(config.risk.max_risk_per_trade_pct, dec!(0.5));
        assert_eq!(config.risk.max_positions, 3);
        assert_eq!(config.costs.commission_per_trade, dec!(20));
        assert_eq!(config.risk.risk_reward_ratio, dec!(2));
        assert!(config.database.is_none());
        assert!(config.validate().is_ok());
    }
}
