//! `tradecore run` - the live executor driven by a replay broker

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

use super::RuleArgs;
use crate::adapters::{PostgresStore, ReplayBroker};
use crate::broker::BrokerClient;
use crate::config::AppConfig;
use crate::domain::{Instrument, TradingMode};
use crate::persistence::{MemoryStore, TradeStore};
use crate::strategy::{
    load_candles_csv, ExecutorConfig, PerformanceAnalyzer, SignalSource, StrategyExecutor,
    TradingContext,
};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Candle data to replay, as EXCHANGE:SYMBOL=PATH (repeatable)
    #[arg(short, long = "replay", value_parser = parse_replay, required = true)]
    pub replays: Vec<(Instrument, PathBuf)>,

    /// Override trading.mode (paper|live)
    #[arg(short, long)]
    pub mode: Option<TradingMode>,

    /// Delay between replayed candles in milliseconds (defaults to the scan interval)
    #[arg(long)]
    pub tick_ms: Option<u64>,

    /// Flatten all positions through the emergency stop when the run ends
    #[arg(long)]
    pub flatten: bool,

    #[command(flatten)]
    pub rule: RuleArgs,
}

fn parse_replay(raw: &str) -> std::result::Result<(Instrument, PathBuf), String> {
    let (symbol, path) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected EXCHANGE:SYMBOL=PATH, got '{}'", raw))?;
    let instrument = symbol.parse::<Instrument>()?;
    if path.is_empty() {
        return Err(format!("missing data path for {}", instrument));
    }
    Ok((instrument, PathBuf::from(path)))
}

/// PostgreSQL when configured, otherwise an in-memory store
async fn open_store(config: &AppConfig) -> Result<(Arc<dyn TradeStore>, Option<MemoryStore>)> {
    match &config.database {
        Some(db) => {
            let store = PostgresStore::new(&db.url, db.max_connections)
                .await
                .context("Failed to connect to database")?;
            store.migrate().await.context("Failed to run migrations")?;
            info!("Using PostgreSQL persistence");
            let store: Arc<dyn TradeStore> = Arc::new(store);
            Ok((store, None))
        }
        None => {
            info!("No database configured, using in-memory store");
            let memory = MemoryStore::new();
            let store: Arc<dyn TradeStore> = Arc::new(memory.clone());
            Ok((store, Some(memory)))
        }
    }
}

pub async fn run(args: RunArgs, mut config: AppConfig) -> Result<()> {
    if let Some(mode) = args.mode {
        config.trading.mode = mode;
    }
    config.trading.symbols = args.replays.iter().map(|(i, _)| i.to_string()).collect();
    if let Err(errors) = config.validate() {
        anyhow::bail!("Invalid configuration: {}", errors.join("; "));
    }

    let tick = Duration::from_millis(
        args.tick_ms
            .unwrap_or(config.trading.scan_interval_seconds.saturating_mul(1000)),
    );
    let mut replay = ReplayBroker::new()
        .with_tick_interval(tick)
        .with_cash(config.risk.capital);
    for (instrument, path) in &args.replays {
        let candles = load_candles_csv(path)
            .with_context(|| format!("Failed to read candles from {}", path.display()))?;
        info!(symbol = %instrument, candles = candles.len(), "Loaded replay data");
        replay = replay.with_series(instrument.clone(), candles);
    }
    if replay.is_empty() {
        anyhow::bail!("Replay data is empty");
    }
    let replay = Arc::new(replay);
    let broker: Arc<dyn BrokerClient> = replay.clone();

    let (store, memory) = open_store(&config).await?;
    let signals: Arc<dyn SignalSource> = Arc::new(args.rule.build(&config.risk)?);
    let ctx = TradingContext::new(&config, broker, store, signals)?;
    let executor = StrategyExecutor::new(ctx, ExecutorConfig::from_app(&config)?);

    if !executor.start().await {
        anyhow::bail!("Executor failed to start (state {})", executor.state().await);
    }

    let scan_interval = executor.config().scan_interval;
    let replay_done = {
        let replay = Arc::clone(&replay);
        async move {
            let mut poll = tokio::time::interval(Duration::from_millis(250));
            loop {
                poll.tick().await;
                if replay.cursor().await + 1 >= replay.len() {
                    break;
                }
            }
            // One more scan so the last candle is evaluated
            tokio::time::sleep(scan_interval).await;
        }
    };

    tokio::select! {
        _ = shutdown_signal() => info!("Shutdown requested"),
        _ = replay_done => info!("Replay finished"),
    }

    let status = executor.status().await;
    println!("{}", serde_json::to_string_pretty(&status)?);

    if args.flatten {
        let report = executor.emergency_stop().await;
        info!(
            cancelled = report.cancelled_orders.len(),
            filled = report.filled_orders.len(),
            closed = report.closed.len(),
            "Positions flattened"
        );
        for (key, reason) in &report.failed_closes {
            warn!(position = %key, "Not flattened: {}", reason);
        }
    } else if !executor.stop().await {
        error!("Executor did not stop cleanly");
    }

    if let Some(memory) = memory {
        let trades = memory.trades().await;
        let report = PerformanceAnalyzer::analyze(&trades);
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_replay() {
        let (instrument, path) = parse_replay("NSE:INFY=data/infy.csv").unwrap();
        assert_eq!(instrument, Instrument::new("NSE", "INFY"));
        assert_eq!(path, PathBuf::from("data/infy.csv"));

        assert!(parse_replay("NSE:INFY").is_err());
        assert!(parse_replay("NSE:INFY=").is_err());
        assert!(parse_replay("INFY=data.csv").is_err());
    }
}
