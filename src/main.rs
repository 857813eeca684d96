use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use tradecore::cli::{backtest, runtime, Cli, Commands};
use tradecore::config::{AppConfig, LoggingConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            let config = load_config(&cli.config_dir)?;
            let _guard = init_logging(&config.logging);
            runtime::run(args, config).await?;
        }
        Commands::Backtest(args) => {
            let config = load_config(&cli.config_dir)?;
            let _guard = init_logging(&config.logging);
            backtest::run(args, &config)?;
        }
        Commands::Config(cmd) => {
            init_logging_simple();
            cmd.run(&cli.config_dir)?;
        }
    }

    Ok(())
}

fn load_config(dir: &Path) -> Result<AppConfig> {
    AppConfig::load_from(dir)
        .with_context(|| format!("Failed to load configuration from {}", dir.display()))
}

/// Console logging plus an optional daily-rolling file under `logging.dir`.
/// The returned guard flushes the file writer on drop.
fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},tradecore=debug,sqlx=warn", config.level))
    });

    let mut guard = None;
    let file_layer = config.dir.as_deref().and_then(|dir| {
        // rolling::daily panics if the first file cannot be created
        if let Err(e) = preflight_log_dir(dir) {
            eprintln!(
                "Warning: Could not write to log directory {} ({}), file logging disabled",
                dir, e
            );
            return None;
        }
        let appender = tracing_appender::rolling::daily(dir, "tradecore.log");
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        guard = Some(file_guard);
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true),
        )
    });

    if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .init();
    }

    if let (Some(dir), Some(_)) = (&config.dir, &guard) {
        eprintln!("Logging to: {}/tradecore.log", dir);
    }
    guard
}

fn preflight_log_dir(dir: &str) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let probe = Path::new(dir).join(".tradecore_write_test");
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&probe)?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

fn init_logging_simple() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}
