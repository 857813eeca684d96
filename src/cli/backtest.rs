//! `tradecore backtest` - offline run of the moving-average rule

use anyhow::{Context, Result};
use clap::Args;
use rust_decimal::Decimal;
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

use super::RuleArgs;
use crate::config::AppConfig;
use crate::domain::Instrument;
use crate::strategy::{
    load_candles_csv, BacktestConfig, BacktestEngine, BacktestResult, MovingAverageCrossover,
    PerformanceAnalyzer, PerformanceReport,
};

#[derive(Args, Debug)]
pub struct BacktestArgs {
    /// Candle CSV (timestamp,open,high,low,close,volume)
    #[arg(short, long)]
    pub data: PathBuf,

    /// Instrument the candles belong to, as EXCHANGE:SYMBOL
    #[arg(short, long)]
    pub symbol: Instrument,

    /// Starting capital (defaults to risk.capital)
    #[arg(long)]
    pub capital: Option<Decimal>,

    #[command(flatten)]
    pub rule: RuleArgs,

    /// Print every closed trade
    #[arg(long)]
    pub trades: bool,

    /// Emit the result and analysis as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct BacktestOutput<'a> {
    result: &'a BacktestResult,
    performance: &'a PerformanceReport,
}

pub fn run(args: BacktestArgs, config: &AppConfig) -> Result<()> {
    if let Err(errors) = config.validate() {
        anyhow::bail!("Invalid configuration: {}", errors.join("; "));
    }

    let candles = load_candles_csv(&args.data)
        .with_context(|| format!("Failed to read candles from {}", args.data.display()))?;
    info!(candles = candles.len(), symbol = %args.symbol, "Loaded backtest data");

    let rule = args.rule.build(&config.risk)?;
    let mut bt_config = BacktestConfig::from_app(config, args.symbol.clone());
    if let Some(capital) = args.capital {
        bt_config.initial_capital = capital;
    }

    let engine = BacktestEngine::new(bt_config);
    let result = engine.run(
        &candles,
        |seen, rule: &MovingAverageCrossover| rule.evaluate_candles(seen, true),
        &rule,
    )?;
    let performance = PerformanceAnalyzer::analyze(&result.trades);

    if args.json {
        let output = BacktestOutput {
            result: &result,
            performance: &performance,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    print_summary(&args.symbol, &result, &performance);
    if args.trades {
        print_trades(&result);
    }
    Ok(())
}

fn print_summary(symbol: &Instrument, result: &BacktestResult, perf: &PerformanceReport) {
    println!("\n  Backtest {} ({} -> {})", symbol, result.start_time, result.end_time);
    println!("  ------------------------------------------------------------");
    println!("  Capital:        {} -> {}", result.initial_capital, result.final_capital);
    println!(
        "  Total P&L:      {} ({:.2}%)",
        result.total_pnl, result.total_return_pct
    );
    println!(
        "  Trades:         {} ({} won / {} lost, win rate {:.1}%)",
        result.total_trades,
        result.winning_trades,
        result.losing_trades,
        result.win_rate * 100.0
    );
    println!("  Avg win/loss:   {} / {}", result.avg_win, result.avg_loss);
    println!("  Profit factor:  {:.2}", result.profit_factor);
    println!(
        "  Max drawdown:   {} ({:.2}%)",
        result.max_drawdown, result.max_drawdown_pct
    );
    println!("  Sharpe:         {:.2}", result.sharpe_ratio);
    println!("  Commission:     {}", result.total_commission);
    println!("  Expectancy:     {}", perf.expectancy.round_dp(2));
    println!("  Recovery:       {:.2}", perf.recovery_factor);
    println!(
        "  Streaks:        {} wins / {} losses",
        perf.longest_win_streak, perf.longest_loss_streak
    );
    println!(
        "  Long/Short:     {} ({}) / {} ({})",
        perf.long.trades, perf.long.pnl, perf.short.trades, perf.short.pnl
    );
    println!(
        "  Holding:        avg {:.0}m, median {:.0}m",
        perf.holding.avg_minutes, perf.holding.median_minutes
    );

    if !perf.by_exit_reason.is_empty() {
        println!("\n  Exit reasons");
        for stats in &perf.by_exit_reason {
            println!(
                "    {:<12} {:>4} trades  {:>12}  win {:.0}%",
                stats.reason.as_str(),
                stats.trades,
                stats.pnl,
                stats.win_rate * 100.0
            );
        }
    }

    if !perf.monthly.is_empty() {
        println!("\n  Monthly");
        for month in &perf.monthly {
            println!("    {}  {:>4} trades  {:>12}", month.month, month.trades, month.pnl);
        }
    }
    println!();
}

fn print_trades(result: &BacktestResult) {
    println!("  Trades");
    for t in &result.trades {
        println!(
            "    {} {:<5} {:>6} @ {} -> {} @ {}  {:>10}  {}",
            t.entry_time.format("%Y-%m-%d %H:%M"),
            t.side,
            t.quantity,
            t.entry_price,
            t.exit_time.format("%Y-%m-%d %H:%M"),
            t.exit_price,
            t.pnl,
            t.exit_reason.as_str()
        );
    }
    println!();
}
