//! The backtest and the live executor share sizing, exit rules and P&L math

mod common;

use common::{app_config, candles, executor, instrument};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

use tradecore::domain::{Candle, ExitReason, Signal, TradingMode};
use tradecore::strategy::{BacktestConfig, BacktestEngine, PerformanceAnalyzer};
use tradecore::{MemoryStore, ReplayBroker};

fn entry() -> Signal {
    Signal::buy(dec!(500), Some(dec!(490)), Some(dec!(530)), "entry")
}

#[tokio::test]
async fn stop_exit_matches_between_backtest_and_paper_executor() {
    // Second bar closes exactly on the stop so the mark and the level agree
    let bars = candles(&[(499, 501, 500), (485, 500, 490)]);
    let config = app_config(TradingMode::Paper);

    let engine = BacktestEngine::new(BacktestConfig::from_app(&config, instrument()));
    let result = engine
        .run(
            &bars,
            |seen: &[Candle], _: &()| -> Option<Signal> { (seen.len() == 1).then(entry) },
            &(),
        )
        .unwrap();

    let broker = Arc::new(
        ReplayBroker::new()
            .with_series(instrument(), bars.clone())
            .without_stream(),
    );
    let store = Arc::new(MemoryStore::new());
    let exec = executor(&config, Arc::clone(&broker), Arc::clone(&store), vec![Some(entry())]);
    exec.run_iteration().await;
    broker.advance().await;
    let live = exec.run_iteration().await;

    assert_eq!(result.trades.len(), 1);
    assert_eq!(live.trades.len(), 1);
    let (bt, lv) = (&result.trades[0], &live.trades[0]);
    assert_eq!(bt.exit_reason, ExitReason::StopLoss);
    assert_eq!(lv.exit_reason, ExitReason::StopLoss);
    assert_eq!(bt.quantity, lv.quantity);
    assert_eq!(bt.exit_price, lv.exit_price);
    assert_eq!(bt.pnl, lv.pnl);
    assert_eq!(bt.pnl, dec!(-1000));
    assert_eq!(result.final_capital, exec.context().risk.capital().await);
}

#[test]
fn stop_wins_when_one_candle_spans_both_levels() {
    // Candle 2 trades through the stop and the target
    let bars = candles(&[(499, 501, 500), (480, 540, 520), (515, 525, 520)]);
    let engine = BacktestEngine::new(BacktestConfig::new(instrument(), dec!(100000)));
    let result = engine
        .run(
            &bars,
            |seen: &[Candle], _: &()| -> Option<Signal> { (seen.len() == 1).then(entry) },
            &(),
        )
        .unwrap();

    assert_eq!(result.trades.len(), 1);
    let trade = &result.trades[0];
    assert_eq!(trade.exit_reason, ExitReason::StopLoss);
    // (stop - entry) * qty
    assert_eq!(trade.pnl, (dec!(490) - dec!(500)) * Decimal::from(trade.quantity));
}

#[test]
fn capital_is_conserved_without_costs() {
    let bars = candles(&[
        (99, 101, 100),
        (100, 104, 103),
        (101, 106, 105),
        (97, 104, 98),
        (96, 100, 99),
        (98, 103, 102),
    ]);
    let engine = BacktestEngine::new(BacktestConfig::new(instrument(), dec!(50000)));
    let result = engine
        .run(
            &bars,
            |seen: &[Candle], _: &()| -> Option<Signal> {
                let close = seen.last()?.close;
                match seen.len() {
                    1 => Some(Signal::buy(close, Some(close - dec!(5)), Some(close + dec!(20)), "a")),
                    3 => Some(Signal::sell(close, Some(close + dec!(10)), Some(close - dec!(20)), "b")),
                    5 => Some(Signal::close("c")),
                    _ => None,
                }
            },
            &(),
        )
        .unwrap();

    let realized: Decimal = result.trades.iter().map(|t| t.pnl).sum();
    assert_eq!(result.final_capital, result.initial_capital + realized);
    assert_eq!(result.trades.len(), 2);

    let report = PerformanceAnalyzer::analyze(&result.trades);
    assert_eq!(report.total_pnl, realized);
    assert_eq!(report.long.trades, 1);
    assert_eq!(report.short.trades, 1);
}
