//! Backtest engine
//!
//! Replays a candle sequence through the same sizing, entry, exit and P&L
//! rules the live executor uses:
//!
//! 1. exits: the candle's low/high against stop and target, stop first
//! 2. the strategy callback sees the candles so far (no look-ahead)
//! 3. entries are sized against the engine's running capital
//! 4. one equity point per candle
//!
//! Positions still open after the last candle close with `period_end`.
//! Fully synchronous; the same input always yields the same result.
//!
//! ```bash
//! tradecore backtest --data ./data/NSE_INFY_5m.csv --symbol NSE:INFY --fast 9 --slow 21
//! ```

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::domain::{Candle, ExitReason, Instrument, PositionSide, Signal, Trade};
use crate::error::{Result, TradeCoreError};
use crate::strategy::costs::CostModel;
use crate::strategy::position_tracker::{Fill, PositionBook};
use crate::strategy::risk::{calculate_stop_loss, calculate_target, PositionSizer};

const TRADING_DAYS_PER_YEAR: f64 = 252.0;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub instrument: Instrument,
    pub initial_capital: Decimal,
    pub sizer: PositionSizer,
    pub costs: CostModel,
    /// Used when a signal carries no stop
    pub default_stop_loss_pct: Decimal,
    /// Used when a signal carries no target
    pub risk_reward_ratio: Decimal,
    pub strategy_name: String,
}

impl BacktestConfig {
    pub fn new(instrument: Instrument, initial_capital: Decimal) -> Self {
        Self {
            instrument,
            initial_capital,
            sizer: PositionSizer::new(Decimal::ONE, Decimal::ONE_HUNDRED),
            costs: CostModel::zero(),
            default_stop_loss_pct: Decimal::ONE,
            risk_reward_ratio: Decimal::TWO,
            strategy_name: "backtest".to_string(),
        }
    }

    /// Same risk and cost settings as the live executor
    pub fn from_app(config: &AppConfig, instrument: Instrument) -> Self {
        Self {
            instrument,
            initial_capital: config.risk.capital,
            sizer: PositionSizer::from_config(&config.risk),
            costs: config.costs.cost_model(),
            default_stop_loss_pct: config.risk.default_stop_loss_pct,
            risk_reward_ratio: config.risk.risk_reward_ratio,
            strategy_name: config.trading.strategy_name.clone(),
        }
    }

    pub fn with_costs(mut self, costs: CostModel) -> Self {
        self.costs = costs;
        self
    }

    pub fn with_sizer(mut self, sizer: PositionSizer) -> Self {
        self.sizer = sizer;
        self
    }
}

// ============================================================================
// Results
// ============================================================================

/// Equity sample taken after each candle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    /// Capital plus unrealized P&L net of open entry commission
    pub equity: Decimal,
    /// Realized capital
    pub capital: Decimal,
    pub unrealized_pnl: Decimal,
    /// Decline from the running peak
    pub drawdown: Decimal,
    pub drawdown_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub initial_capital: Decimal,
    pub final_capital: Decimal,
    pub total_pnl: Decimal,
    pub total_return_pct: f64,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    /// Fraction of trades with positive net P&L
    pub win_rate: f64,
    pub gross_profit: Decimal,
    /// Sum of losing trades, as a positive amount
    pub gross_loss: Decimal,
    pub avg_win: Decimal,
    pub avg_loss: Decimal,
    pub largest_win: Decimal,
    pub largest_loss: Decimal,
    /// `gross_profit / gross_loss`, 0 without losses
    pub profit_factor: f64,
    pub max_drawdown: Decimal,
    pub max_drawdown_pct: f64,
    /// Annualized over per-candle equity returns
    pub sharpe_ratio: f64,
    pub total_commission: Decimal,
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
}

impl BacktestResult {
    /// Derive every metric from the trade log and equity curve
    pub fn from_run(initial_capital: Decimal, trades: Vec<Trade>, equity_curve: Vec<EquityPoint>) -> Self {
        let start_time = equity_curve.first().map(|p| p.timestamp).unwrap_or_else(Utc::now);
        let end_time = equity_curve.last().map(|p| p.timestamp).unwrap_or(start_time);

        let total_pnl: Decimal = trades.iter().map(|t| t.pnl).sum();
        let final_capital = initial_capital + total_pnl;
        let total_return_pct = if initial_capital.is_zero() {
            0.0
        } else {
            (total_pnl / initial_capital * Decimal::ONE_HUNDRED)
                .to_f64()
                .unwrap_or(0.0)
        };

        let wins: Vec<Decimal> = trades.iter().filter(|t| t.is_win()).map(|t| t.pnl).collect();
        let losses: Vec<Decimal> = trades
            .iter()
            .filter(|t| t.pnl < Decimal::ZERO)
            .map(|t| t.pnl)
            .collect();

        let gross_profit: Decimal = wins.iter().sum();
        let gross_loss: Decimal = losses.iter().map(|l| l.abs()).sum();

        let win_rate = if trades.is_empty() {
            0.0
        } else {
            wins.len() as f64 / trades.len() as f64
        };
        let avg_win = average(&wins);
        let avg_loss = average(&losses);
        let largest_win = wins.iter().copied().max().unwrap_or(Decimal::ZERO);
        let largest_loss = losses.iter().copied().min().unwrap_or(Decimal::ZERO);

        let profit_factor = if gross_loss > Decimal::ZERO {
            (gross_profit / gross_loss).to_f64().unwrap_or(0.0)
        } else {
            0.0
        };

        let max_drawdown = equity_curve
            .iter()
            .map(|p| p.drawdown)
            .max()
            .unwrap_or(Decimal::ZERO);
        let max_drawdown_pct = equity_curve
            .iter()
            .map(|p| p.drawdown_pct)
            .fold(0.0_f64, f64::max);

        Self {
            start_time,
            end_time,
            initial_capital,
            final_capital,
            total_pnl,
            total_return_pct,
            total_trades: trades.len(),
            winning_trades: wins.len(),
            losing_trades: losses.len(),
            win_rate,
            gross_profit,
            gross_loss,
            avg_win,
            avg_loss,
            largest_win,
            largest_loss,
            profit_factor,
            max_drawdown,
            max_drawdown_pct,
            sharpe_ratio: sharpe_ratio(&equity_curve),
            total_commission: trades.iter().map(|t| t.commission).sum(),
            trades,
            equity_curve,
        }
    }
}

fn average(values: &[Decimal]) -> Decimal {
    if values.is_empty() {
        return Decimal::ZERO;
    }
    values.iter().sum::<Decimal>() / Decimal::from(values.len() as u64)
}

/// `mean / std * sqrt(252)` over per-point equity returns, 0 when flat
pub fn sharpe_ratio(equity_curve: &[EquityPoint]) -> f64 {
    let returns: Vec<f64> = equity_curve
        .windows(2)
        .filter_map(|w| {
            let prev = w[0].equity.to_f64()?;
            let next = w[1].equity.to_f64()?;
            (prev != 0.0).then(|| next / prev - 1.0)
        })
        .collect();
    if returns.len() < 2 {
        return 0.0;
    }

    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    let std_dev = variance.sqrt();
    if std_dev == 0.0 {
        return 0.0;
    }
    mean / std_dev * TRADING_DAYS_PER_YEAR.sqrt()
}

// ============================================================================
// Engine
// ============================================================================

pub struct BacktestEngine {
    config: BacktestConfig,
}

/// Mutable state of one run
struct Run {
    capital: Decimal,
    peak_equity: Decimal,
    book: PositionBook,
    trades: Vec<Trade>,
    equity_curve: Vec<EquityPoint>,
}

impl BacktestEngine {
    pub fn new(config: BacktestConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    /// Replay `candles` through `strategy`, which sees only candles up to
    /// and including the current one.
    pub fn run<P, F>(&self, candles: &[Candle], mut strategy: F, params: &P) -> Result<BacktestResult>
    where
        F: FnMut(&[Candle], &P) -> Option<Signal>,
    {
        if candles.is_empty() {
            return Err(TradeCoreError::Validation("backtest needs at least one candle".into()));
        }
        if let Some(bad) = candles.iter().find(|c| !c.is_valid()) {
            return Err(TradeCoreError::Validation(format!(
                "malformed candle at {}",
                bad.timestamp
            )));
        }
        if candles.windows(2).any(|w| w[1].timestamp < w[0].timestamp) {
            return Err(TradeCoreError::Validation("candles are not in chronological order".into()));
        }

        info!(
            symbol = %self.config.instrument, candles = candles.len(),
            capital = %self.config.initial_capital, "Backtest started"
        );

        let key = self.config.instrument.key();
        let mut run = Run {
            capital: self.config.initial_capital,
            peak_equity: self.config.initial_capital,
            book: PositionBook::new(),
            trades: Vec::new(),
            equity_curve: Vec::with_capacity(candles.len()),
        };

        for (i, candle) in candles.iter().enumerate() {
            if let Some(trigger) = run.book.check_range(&key, candle.low, candle.high) {
                debug!(at = %candle.timestamp, reason = %trigger.reason, level = %trigger.level, "Exit triggered");
                self.close(&mut run, &key, trigger.side, trigger.level, trigger.reason, candle.timestamp);
            }
            run.book.mark(&key, candle.close);

            if let Some(signal) = strategy(&candles[..=i], params) {
                match signal.validate() {
                    Ok(()) => self.apply_signal(&mut run, &key, signal, candle),
                    Err(e) => warn!(at = %candle.timestamp, "Invalid signal ignored: {}", e),
                }
            }

            self.record_equity(&mut run, candle.timestamp);
        }

        if let Some(last) = candles.last() {
            if let Some(side) = run.book.get(&key).map(|p| p.side) {
                self.close(&mut run, &key, side, last.close, ExitReason::PeriodEnd, last.timestamp);
                run.equity_curve.pop();
                self.record_equity(&mut run, last.timestamp);
            }
        }

        let result = BacktestResult::from_run(self.config.initial_capital, run.trades, run.equity_curve);
        info!(
            trades = result.total_trades, pnl = %result.total_pnl,
            win_rate = format!("{:.1}%", result.win_rate * 100.0),
            max_dd = format!("{:.2}%", result.max_drawdown_pct),
            sharpe = format!("{:.2}", result.sharpe_ratio), "Backtest complete"
        );
        Ok(result)
    }

    fn close(
        &self,
        run: &mut Run,
        key: &str,
        side: PositionSide,
        level: Decimal,
        reason: ExitReason,
        at: DateTime<Utc>,
    ) {
        let Some(quantity) = run.book.get(key).map(|p| p.quantity) else {
            return;
        };
        let price = self.config.costs.apply_slippage(level, side.exit_side());
        let commission = self.config.costs.commission(price, quantity);
        if let Some(trade) = run.book.close(key, Some(price), commission, reason, at) {
            run.capital += trade.pnl;
            run.trades.push(trade);
        }
    }

    fn apply_signal(&self, run: &mut Run, key: &str, signal: Signal, candle: &Candle) {
        let entry = match &signal {
            Signal::Close { .. } => {
                if let Some(side) = run.book.get(key).map(|p| p.side) {
                    self.close(run, key, side, candle.close, ExitReason::Signal, candle.timestamp);
                }
                return;
            }
            Signal::Buy(entry) | Signal::Sell(entry) => entry,
        };
        let Some(order_side) = signal.side() else {
            return;
        };
        let side = order_side.position_side();

        if let Some(held) = run.book.get(key).map(|p| p.side) {
            if held == side {
                return;
            }
            self.close(run, key, held, entry.price, ExitReason::Signal, candle.timestamp);
        }

        let stop_loss = entry
            .stop_loss
            .unwrap_or_else(|| calculate_stop_loss(entry.price, side, self.config.default_stop_loss_pct));
        let target = entry.target.unwrap_or_else(|| {
            calculate_target(
                entry.price,
                side,
                self.config.default_stop_loss_pct,
                self.config.risk_reward_ratio,
            )
        });

        let size = self.config.sizer.size(run.capital, entry.price, stop_loss, side);
        if size.is_zero() {
            debug!(at = %candle.timestamp, price = %entry.price, "Signal skipped: zero size");
            return;
        }

        let price = self.config.costs.apply_slippage(entry.price, order_side);
        let fill = Fill::new(self.config.instrument.clone(), order_side, size.quantity, price)
            .with_levels(Some(stop_loss), Some(target))
            .with_commission(self.config.costs.commission(price, size.quantity))
            .with_strategy(self.config.strategy_name.clone())
            .at(candle.timestamp);
        run.book.apply_fill(fill);
        run.book.mark(key, candle.close);
    }

    fn record_equity(&self, run: &mut Run, at: DateTime<Utc>) {
        let open_commission: Decimal = run.book.positions().iter().map(|p| p.entry_commission).sum();
        let unrealized = run.book.unrealized_pnl();
        let equity = run.capital + unrealized - open_commission;
        if equity > run.peak_equity {
            run.peak_equity = equity;
        }
        let drawdown = run.peak_equity - equity;
        let drawdown_pct = if run.peak_equity > Decimal::ZERO {
            (drawdown / run.peak_equity * Decimal::ONE_HUNDRED)
                .to_f64()
                .unwrap_or(0.0)
        } else {
            0.0
        };

        run.equity_curve.push(EquityPoint {
            timestamp: at,
            equity,
            capital: run.capital,
            unrealized_pnl: unrealized,
            drawdown,
            drawdown_pct,
        });
    }
}

// ============================================================================
// Data Loading
// ============================================================================

#[derive(Debug, Deserialize)]
struct CandleRow {
    timestamp: String,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    #[serde(default)]
    volume: Option<Decimal>,
}

/// Load candles from a CSV file with a header row.
/// Expected columns: `timestamp,open,high,low,close,volume`
pub fn load_candles_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Candle>> {
    let mut reader = csv::Reader::from_path(path.as_ref())?;
    let mut candles = Vec::new();

    for (line, row) in reader.deserialize::<CandleRow>().enumerate() {
        let row = row?;
        let timestamp = parse_timestamp(row.timestamp.trim()).ok_or_else(|| {
            TradeCoreError::Validation(format!(
                "invalid timestamp '{}' on row {}",
                row.timestamp,
                line + 1
            ))
        })?;
        let candle = Candle {
            timestamp,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume.unwrap_or(Decimal::ZERO),
        };
        if !candle.is_valid() {
            warn!(row = line + 1, "Skipping malformed candle");
            continue;
        }
        candles.push(candle);
    }

    candles.sort_by_key(|c| c.timestamp);
    info!(path = %path.as_ref().display(), count = candles.len(), "Loaded candles");
    Ok(candles)
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = s.parse::<i64>() {
        // Unix seconds or milliseconds
        return if ts > 1_000_000_000_000 {
            Utc.timestamp_millis_opt(ts).single()
        } else {
            Utc.timestamp_opt(ts, 0).single()
        };
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    let formats = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%d %H:%M:%S%.f",
    ];
    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&dt));
        }
    }

    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| Utc.from_utc_datetime(&dt))
}
