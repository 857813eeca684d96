//! Performance Analyzer
//!
//! Read-only aggregations over a closed-trade log. Works the same on a
//! backtest result and on the trades of a live session.

use chrono::Datelike;
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::{ExitReason, PositionSide, Trade};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyPnl {
    /// `YYYY-MM` of the exit
    pub month: String,
    pub trades: usize,
    pub wins: usize,
    pub pnl: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitReasonStats {
    pub reason: ExitReason,
    pub trades: usize,
    pub pnl: Decimal,
    pub win_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HoldingStats {
    pub avg_minutes: f64,
    pub median_minutes: f64,
    pub min_minutes: i64,
    pub max_minutes: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SideStats {
    pub trades: usize,
    pub wins: usize,
    pub win_rate: f64,
    pub pnl: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub total_trades: usize,
    pub total_pnl: Decimal,
    pub win_rate: f64,
    pub loss_rate: f64,
    pub avg_win: Decimal,
    pub avg_loss: Decimal,
    /// `win_rate * avg_win - loss_rate * |avg_loss|`
    pub expectancy: Decimal,
    pub longest_win_streak: usize,
    pub longest_loss_streak: usize,
    /// Peak-to-trough of cumulative realized P&L
    pub max_drawdown: Decimal,
    /// `total_pnl / max_drawdown`, 0 without a drawdown
    pub recovery_factor: f64,
    pub total_commission: Decimal,
    pub monthly: Vec<MonthlyPnl>,
    pub by_exit_reason: Vec<ExitReasonStats>,
    pub holding: HoldingStats,
    pub long: SideStats,
    pub short: SideStats,
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn mean(values: &[Decimal]) -> Decimal {
    if values.is_empty() {
        return Decimal::ZERO;
    }
    values.iter().sum::<Decimal>() / Decimal::from(values.len() as u64)
}

pub struct PerformanceAnalyzer;

impl PerformanceAnalyzer {
    /// Analyze trades in exit order
    pub fn analyze(trades: &[Trade]) -> PerformanceReport {
        if trades.is_empty() {
            return PerformanceReport::default();
        }

        let mut ordered: Vec<&Trade> = trades.iter().collect();
        ordered.sort_by_key(|t| t.exit_time);

        let wins: Vec<Decimal> = ordered.iter().filter(|t| t.is_win()).map(|t| t.pnl).collect();
        let losses: Vec<Decimal> = ordered
            .iter()
            .filter(|t| t.pnl < Decimal::ZERO)
            .map(|t| t.pnl)
            .collect();

        let n = ordered.len();
        let total_pnl: Decimal = ordered.iter().map(|t| t.pnl).sum();
        let avg_win = mean(&wins);
        let avg_loss = mean(&losses);
        let count = Decimal::from(n as u64);
        let expectancy = Decimal::from(wins.len() as u64) / count * avg_win
            - Decimal::from(losses.len() as u64) / count * avg_loss.abs();

        let (longest_win_streak, longest_loss_streak) = Self::streaks(&ordered);
        let max_drawdown = Self::realized_drawdown(&ordered);
        let recovery_factor = if max_drawdown > Decimal::ZERO {
            (total_pnl / max_drawdown).to_f64().unwrap_or(0.0)
        } else {
            0.0
        };

        PerformanceReport {
            total_trades: n,
            total_pnl,
            win_rate: ratio(wins.len(), n),
            loss_rate: ratio(losses.len(), n),
            avg_win,
            avg_loss,
            expectancy,
            longest_win_streak,
            longest_loss_streak,
            max_drawdown,
            recovery_factor,
            total_commission: ordered.iter().map(|t| t.commission).sum(),
            monthly: Self::monthly(&ordered),
            by_exit_reason: Self::by_exit_reason(&ordered),
            holding: Self::holding(&ordered),
            long: Self::side(&ordered, PositionSide::Long),
            short: Self::side(&ordered, PositionSide::Short),
        }
    }

    /// Longest runs of winners and losers. Break-even trades end both.
    fn streaks(trades: &[&Trade]) -> (usize, usize) {
        let (mut wins, mut losses) = (0, 0);
        let (mut best_win, mut best_loss) = (0, 0);
        for trade in trades {
            if trade.pnl > Decimal::ZERO {
                wins += 1;
                losses = 0;
            } else if trade.pnl < Decimal::ZERO {
                losses += 1;
                wins = 0;
            } else {
                wins = 0;
                losses = 0;
            }
            best_win = best_win.max(wins);
            best_loss = best_loss.max(losses);
        }
        (best_win, best_loss)
    }

    fn realized_drawdown(trades: &[&Trade]) -> Decimal {
        let mut cumulative = Decimal::ZERO;
        let mut peak = Decimal::ZERO;
        let mut max_dd = Decimal::ZERO;
        for trade in trades {
            cumulative += trade.pnl;
            peak = peak.max(cumulative);
            max_dd = max_dd.max(peak - cumulative);
        }
        max_dd
    }

    fn monthly(trades: &[&Trade]) -> Vec<MonthlyPnl> {
        let mut months: BTreeMap<(i32, u32), MonthlyPnl> = BTreeMap::new();
        for trade in trades {
            let (year, month) = (trade.exit_time.year(), trade.exit_time.month());
            let entry = months.entry((year, month)).or_insert_with(|| MonthlyPnl {
                month: format!("{:04}-{:02}", year, month),
                trades: 0,
                wins: 0,
                pnl: Decimal::ZERO,
            });
            entry.trades += 1;
            if trade.is_win() {
                entry.wins += 1;
            }
            entry.pnl += trade.pnl;
        }
        months.into_values().collect()
    }

    fn by_exit_reason(trades: &[&Trade]) -> Vec<ExitReasonStats> {
        let mut groups: BTreeMap<ExitReason, (usize, usize, Decimal)> = BTreeMap::new();
        for trade in trades {
            let group = groups.entry(trade.exit_reason).or_insert((0, 0, Decimal::ZERO));
            group.0 += 1;
            if trade.is_win() {
                group.1 += 1;
            }
            group.2 += trade.pnl;
        }
        groups
            .into_iter()
            .map(|(reason, (count, wins, pnl))| ExitReasonStats {
                reason,
                trades: count,
                pnl,
                win_rate: ratio(wins, count),
            })
            .collect()
    }

    fn holding(trades: &[&Trade]) -> HoldingStats {
        let mut minutes: Vec<i64> = trades.iter().map(|t| t.holding_minutes()).collect();
        minutes.sort_unstable();
        let n = minutes.len();
        if n == 0 {
            return HoldingStats::default();
        }
        let median = if n % 2 == 0 {
            (minutes[n / 2 - 1] + minutes[n / 2]) as f64 / 2.0
        } else {
            minutes[n / 2] as f64
        };
        HoldingStats {
            avg_minutes: minutes.iter().sum::<i64>() as f64 / n as f64,
            median_minutes: median,
            min_minutes: minutes[0],
            max_minutes: minutes[n - 1],
        }
    }

    fn side(trades: &[&Trade], side: PositionSide) -> SideStats {
        let matching: Vec<&&Trade> = trades.iter().filter(|t| t.side == side).collect();
        let wins = matching.iter().filter(|t| t.is_win()).count();
        SideStats {
            trades: matching.len(),
            wins,
            win_rate: ratio(wins, matching.len()),
            pnl: matching.iter().map(|t| t.pnl).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Instrument;
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn trade(day: u32, held_minutes: i64, side: PositionSide, pnl: Decimal, reason: ExitReason) -> Trade {
        let exit = Utc.with_ymd_and_hms(2024, 1, 1, 15, 0, 0).unwrap() + Duration::days(day as i64);
        let entry_price = dec!(100);
        let exit_price = match side {
            PositionSide::Long => entry_price + pnl / dec!(10),
            PositionSide::Short => entry_price - pnl / dec!(10),
        };
        Trade::closed(
            Instrument::new("NSE", "ITC"),
            side,
            exit - Duration::minutes(held_minutes),
            exit,
            entry_price,
            exit_price,
            10,
            None,
            None,
            pnl,
            Decimal::ZERO,
            reason,
            "test".into(),
        )
    }

    fn sample() -> Vec<Trade> {
        vec![
            trade(0, 30, PositionSide::Long, dec!(100), ExitReason::TargetHit),
            trade(1, 60, PositionSide::Long, dec!(200), ExitReason::TargetHit),
            trade(2, 10, PositionSide::Short, dec!(-50), ExitReason::StopLoss),
            trade(3, 20, PositionSide::Long, dec!(-150), ExitReason::StopLoss),
            trade(40, 90, PositionSide::Short, dec!(300), ExitReason::Signal),
        ]
    }

    #[test]
    fn test_headline_metrics() {
        let report = PerformanceAnalyzer::analyze(&sample());

        assert_eq!(report.total_trades, 5);
        assert_eq!(report.total_pnl, dec!(400));
        assert_eq!(report.win_rate, 0.6);
        assert_eq!(report.avg_win, dec!(200));
        assert_eq!(report.avg_loss, dec!(-100));
        // 0.6 * 200 - 0.4 * 100
        assert_eq!(report.expectancy, dec!(80));
        assert_eq!(report.longest_win_streak, 2);
        assert_eq!(report.longest_loss_streak, 2);
        // Cumulative 100, 300, 250, 100, 400
        assert_eq!(report.max_drawdown, dec!(200));
        assert_eq!(report.recovery_factor, 2.0);
    }

    #[test]
    fn test_breakdowns() {
        let report = PerformanceAnalyzer::analyze(&sample());

        assert_eq!(report.monthly.len(), 2);
        assert_eq!(report.monthly[0].month, "2024-01");
        assert_eq!(report.monthly[0].pnl, dec!(100));
        assert_eq!(report.monthly[1].month, "2024-02");

        let stops = report
            .by_exit_reason
            .iter()
            .find(|s| s.reason == ExitReason::StopLoss)
            .unwrap();
        assert_eq!(stops.trades, 2);
        assert_eq!(stops.pnl, dec!(-200));

        assert_eq!(report.long.trades, 3);
        assert_eq!(report.short.pnl, dec!(250));
        assert_eq!(report.holding.min_minutes, 10);
        assert_eq!(report.holding.max_minutes, 90);
        assert_eq!(report.holding.median_minutes, 30.0);
    }

    #[test]
    fn test_empty_log() {
        let report = PerformanceAnalyzer::analyze(&[]);
        assert_eq!(report.total_trades, 0);
        assert_eq!(report.recovery_factor, 0.0);
        assert!(report.monthly.is_empty());
    }
}
