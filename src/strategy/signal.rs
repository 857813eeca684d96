//! Signal source capability and a reference moving-average rule
//!
//! Live sources see the latest quote; backtests call the same rule with the
//! candles seen so far.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::domain::{Candle, Instrument, PositionSide, Quote, Signal};
use crate::error::{Result, TradeCoreError};
use crate::strategy::risk::{calculate_stop_loss, calculate_target};

/// Market context handed to a signal source
#[derive(Debug, Clone, Copy)]
pub enum MarketView<'a> {
    Quote(&'a Quote),
    Candles(&'a [Candle]),
}

impl MarketView<'_> {
    pub fn last_price(&self) -> Option<Decimal> {
        match self {
            MarketView::Quote(quote) => Some(quote.last_price),
            MarketView::Candles(candles) => candles.last().map(|c| c.close),
        }
    }
}

/// Anything that turns market context into trade decisions
#[async_trait]
pub trait SignalSource: Send + Sync {
    fn name(&self) -> &str;

    /// `None` means no action this iteration
    async fn evaluate(
        &self,
        instrument: &Instrument,
        view: MarketView<'_>,
        has_position: bool,
    ) -> Result<Option<Signal>>;
}

fn sma(values: &[Decimal]) -> Decimal {
    let sum: Decimal = values.iter().sum();
    sum / Decimal::from(values.len() as u64)
}

/// Fast/slow simple moving average crossover.
///
/// Bullish cross → BUY, bearish cross → SELL (or CLOSE of an open long when
/// shorting is disabled). Stops and targets derive from `stop_loss_pct` and
/// `risk_reward_ratio`.
pub struct MovingAverageCrossover {
    pub fast: usize,
    pub slow: usize,
    pub stop_loss_pct: Decimal,
    pub risk_reward_ratio: Decimal,
    pub allow_short: bool,
    /// Live close history per instrument key
    history: Mutex<HashMap<String, VecDeque<Decimal>>>,
}

impl MovingAverageCrossover {
    pub fn new(fast: usize, slow: usize, stop_loss_pct: Decimal, risk_reward_ratio: Decimal) -> Result<Self> {
        if fast == 0 || fast >= slow {
            return Err(TradeCoreError::Validation(format!(
                "moving average windows need 0 < fast < slow, got {}/{}",
                fast, slow
            )));
        }
        Ok(Self {
            fast,
            slow,
            stop_loss_pct,
            risk_reward_ratio,
            allow_short: true,
            history: Mutex::new(HashMap::new()),
        })
    }

    pub fn long_only(mut self) -> Self {
        self.allow_short = false;
        self
    }

    /// Decide from a close series, oldest first
    pub fn decide(&self, closes: &[Decimal], has_position: bool) -> Option<Signal> {
        if closes.len() < self.slow + 1 {
            return None;
        }
        let n = closes.len();
        let prev = &closes[..n - 1];

        let fast_now = sma(&closes[n - self.fast..]);
        let slow_now = sma(&closes[n - self.slow..]);
        let fast_prev = sma(&prev[prev.len() - self.fast..]);
        let slow_prev = sma(&prev[prev.len() - self.slow..]);
        let price = closes[n - 1];

        if fast_prev <= slow_prev && fast_now > slow_now {
            return Some(self.entry(PositionSide::Long, price));
        }
        if fast_prev >= slow_prev && fast_now < slow_now {
            if self.allow_short {
                return Some(self.entry(PositionSide::Short, price));
            }
            if has_position {
                return Some(Signal::close(format!("sma{} crossed below sma{}", self.fast, self.slow)));
            }
        }
        None
    }

    fn entry(&self, side: PositionSide, price: Decimal) -> Signal {
        let stop = calculate_stop_loss(price, side, self.stop_loss_pct);
        let target = calculate_target(price, side, self.stop_loss_pct, self.risk_reward_ratio);
        match side {
            PositionSide::Long => Signal::buy(
                price,
                Some(stop),
                Some(target),
                format!("sma{} crossed above sma{}", self.fast, self.slow),
            ),
            PositionSide::Short => Signal::sell(
                price,
                Some(stop),
                Some(target),
                format!("sma{} crossed below sma{}", self.fast, self.slow),
            ),
        }
    }

    /// Backtest entry point: a pure function of the candles seen so far
    pub fn evaluate_candles(&self, candles: &[Candle], has_position: bool) -> Option<Signal> {
        let window = candles.len().min(self.slow + 1);
        let closes: Vec<Decimal> = candles[candles.len() - window..].iter().map(|c| c.close).collect();
        self.decide(&closes, has_position)
    }

    fn record_close(&self, key: String, price: Decimal) -> Vec<Decimal> {
        let mut history = self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let closes = history.entry(key).or_default();
        closes.push_back(price);
        while closes.len() > self.slow + 1 {
            closes.pop_front();
        }
        closes.iter().copied().collect()
    }
}

#[async_trait]
impl SignalSource for MovingAverageCrossover {
    fn name(&self) -> &str {
        "sma_crossover"
    }

    async fn evaluate(
        &self,
        instrument: &Instrument,
        view: MarketView<'_>,
        has_position: bool,
    ) -> Result<Option<Signal>> {
        match view {
            MarketView::Candles(candles) => Ok(self.evaluate_candles(candles, has_position)),
            MarketView::Quote(quote) => {
                let closes = self.record_close(instrument.key(), quote.last_price);
                Ok(self.decide(&closes, has_position))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn closes(values: &[i64]) -> Vec<Decimal> {
        values.iter().map(|v| Decimal::from(*v)).collect()
    }

    #[test]
    fn test_bullish_cross_buys_with_levels() {
        let rule = MovingAverageCrossover::new(2, 4, dec!(2), dec!(2)).unwrap();
        let signal = rule.decide(&closes(&[100, 99, 98, 97, 110]), false).unwrap();

        match signal {
            Signal::Buy(entry) => {
                assert_eq!(entry.price, dec!(110));
                assert_eq!(entry.stop_loss, Some(dec!(107.8)));
                assert_eq!(entry.target, Some(dec!(114.4)));
            }
            other => panic!("expected buy, got {:?}", other),
        }
    }

    #[test]
    fn test_bearish_cross_respects_long_only() {
        let series = closes(&[100, 101, 102, 103, 90]);
        let both = MovingAverageCrossover::new(2, 4, dec!(1), dec!(2)).unwrap();
        assert!(matches!(both.decide(&series, false), Some(Signal::Sell(_))));

        let long_only = MovingAverageCrossover::new(2, 4, dec!(1), dec!(2)).unwrap().long_only();
        assert!(long_only.decide(&series, false).is_none());
        assert!(matches!(long_only.decide(&series, true), Some(Signal::Close { .. })));
    }

    #[test]
    fn test_needs_enough_history() {
        let rule = MovingAverageCrossover::new(2, 4, dec!(1), dec!(2)).unwrap();
        assert!(rule.decide(&closes(&[1, 2, 3, 4]), false).is_none());
        assert!(MovingAverageCrossover::new(4, 4, dec!(1), dec!(2)).is_err());
    }

    #[tokio::test]
    async fn test_live_quotes_accumulate_history() {
        let rule = MovingAverageCrossover::new(2, 4, dec!(2), dec!(2)).unwrap();
        let inst = Instrument::new("NSE", "HDFC");
        let mut last = None;
        for price in [100, 99, 98, 97, 110] {
            let quote = Quote::from_last_price(inst.clone(), Decimal::from(price));
            last = rule.evaluate(&inst, MarketView::Quote(&quote), false).await.unwrap();
        }
        assert!(matches!(last, Some(Signal::Buy(_))));
    }
}
