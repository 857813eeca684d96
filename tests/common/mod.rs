#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use std::sync::{Arc, Mutex};

use tradecore::config::AppConfig;
use tradecore::domain::{Candle, Instrument, Signal, TradingMode};
use tradecore::strategy::{ExecutorConfig, MarketView, SignalSource, StrategyExecutor, TradingContext};
use tradecore::{MemoryStore, ReplayBroker, Result};

/// Signal source that replays a fixed script, one entry per evaluation
pub struct Scripted {
    queue: Mutex<Vec<Option<Signal>>>,
}

impl Scripted {
    pub fn new(mut signals: Vec<Option<Signal>>) -> Self {
        signals.reverse();
        Self {
            queue: Mutex::new(signals),
        }
    }
}

#[async_trait]
impl SignalSource for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn evaluate(
        &self,
        _instrument: &Instrument,
        _view: MarketView<'_>,
        _has_position: bool,
    ) -> Result<Option<Signal>> {
        Ok(self.queue.lock().unwrap().pop().flatten())
    }
}

pub fn instrument() -> Instrument {
    Instrument::new("NSE", "TCS")
}

/// One-minute candles from `(low, high, close)` triples
pub fn candles(bars: &[(i64, i64, i64)]) -> Vec<Candle> {
    let start = Utc.with_ymd_and_hms(2024, 6, 3, 9, 15, 0).unwrap();
    bars.iter()
        .enumerate()
        .map(|(i, &(low, high, close))| Candle {
            timestamp: start + Duration::minutes(i as i64),
            open: Decimal::from(close),
            high: Decimal::from(high),
            low: Decimal::from(low),
            close: Decimal::from(close),
            volume: Decimal::from(1000),
        })
        .collect()
}

pub fn app_config(mode: TradingMode) -> AppConfig {
    let mut config = AppConfig::default_config(mode, vec![instrument().to_string()]);
    config.trading.scan_interval_seconds = 1;
    config.trading.stop_timeout_seconds = 2;
    config
}

pub fn executor(
    config: &AppConfig,
    broker: Arc<ReplayBroker>,
    store: Arc<MemoryStore>,
    signals: Vec<Option<Signal>>,
) -> StrategyExecutor {
    let ctx = TradingContext::new(config, broker, store, Arc::new(Scripted::new(signals)))
        .expect("context");
    StrategyExecutor::new(ctx, ExecutorConfig::from_app(config).expect("executor config"))
}
