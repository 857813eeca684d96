use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::BrokerClient;
use crate::domain::{Instrument, Quote, Tick};
use crate::error::{BrokerError, Result, TradeCoreError};

const DEFAULT_QUOTE_TTL_SECS: i64 = 30;

/// Thread-safe latest-quote cache keyed by `exchange:symbol`
#[derive(Clone)]
pub struct QuoteCache {
    quotes: Arc<DashMap<String, Quote>>,
    ttl_secs: i64,
}

impl Default for QuoteCache {
    fn default() -> Self {
        Self::new()
    }
}

impl QuoteCache {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_QUOTE_TTL_SECS)
    }

    pub fn with_ttl(ttl_secs: i64) -> Self {
        Self {
            quotes: Arc::new(DashMap::new()),
            ttl_secs,
        }
    }

    /// Check if a quote is older than the TTL
    pub fn is_stale(&self, quote: &Quote, now: DateTime<Utc>) -> bool {
        quote.age_secs(now) > self.ttl_secs
    }

    pub fn insert(&self, quote: Quote) {
        self.quotes.insert(quote.instrument.key(), quote);
    }

    /// Fold a streaming tick into the cached quote
    pub fn apply_tick(&self, tick: &Tick) {
        self.quotes
            .entry(tick.instrument.key())
            .and_modify(|quote| {
                quote.last_price = tick.last_price;
                if tick.volume.is_some() {
                    quote.volume = tick.volume;
                }
                quote.high = Some(quote.high.map_or(tick.last_price, |h| h.max(tick.last_price)));
                quote.low = Some(quote.low.map_or(tick.last_price, |l| l.min(tick.last_price)));
                quote.timestamp = tick.timestamp;
            })
            .or_insert_with(|| Quote {
                instrument: tick.instrument.clone(),
                last_price: tick.last_price,
                best_bid: None,
                best_ask: None,
                high: Some(tick.last_price),
                low: Some(tick.last_price),
                volume: tick.volume,
                timestamp: tick.timestamp,
            });
    }

    pub fn get(&self, key: &str) -> Option<Quote> {
        self.quotes.get(key).map(|q| q.clone())
    }

    /// Cached quote, unless stale
    pub fn get_fresh(&self, key: &str, now: DateTime<Utc>) -> Option<Quote> {
        self.get(key).filter(|q| !self.is_stale(q, now))
    }

    pub fn len(&self) -> usize {
        self.quotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }

    /// Remove stale entries
    pub fn cleanup_stale(&self) {
        let now = Utc::now();
        let before = self.quotes.len();
        self.quotes.retain(|_, q| q.age_secs(now) <= self.ttl_secs);
        let removed = before - self.quotes.len();
        if removed > 0 {
            debug!("Removed {} stale quotes", removed);
        }
    }
}

/// Tick subscription task feeding a [`QuoteCache`], with broker quote fallback
pub struct MarketDataFeed {
    broker: Arc<dyn BrokerClient>,
    cache: QuoteCache,
    instruments: Vec<Instrument>,
    task: Mutex<Option<JoinHandle<()>>>,
    streaming: Arc<AtomicBool>,
}

impl MarketDataFeed {
    pub fn new(broker: Arc<dyn BrokerClient>, instruments: Vec<Instrument>, quote_ttl_secs: i64) -> Self {
        Self {
            broker,
            cache: QuoteCache::with_ttl(quote_ttl_secs),
            instruments,
            task: Mutex::new(None),
            streaming: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cache(&self) -> &QuoteCache {
        &self.cache
    }

    pub fn instruments(&self) -> &[Instrument] {
        &self.instruments
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    /// Start streaming. Brokers without a stream fall back to per-iteration polling;
    /// authentication and connection failures are fatal.
    pub async fn start(&self) -> Result<()> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Ok(());
        }

        match self.broker.subscribe(&self.instruments).await {
            Ok(mut rx) => {
                let cache = self.cache.clone();
                let streaming = Arc::clone(&self.streaming);
                streaming.store(true, Ordering::SeqCst);

                *task = Some(tokio::spawn(async move {
                    while let Some(tick) = rx.recv().await {
                        cache.apply_tick(&tick);
                    }
                    streaming.store(false, Ordering::SeqCst);
                    debug!("Tick stream ended");
                }));
                info!(instruments = self.instruments.len(), "Market data stream started");
            }
            Err(BrokerError::DataUnavailable(msg)) => {
                warn!("Tick stream unavailable, polling quotes instead: {}", msg);
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
            self.streaming.store(false, Ordering::SeqCst);
            info!("Market data stream stopped");
        }
    }

    /// Latest quote: a fresh streamed quote, else a broker fetch
    pub async fn latest_quote(&self, instrument: &Instrument) -> Result<Quote> {
        if self.is_streaming() {
            if let Some(quote) = self.cache.get_fresh(&instrument.key(), Utc::now()) {
                return Ok(quote);
            }
        }

        match self.broker.get_quote(instrument).await {
            Ok(quote) => {
                self.cache.insert(quote.clone());
                Ok(quote)
            }
            Err(e) => Err(TradeCoreError::MarketDataUnavailable(format!(
                "{}: {}",
                instrument, e
            ))),
        }
    }

    /// Mark prices for the given instruments, skipping any without a quote
    pub async fn mark_prices(&self, instruments: &[Instrument]) -> HashMap<String, Decimal> {
        let mut marks = HashMap::new();
        for instrument in instruments {
            match self.latest_quote(instrument).await {
                Ok(quote) => {
                    marks.insert(instrument.key(), quote.last_price);
                }
                Err(e) => warn!("No mark for {}: {}", instrument, e),
            }
        }
        marks
    }
}
