//! Candle replay venue
//!
//! Serves historical candles as if they were live: quotes and ticks come from
//! the candle under a shared cursor, market orders execute at its close and
//! limit orders rest until a later candle trades through the limit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::broker::{BrokerClient, BrokerPosition, BrokerResult, CandleInterval, Margins};
use crate::domain::{
    Candle, Instrument, ModifyRequest, OrderAck, OrderRequest, OrderSide, OrderStatus, OrderType,
    Quote, Tick,
};
use crate::error::BrokerError;

const TICK_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct ReplayOrder {
    request: OrderRequest,
    status: OrderStatus,
    average_price: Option<Decimal>,
}

impl ReplayOrder {
    fn ack(&self, order_id: &str) -> OrderAck {
        let filled = if self.status == OrderStatus::Complete {
            self.request.quantity
        } else {
            0
        };
        OrderAck {
            order_id: order_id.to_string(),
            status: self.status,
            filled_quantity: filled,
            average_price: self.average_price,
            message: None,
            raw: None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Holding {
    quantity: i64,
    average_price: Decimal,
}

impl Holding {
    fn apply(&mut self, side: OrderSide, quantity: u64, price: Decimal) {
        let signed = match side {
            OrderSide::Buy => quantity as i64,
            OrderSide::Sell => -(quantity as i64),
        };
        let next = self.quantity + signed;
        if self.quantity == 0 || self.quantity.signum() == signed.signum() {
            let old = Decimal::from(self.quantity.abs());
            let add = Decimal::from(signed.abs());
            self.average_price = (self.average_price * old + price * add) / (old + add);
        } else if next != 0 && next.signum() != self.quantity.signum() {
            self.average_price = price;
        }
        self.quantity = next;
        if self.quantity == 0 {
            self.average_price = Decimal::ZERO;
        }
    }
}

#[derive(Default)]
struct ReplayState {
    cursor: usize,
    next_id: u64,
    orders: HashMap<String, ReplayOrder>,
    holdings: HashMap<String, (Instrument, Holding)>,
    fail_next: Option<BrokerError>,
}

/// Replays candle series through the [`BrokerClient`] interface
pub struct ReplayBroker {
    series: Arc<HashMap<String, (Instrument, Vec<Candle>)>>,
    state: Arc<Mutex<ReplayState>>,
    tick_interval: Duration,
    streaming: bool,
    cash: Decimal,
}

impl Default for ReplayBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayBroker {
    pub fn new() -> Self {
        Self {
            series: Arc::new(HashMap::new()),
            state: Arc::new(Mutex::new(ReplayState::default())),
            tick_interval: Duration::from_secs(1),
            streaming: true,
            cash: Decimal::ZERO,
        }
    }

    /// Add a candle series for one instrument, sorted oldest first
    pub fn with_series(mut self, instrument: Instrument, mut candles: Vec<Candle>) -> Self {
        candles.sort_by_key(|c| c.timestamp);
        Arc::make_mut(&mut self.series).insert(instrument.key(), (instrument, candles));
        self
    }

    /// Delay between replayed candles on the tick stream
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Disable the tick stream so the cursor only moves through [`advance`](Self::advance)
    pub fn without_stream(mut self) -> Self {
        self.streaming = false;
        self
    }

    pub fn with_cash(mut self, cash: Decimal) -> Self {
        self.cash = cash;
        self
    }

    pub fn instruments(&self) -> Vec<Instrument> {
        self.series.values().map(|(i, _)| i.clone()).collect()
    }

    /// Number of steps in the longest series
    pub fn len(&self) -> usize {
        self.series.values().map(|(_, c)| c.len()).max().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn cursor(&self) -> usize {
        self.state.lock().await.cursor
    }

    /// Move every series one candle forward. Returns false once all are exhausted.
    pub async fn advance(&self) -> bool {
        advance_cursor(&self.series, &self.state).await
    }

    /// Fail the next placement with `error`
    pub async fn fail_next_order(&self, error: BrokerError) {
        self.state.lock().await.fail_next = Some(error);
    }

    fn current(&self, key: &str, cursor: usize) -> Option<&Candle> {
        current_candle(&self.series, key, cursor)
    }

    fn instrument_candle(&self, instrument: &Instrument, cursor: usize) -> BrokerResult<&Candle> {
        self.current(&instrument.key(), cursor)
            .ok_or_else(|| BrokerError::DataUnavailable(format!("no replay data for {}", instrument)))
    }

    /// Fill a resting limit order if the current candle traded through its price
    fn try_fill_limit(&self, order: &mut ReplayOrder, cursor: usize) {
        if order.status != OrderStatus::Open {
            return;
        }
        let Some(limit) = order.request.price else {
            return;
        };
        let Some(candle) = self.current(&order.request.instrument.key(), cursor) else {
            return;
        };
        let crossed = match order.request.side {
            OrderSide::Buy => candle.low <= limit,
            OrderSide::Sell => candle.high >= limit,
        };
        if crossed {
            order.status = OrderStatus::Complete;
            order.average_price = Some(limit);
        }
    }
}

fn current_candle<'a>(
    series: &'a HashMap<String, (Instrument, Vec<Candle>)>,
    key: &str,
    cursor: usize,
) -> Option<&'a Candle> {
    let (_, candles) = series.get(key)?;
    candles.get(cursor.min(candles.len().checked_sub(1)?))
}

async fn advance_cursor(
    series: &HashMap<String, (Instrument, Vec<Candle>)>,
    state: &Mutex<ReplayState>,
) -> bool {
    let longest = series.values().map(|(_, c)| c.len()).max().unwrap_or(0);
    let mut state = state.lock().await;
    if state.cursor + 1 >= longest {
        return false;
    }
    state.cursor += 1;
    true
}

fn tick_from(instrument: &Instrument, candle: &Candle, at: DateTime<Utc>) -> Tick {
    Tick {
        instrument: instrument.clone(),
        last_price: candle.close,
        volume: Some(candle.volume),
        timestamp: at,
    }
}

fn book_fill(state: &mut ReplayState, order: &ReplayOrder) {
    let Some(price) = order.average_price else {
        return;
    };
    let instrument = &order.request.instrument;
    let entry = state
        .holdings
        .entry(instrument.key())
        .or_insert_with(|| (instrument.clone(), Holding::default()));
    entry.1.apply(order.request.side, order.request.quantity, price);
}

#[async_trait]
impl BrokerClient for ReplayBroker {
    fn name(&self) -> &str {
        "replay"
    }

    async fn get_quote(&self, instrument: &Instrument) -> BrokerResult<Quote> {
        let cursor = self.state.lock().await.cursor;
        let candle = self.instrument_candle(instrument, cursor)?;
        Ok(Quote {
            instrument: instrument.clone(),
            last_price: candle.close,
            best_bid: None,
            best_ask: None,
            high: Some(candle.high),
            low: Some(candle.low),
            volume: Some(candle.volume),
            timestamp: Utc::now(),
        })
    }

    async fn get_historical_candles(
        &self,
        instrument: &Instrument,
        _interval: CandleInterval,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> BrokerResult<Vec<Candle>> {
        let (_, candles) = self
            .series
            .get(&instrument.key())
            .ok_or_else(|| BrokerError::DataUnavailable(format!("no replay data for {}", instrument)))?;
        Ok(candles
            .iter()
            .filter(|c| c.timestamp >= from && c.timestamp <= to)
            .cloned()
            .collect())
    }

    async fn place_order(&self, request: &OrderRequest) -> BrokerResult<OrderAck> {
        let mut state = self.state.lock().await;
        if let Some(error) = state.fail_next.take() {
            return Err(error);
        }
        let candle = self.instrument_candle(&request.instrument, state.cursor)?.clone();

        state.next_id += 1;
        let order_id = format!("R-{}", state.next_id);
        let order = match request.order_type {
            OrderType::Market => ReplayOrder {
                request: request.clone(),
                status: OrderStatus::Complete,
                average_price: Some(candle.close),
            },
            OrderType::Limit => {
                let mut order = ReplayOrder {
                    request: request.clone(),
                    status: OrderStatus::Open,
                    average_price: None,
                };
                self.try_fill_limit(&mut order, state.cursor);
                order
            }
            other => {
                return Err(BrokerError::OrderRejected(format!(
                    "{} orders are not supported by the replay venue",
                    other
                )))
            }
        };

        if order.status == OrderStatus::Complete {
            book_fill(&mut state, &order);
        }
        debug!(order_id = %order_id, status = %order.status, "Replay order accepted");
        let ack = order.ack(&order_id);
        state.orders.insert(order_id, order);
        Ok(ack)
    }

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<OrderAck> {
        let mut state = self.state.lock().await;
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| BrokerError::OrderRejected(format!("unknown order {}", order_id)))?;
        if order.status.is_terminal() {
            return Err(BrokerError::OrderRejected(format!(
                "order {} is already {}",
                order_id, order.status
            )));
        }
        order.status = OrderStatus::Cancelled;
        Ok(order.ack(order_id))
    }

    async fn get_order_status(&self, order_id: &str) -> BrokerResult<OrderAck> {
        let mut state = self.state.lock().await;
        let cursor = state.cursor;
        let mut order = state
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| BrokerError::DataUnavailable(format!("unknown order {}", order_id)))?;

        let was_open = order.status == OrderStatus::Open;
        self.try_fill_limit(&mut order, cursor);
        if was_open && order.status == OrderStatus::Complete {
            book_fill(&mut state, &order);
        }
        let ack = order.ack(order_id);
        state.orders.insert(order_id.to_string(), order);
        Ok(ack)
    }

    async fn modify_order(&self, order_id: &str, modify: &ModifyRequest) -> BrokerResult<OrderAck> {
        let mut state = self.state.lock().await;
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| BrokerError::OrderRejected(format!("unknown order {}", order_id)))?;
        if order.status.is_terminal() {
            return Err(BrokerError::OrderRejected(format!(
                "order {} is already {}",
                order_id, order.status
            )));
        }
        if let Some(quantity) = modify.quantity {
            order.request.quantity = quantity;
        }
        if let Some(price) = modify.price {
            order.request.price = Some(price);
        }
        Ok(order.ack(order_id))
    }

    async fn get_positions(&self) -> BrokerResult<Vec<BrokerPosition>> {
        let state = self.state.lock().await;
        Ok(state
            .holdings
            .iter()
            .filter(|(_, (_, h))| h.quantity != 0)
            .map(|(key, (instrument, holding))| {
                let last = self
                    .current(key, state.cursor)
                    .map(|c| c.close)
                    .unwrap_or(holding.average_price);
                BrokerPosition {
                    instrument: instrument.clone(),
                    quantity: holding.quantity,
                    average_price: holding.average_price,
                    last_price: last,
                    pnl: (last - holding.average_price) * Decimal::from(holding.quantity),
                }
            })
            .collect())
    }

    async fn get_margins(&self) -> BrokerResult<Margins> {
        let state = self.state.lock().await;
        let used: Decimal = state
            .holdings
            .values()
            .map(|(_, h)| h.average_price * Decimal::from(h.quantity.abs()))
            .sum();
        Ok(Margins {
            available: self.cash - used,
            used,
            total: self.cash,
        })
    }

    async fn subscribe(&self, instruments: &[Instrument]) -> BrokerResult<mpsc::Receiver<Tick>> {
        if !self.streaming {
            return Err(BrokerError::DataUnavailable("replay stream disabled".into()));
        }

        let (tx, rx) = mpsc::channel(TICK_CHANNEL_CAPACITY);
        let series = Arc::clone(&self.series);
        let state = Arc::clone(&self.state);
        let interval = self.tick_interval;
        let wanted: Vec<Instrument> = instruments.to_vec();

        info!(instruments = wanted.len(), "Replay stream started");
        tokio::spawn(async move {
            loop {
                let cursor = state.lock().await.cursor;
                let now = Utc::now();
                for instrument in &wanted {
                    if let Some(candle) = current_candle(&series, &instrument.key(), cursor) {
                        if tx.send(tick_from(instrument, candle, now)).await.is_err() {
                            return;
                        }
                    }
                }
                tokio::time::sleep(interval).await;
                if !advance_cursor(&series, &state).await {
                    debug!("Replay data exhausted");
                    return;
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use rust_decimal_macros::dec;

    fn inst() -> Instrument {
        Instrument::new("NSE", "TCS")
    }

    fn candle(minute: i64, low: Decimal, high: Decimal, close: Decimal) -> Candle {
        Candle {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 2, 9, 15, 0).unwrap() + ChronoDuration::minutes(minute),
            open: close,
            high,
            low,
            close,
            volume: dec!(1000),
        }
    }

    fn broker() -> ReplayBroker {
        ReplayBroker::new()
            .with_series(
                inst(),
                vec![
                    candle(0, dec!(99), dec!(101), dec!(100)),
                    candle(1, dec!(94), dec!(100), dec!(95)),
                    candle(2, dec!(95), dec!(105), dec!(104)),
                ],
            )
            .with_cash(dec!(100000))
            .without_stream()
    }

    #[tokio::test]
    async fn test_quotes_follow_cursor() {
        let broker = broker();
        assert_eq!(broker.get_quote(&inst()).await.unwrap().last_price, dec!(100));
        assert!(broker.advance().await);
        assert_eq!(broker.get_quote(&inst()).await.unwrap().last_price, dec!(95));
        assert!(broker.advance().await);
        assert!(!broker.advance().await);
        assert_eq!(broker.cursor().await, 2);
    }

    #[tokio::test]
    async fn test_market_order_fills_at_close() {
        let broker = broker();
        let ack = broker
            .place_order(&OrderRequest::market(inst(), OrderSide::Buy, 10, dec!(100)))
            .await
            .unwrap();
        assert_eq!(ack.order_id, "R-1");
        assert_eq!(ack.status, OrderStatus::Complete);
        assert_eq!(ack.average_price, Some(dec!(100)));

        let positions = broker.get_positions().await.unwrap();
        assert_eq!(positions[0].quantity, 10);
        assert_eq!(broker.get_margins().await.unwrap().used, dec!(1000));
    }

    #[tokio::test]
    async fn test_limit_order_rests_until_crossed() {
        let broker = broker();
        let ack = broker
            .place_order(&OrderRequest::limit(inst(), OrderSide::Buy, 5, dec!(96)))
            .await
            .unwrap();
        assert_eq!(ack.status, OrderStatus::Open);

        broker.advance().await;
        let ack = broker.get_order_status(&ack.order_id).await.unwrap();
        assert_eq!(ack.status, OrderStatus::Complete);
        assert_eq!(ack.average_price, Some(dec!(96)));
        assert_eq!(ack.filled_quantity, 5);
    }

    #[tokio::test]
    async fn test_cancel_and_injected_failure() {
        let broker = broker();
        let ack = broker
            .place_order(&OrderRequest::limit(inst(), OrderSide::Sell, 5, dec!(120)))
            .await
            .unwrap();
        let cancelled = broker.cancel_order(&ack.order_id).await.unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert!(broker.cancel_order(&ack.order_id).await.is_err());

        broker.fail_next_order(BrokerError::RateLimited("slow down".into())).await;
        let err = broker
            .place_order(&OrderRequest::market(inst(), OrderSide::Buy, 1, dec!(100)))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_historical_window() {
        let broker = broker();
        let from = Utc.with_ymd_and_hms(2024, 1, 2, 9, 16, 0).unwrap();
        let to = from + ChronoDuration::minutes(10);
        let candles = broker
            .get_historical_candles(&inst(), CandleInterval::Minute, from, to)
            .await
            .unwrap();
        assert_eq!(candles.len(), 2);
        assert!(broker
            .get_quote(&Instrument::new("NSE", "WIPRO"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_stream_emits_each_candle() {
        let broker = ReplayBroker::new()
            .with_series(
                inst(),
                vec![
                    candle(0, dec!(99), dec!(101), dec!(100)),
                    candle(1, dec!(94), dec!(100), dec!(95)),
                ],
            )
            .with_tick_interval(Duration::from_millis(1));
        let mut rx = broker.subscribe(&[inst()]).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.last_price, dec!(100));
        assert_eq!(second.last_price, dec!(95));
        assert!(rx.recv().await.is_none());
    }
}
