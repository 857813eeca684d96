//! Strategy Executor
//!
//! Owns the control loop and the session lifecycle:
//!
//! ```text
//! STOPPED -> RUNNING <-> PAUSED -> STOPPED
//!               |
//!               +-> ERROR (startup failure)
//! ```
//!
//! Each iteration re-marks open positions and closes those whose stop or
//! target was crossed, advances working orders, then asks the signal source
//! for a decision on every tracked instrument and runs it through admission,
//! sizing and placement.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::BrokerClient;
use crate::config::AppConfig;
use crate::domain::{
    ExitReason, Instrument, Order, OrderRequest, OrderSide, OrderStatus, Position, Quote,
    SessionState, Signal, Trade, TradingMode, TradingSession,
};
use crate::error::{Result, TradeCoreError};
use crate::persistence::TradeStore;
use crate::strategy::costs::CostModel;
use crate::strategy::market_data::MarketDataFeed;
use crate::strategy::order_manager::OrderManager;
use crate::strategy::position_tracker::{Fill, PositionTracker};
use crate::strategy::risk::{RiskManager, RiskState};
use crate::strategy::signal::{MarketView, SignalSource};

/// Loop settings derived from [`AppConfig`]
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub mode: TradingMode,
    pub strategy_name: String,
    pub instruments: Vec<Instrument>,
    pub scan_interval: Duration,
    /// Bound on how long `stop()` waits for the running iteration
    pub stop_timeout: Duration,
}

impl ExecutorConfig {
    pub fn from_app(config: &AppConfig) -> Result<Self> {
        let instruments = config
            .trading
            .instruments()
            .map_err(TradeCoreError::Validation)?;
        Ok(Self {
            mode: config.trading.mode,
            strategy_name: config.trading.strategy_name.clone(),
            instruments,
            scan_interval: Duration::from_secs(config.trading.scan_interval_seconds),
            stop_timeout: Duration::from_secs(config.trading.stop_timeout_seconds),
        })
    }
}

/// Components the executor drives, built once by the process entry point
pub struct TradingContext {
    pub risk: RiskManager,
    pub orders: OrderManager,
    pub positions: PositionTracker,
    pub feed: MarketDataFeed,
    pub signals: Arc<dyn SignalSource>,
    pub store: Arc<dyn TradeStore>,
    pub costs: CostModel,
}

impl TradingContext {
    pub fn new(
        config: &AppConfig,
        broker: Arc<dyn BrokerClient>,
        store: Arc<dyn TradeStore>,
        signals: Arc<dyn SignalSource>,
    ) -> Result<Self> {
        let instruments = config
            .trading
            .instruments()
            .map_err(TradeCoreError::Validation)?;
        let costs = config.costs.cost_model();

        Ok(Self {
            risk: RiskManager::new(config.risk.clone()),
            orders: OrderManager::new(
                config.trading.mode,
                Arc::clone(&broker),
                Arc::clone(&store),
                costs,
            ),
            positions: PositionTracker::new(costs, Arc::clone(&store)),
            feed: MarketDataFeed::new(broker, instruments, config.trading.quote_ttl_seconds),
            signals,
            store,
            costs,
        })
    }
}

/// Order placed but not yet executed, booked once it completes
#[derive(Debug, Clone)]
struct PendingFill {
    instrument: Instrument,
    side: OrderSide,
    stop_loss: Option<Decimal>,
    target: Option<Decimal>,
    /// Set for orders that close a position
    exit_reason: Option<ExitReason>,
}

/// What one control-loop iteration did
#[derive(Debug, Clone, Default)]
pub struct IterationSummary {
    pub exits_triggered: usize,
    pub signals: usize,
    pub orders_placed: usize,
    pub rejections: Vec<String>,
    pub trades: Vec<Trade>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStatus {
    pub state: SessionState,
    pub mode: TradingMode,
    pub session: Option<TradingSession>,
    pub positions: Vec<Position>,
    pub risk: RiskState,
    pub pending_orders: usize,
}

#[derive(Debug, Clone, Default)]
pub struct EmergencyStopReport {
    pub cancelled_orders: Vec<String>,
    /// Orders that executed before their cancel landed, booked before flattening
    pub filled_orders: Vec<String>,
    /// Order id and failure message
    pub failed_cancels: Vec<(String, String)>,
    pub closed: Vec<Trade>,
    /// Position key and failure message
    pub failed_closes: Vec<(String, String)>,
    pub stopped: bool,
}

struct LoopHandle {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Shared {
    ctx: TradingContext,
    config: ExecutorConfig,
    state: RwLock<SessionState>,
    session: Mutex<Option<TradingSession>>,
    pending: Mutex<HashMap<String, PendingFill>>,
    paused: AtomicBool,
    /// Held for the duration of an iteration
    iteration: Mutex<()>,
}

impl Shared {
    async fn transition(&self, to: SessionState) -> bool {
        let mut state = self.state.write().await;
        if *state == to {
            return true;
        }
        if !state.can_transition_to(to) {
            warn!(from = %*state, to = %to, "Rejected session transition");
            return false;
        }
        info!(from = %*state, to = %to, "Session state changed");
        *state = to;
        true
    }

    async fn has_pending(&self, instrument: &Instrument) -> bool {
        self.pending
            .lock()
            .await
            .values()
            .any(|p| &p.instrument == instrument)
    }

    /// Feed realized P&L into risk and the session counters
    async fn book_trades(&self, trades: &[Trade]) {
        if trades.is_empty() {
            return;
        }
        let mut session = self.session.lock().await;
        for trade in trades {
            if let Some(reason) = self.ctx.risk.update_capital(trade.pnl).await {
                error!(symbol = %trade.instrument, "Trading halted: {}", reason);
            }
            if let Some(session) = session.as_mut() {
                session.record_trade(trade);
            }
        }
    }

    /// Book an executed order with the position tracker
    async fn apply_execution(&self, order: &Order, pending: &PendingFill) -> Result<Vec<Trade>> {
        let quantity = if order.filled_quantity > 0 {
            order.filled_quantity
        } else {
            order.quantity
        };
        let price = order.average_price.or(order.price).ok_or_else(|| {
            TradeCoreError::Internal(format!("order {} executed without a price", order.id))
        })?;

        let mut fill = Fill::new(pending.instrument.clone(), pending.side, quantity, price)
            .with_levels(pending.stop_loss, pending.target)
            .with_commission(self.ctx.costs.commission(price, quantity))
            .with_strategy(self.config.strategy_name.clone())
            .with_order_id(order.id.clone());
        if let Some(reason) = pending.exit_reason {
            fill = fill.with_exit_reason(reason);
        }

        let outcome = self.ctx.positions.add_fill(fill).await?;
        self.book_trades(&outcome.trades).await;
        Ok(outcome.trades)
    }

    /// Execute `request`; book it now if complete, else remember it
    async fn execute(&self, request: OrderRequest, pending: PendingFill) -> Result<Vec<Trade>> {
        let order = self.ctx.orders.place(&request).await?;
        match order.status {
            OrderStatus::Complete => self.apply_execution(&order, &pending).await,
            status if status.is_active() => {
                debug!(order_id = %order.id, %status, "Order working, fill deferred");
                self.pending.lock().await.insert(order.id.clone(), pending);
                Ok(Vec::new())
            }
            status => Err(TradeCoreError::OrderRejected(format!(
                "order {} ended {}",
                order.id, status
            ))),
        }
    }

    /// Exit the whole position at `price` (the mark when `None`).
    /// Returns no trades while the exit order is still working.
    async fn close_position(
        &self,
        instrument: &Instrument,
        price: Option<Decimal>,
        reason: ExitReason,
    ) -> Result<Vec<Trade>> {
        let Some(position) = self.ctx.positions.get(instrument).await else {
            return Ok(Vec::new());
        };
        let reference = price.unwrap_or(position.mark_price);
        let side = position.side.exit_side();

        info!(symbol = %instrument, %reason, price = %reference, qty = position.quantity, "Closing position");
        let request = OrderRequest::market(instrument.clone(), side, position.quantity, reference)
            .with_tag(self.config.strategy_name.clone());
        self.execute(
            request,
            PendingFill {
                instrument: instrument.clone(),
                side,
                stop_loss: None,
                target: None,
                exit_reason: Some(reason),
            },
        )
        .await
    }

    /// Book working orders that reached a terminal state
    async fn settle_orders(&self, summary: &mut IterationSummary) {
        for order in self.ctx.orders.update_statuses().await {
            let Some(pending) = self.pending.lock().await.remove(&order.id) else {
                continue;
            };
            if !order.has_execution() {
                warn!(order_id = %order.id, status = %order.status, "Working order ended without a fill");
                continue;
            }
            match self.apply_execution(&order, &pending).await {
                Ok(trades) => summary.trades.extend(trades),
                Err(e) => error!(order_id = %order.id, "Failed to book execution: {}", e),
            }
        }
    }

    async fn handle_signal(
        &self,
        instrument: &Instrument,
        signal: Signal,
        quote: &Quote,
        summary: &mut IterationSummary,
    ) -> Result<()> {
        let existing = self.ctx.positions.get(instrument).await;

        let entry = match &signal {
            Signal::Close { reason } => {
                if existing.is_some() {
                    info!(symbol = %instrument, %reason, "Close signal");
                    let trades = self
                        .close_position(instrument, Some(quote.last_price), ExitReason::Signal)
                        .await?;
                    summary.trades.extend(trades);
                }
                return Ok(());
            }
            Signal::Buy(entry) | Signal::Sell(entry) => entry,
        };
        let Some(side) = signal.side() else {
            return Ok(());
        };
        let position_side = side.position_side();

        if let Some(position) = existing {
            if position.side == position_side {
                debug!(symbol = %instrument, side = %side, "Already positioned, signal ignored");
                return Ok(());
            }
            let trades = self
                .close_position(instrument, Some(quote.last_price), ExitReason::Signal)
                .await?;
            summary.trades.extend(trades);
            if self.ctx.positions.get(instrument).await.is_some() {
                // Reversal waits for the exit to execute
                return Ok(());
            }
        }

        let stop_loss = entry
            .stop_loss
            .unwrap_or_else(|| self.ctx.risk.calculate_stop_loss(entry.price, position_side));
        let target = entry
            .target
            .unwrap_or_else(|| self.ctx.risk.calculate_target(entry.price, position_side));

        let size = self
            .ctx
            .risk
            .size_position(entry.price, stop_loss, position_side)
            .await;
        if size.is_zero() {
            info!(symbol = %instrument, price = %entry.price, stop = %stop_loss, "Signal skipped: zero size");
            summary.rejections.push(format!("{}: zero size", instrument));
            return Ok(());
        }

        let open = self.ctx.positions.count().await;
        let admission = self
            .ctx
            .risk
            .validate_trade(size.quantity, entry.price, open)
            .await;
        if !admission.allowed {
            let reason = admission.reason.unwrap_or_default();
            if admission.halt_triggered {
                error!(symbol = %instrument, "Trading halted: {}", reason);
            }
            summary.rejections.push(format!("{}: {}", instrument, reason));
            return Ok(());
        }

        let request = OrderRequest::market(instrument.clone(), side, size.quantity, entry.price)
            .with_tag(self.config.strategy_name.clone());
        info!(
            symbol = %instrument, side = %side, qty = size.quantity, price = %entry.price,
            stop = %stop_loss, target = %target, reason = %entry.reason, "Entering position"
        );
        summary.orders_placed += 1;
        let trades = self
            .execute(
                request,
                PendingFill {
                    instrument: instrument.clone(),
                    side,
                    stop_loss: Some(stop_loss),
                    target: Some(target),
                    exit_reason: None,
                },
            )
            .await?;
        summary.trades.extend(trades);
        Ok(())
    }

    async fn run_iteration(&self) -> IterationSummary {
        let _guard = self.iteration.lock().await;
        let mut summary = IterationSummary::default();

        // 1. Re-mark and exit
        let held: Vec<Instrument> = self
            .ctx
            .positions
            .positions()
            .await
            .into_iter()
            .map(|p| p.instrument)
            .collect();
        if !held.is_empty() {
            let marks = self.ctx.feed.mark_prices(&held).await;
            for trigger in self.ctx.positions.refresh(&marks).await {
                if self.has_pending(&trigger.instrument).await {
                    continue;
                }
                summary.exits_triggered += 1;
                info!(
                    symbol = %trigger.instrument, reason = %trigger.reason,
                    level = %trigger.level, mark = %trigger.mark, "Exit triggered"
                );
                match self
                    .close_position(&trigger.instrument, Some(trigger.mark), trigger.reason)
                    .await
                {
                    Ok(trades) => summary.trades.extend(trades),
                    Err(e) => warn!(symbol = %trigger.instrument, "Exit failed: {}", e),
                }
            }
        }

        // 2. Working orders
        self.settle_orders(&mut summary).await;

        // 3. Signals
        for instrument in &self.config.instruments {
            if self.has_pending(instrument).await {
                debug!(symbol = %instrument, "Order working, skipping evaluation");
                continue;
            }
            let quote = match self.ctx.feed.latest_quote(instrument).await {
                Ok(quote) => quote,
                Err(e) => {
                    warn!(symbol = %instrument, "No quote: {}", e);
                    continue;
                }
            };
            let has_position = self.ctx.positions.get(instrument).await.is_some();

            let signal = match self
                .ctx
                .signals
                .evaluate(instrument, MarketView::Quote(&quote), has_position)
                .await
            {
                Ok(Some(signal)) => signal,
                Ok(None) => continue,
                Err(e) => {
                    warn!(symbol = %instrument, "Signal evaluation failed: {}", e);
                    continue;
                }
            };
            if let Err(e) = signal.validate() {
                warn!(symbol = %instrument, "Invalid signal dropped: {}", e);
                continue;
            }

            summary.signals += 1;
            debug!(symbol = %instrument, ?signal, "Signal received");
            if let Err(e) = self.handle_signal(instrument, signal, &quote, &mut summary).await {
                warn!(symbol = %instrument, "Signal execution failed: {}", e);
            }
        }

        summary
    }

    /// Finalize and persist the session, stop the feed, enter STOPPED
    async fn teardown(&self) -> bool {
        self.ctx.feed.stop().await;

        let mut ok = true;
        let final_capital = self.ctx.risk.capital().await;
        let unrealized = self.ctx.positions.unrealized_pnl().await;
        if let Some(mut session) = self.session.lock().await.take() {
            session.finalize(final_capital, unrealized);
            if let Err(e) = self.ctx.store.update_session(&session).await {
                error!(session_id = %session.id, "Failed to finalize session: {}", e);
                ok = false;
            }
            info!(
                session_id = %session.id, trades = session.total_trades,
                realized = %session.realized_pnl, capital = %final_capital, "Session finalized"
            );
        }
        self.ctx.positions.set_session(None).await;
        self.paused.store(false, Ordering::SeqCst);
        ok && self.transition(SessionState::Stopped).await
    }
}

/// Runs the live control loop over a [`TradingContext`]
pub struct StrategyExecutor {
    shared: Arc<Shared>,
    runner: Mutex<Option<LoopHandle>>,
}

impl StrategyExecutor {
    pub fn new(ctx: TradingContext, config: ExecutorConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                ctx,
                config,
                state: RwLock::new(SessionState::Stopped),
                session: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                paused: AtomicBool::new(false),
                iteration: Mutex::new(()),
            }),
            runner: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &TradingContext {
        &self.shared.ctx
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.shared.config
    }

    pub async fn state(&self) -> SessionState {
        *self.shared.state.read().await
    }

    pub async fn session(&self) -> Option<TradingSession> {
        self.shared.session.lock().await.clone()
    }

    /// Open a session, start market data and spawn the loop.
    /// Returns false if already running or startup failed.
    pub async fn start(&self) -> bool {
        let mut runner = self.runner.lock().await;
        if runner.is_some() || self.state().await.is_active() {
            warn!("Executor already running");
            return false;
        }
        let shared = &self.shared;
        if !shared.transition(SessionState::Running).await {
            return false;
        }

        if let Err(e) = shared.ctx.feed.start().await {
            error!("Market data startup failed: {}", e);
            shared.transition(SessionState::Error).await;
            return false;
        }

        let capital = shared.ctx.risk.capital().await;
        let session = TradingSession::new(shared.config.mode, shared.config.strategy_name.clone(), capital);
        if let Err(e) = shared.ctx.store.create_session(&session).await {
            error!("Failed to open trading session: {}", e);
            shared.ctx.feed.stop().await;
            shared.transition(SessionState::Error).await;
            return false;
        }
        shared.ctx.positions.set_session(Some(session.id)).await;
        info!(
            session_id = %session.id, mode = %shared.config.mode, %capital,
            instruments = shared.config.instruments.len(), "Trading session started"
        );
        *shared.session.lock().await = Some(session);
        shared.paused.store(false, Ordering::SeqCst);

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let loop_shared = Arc::clone(shared);
        let interval = shared.config.scan_interval;
        let handle = tokio::spawn(async move {
            loop {
                if *stop_rx.borrow() {
                    break;
                }
                if loop_shared.paused.load(Ordering::SeqCst) {
                    debug!("Paused, iteration skipped");
                } else {
                    let summary = loop_shared.run_iteration().await;
                    debug!(
                        signals = summary.signals, orders = summary.orders_placed,
                        closed = summary.trades.len(), "Iteration complete"
                    );
                }
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            debug!("Control loop exited");
        });

        *runner = Some(LoopHandle { stop_tx, handle });
        true
    }

    /// Signal the loop and wait (bounded) for it. `None` when no loop was running.
    async fn halt_loop(&self) -> Option<bool> {
        let LoopHandle { stop_tx, mut handle } = self.runner.lock().await.take()?;
        let _ = stop_tx.send(true);

        match tokio::time::timeout(self.shared.config.stop_timeout, &mut handle).await {
            Ok(Ok(())) => Some(true),
            Ok(Err(e)) => {
                error!("Control loop panicked: {}", e);
                Some(false)
            }
            Err(_) => {
                error!(
                    timeout_secs = self.shared.config.stop_timeout.as_secs(),
                    "Control loop did not stop in time, aborting"
                );
                handle.abort();
                Some(false)
            }
        }
    }

    /// Stop the loop, stop market data and finalize the session.
    /// Returns false when nothing was running or a step failed.
    pub async fn stop(&self) -> bool {
        let joined = self.halt_loop().await;
        let state = self.state().await;
        if joined.is_none() && state == SessionState::Stopped {
            debug!("Stop requested while stopped");
            return false;
        }
        let finalized = self.shared.teardown().await;
        info!("Executor stopped");
        joined.unwrap_or(true) && finalized
    }

    pub async fn pause(&self) -> bool {
        if self.state().await != SessionState::Running {
            return false;
        }
        if !self.shared.transition(SessionState::Paused).await {
            return false;
        }
        self.shared.paused.store(true, Ordering::SeqCst);
        true
    }

    pub async fn resume(&self) -> bool {
        if self.state().await != SessionState::Paused {
            return false;
        }
        self.shared.paused.store(false, Ordering::SeqCst);
        self.shared.transition(SessionState::Running).await
    }

    /// Cancel every working order, flatten every position, then stop.
    /// Best effort: individual failures are logged and reported, never abort the sweep.
    pub async fn emergency_stop(&self) -> EmergencyStopReport {
        error!("EMERGENCY STOP");
        let shared = &self.shared;
        let joined = self.halt_loop().await;
        let mut report = EmergencyStopReport::default();

        let cancels = shared.ctx.orders.cancel_all().await;
        let mut finished = Vec::new();
        for (id, _) in &cancels.failed {
            if let Some(order) = shared.ctx.orders.order(id).await {
                if order.status.is_terminal() {
                    finished.push(order.id);
                }
            }
        }
        let mut executed = Vec::new();
        {
            let mut pending = shared.pending.lock().await;
            for id in cancels.cancelled.iter().chain(&finished) {
                pending.remove(id);
            }
            for order in &cancels.filled {
                match pending.remove(&order.id) {
                    Some(fill) => executed.push((order.clone(), fill)),
                    None => warn!(order_id = %order.id, "Executed order has no pending fill"),
                }
            }
        }

        // Fills that beat the cancel open or close positions; the sweep below flattens them
        for (order, fill) in executed {
            warn!(
                order_id = %order.id, symbol = %fill.instrument, qty = order.filled_quantity,
                "Order executed before cancel, booking fill"
            );
            report.filled_orders.push(order.id.clone());
            match shared.apply_execution(&order, &fill).await {
                Ok(trades) => report.closed.extend(trades),
                Err(e) => {
                    error!(order_id = %order.id, "Failed to book execution: {}", e);
                    report.failed_closes.push((fill.instrument.key(), e.to_string()));
                }
            }
        }
        report.cancelled_orders = cancels.cancelled;
        report.failed_cancels = cancels.failed;

        for position in shared.ctx.positions.positions().await {
            let instrument = &position.instrument;
            let price = match shared.ctx.feed.latest_quote(instrument).await {
                Ok(quote) => quote.last_price,
                Err(e) => {
                    warn!(symbol = %instrument, "No quote, closing at last mark: {}", e);
                    position.mark_price
                }
            };
            match shared.close_position(instrument, Some(price), ExitReason::Manual).await {
                Ok(trades) if !trades.is_empty() => report.closed.extend(trades),
                Ok(_) => {
                    error!(symbol = %instrument, "Emergency exit order not filled");
                    report
                        .failed_closes
                        .push((position.key(), "exit order working".to_string()));
                }
                Err(e) => {
                    error!(symbol = %instrument, "Emergency exit failed: {}", e);
                    report.failed_closes.push((position.key(), e.to_string()));
                }
            }
        }

        report.stopped = if joined.is_some() || self.state().await != SessionState::Stopped {
            let finalized = shared.teardown().await;
            joined.unwrap_or(true) && finalized
        } else {
            true
        };
        info!(
            cancelled = report.cancelled_orders.len(), filled = report.filled_orders.len(),
            closed = report.closed.len(),
            failures = report.failed_cancels.len() + report.failed_closes.len(),
            at = %Utc::now(), "Emergency stop complete"
        );
        report
    }

    /// One pass of the control loop
    pub async fn run_iteration(&self) -> IterationSummary {
        self.shared.run_iteration().await
    }

    pub async fn status(&self) -> ExecutorStatus {
        let shared = &self.shared;
        ExecutorStatus {
            state: self.state().await,
            mode: shared.config.mode,
            session: self.session().await,
            positions: shared.ctx.positions.positions().await,
            risk: shared.ctx.risk.snapshot().await,
            pending_orders: shared.ctx.orders.pending_count().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::replay::ReplayBroker;
    use crate::broker::{BrokerResult, CandleInterval};
    use crate::domain::{Candle, OrderAck};
    use chrono::DateTime;
    use crate::persistence::MemoryStore;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use rust_decimal_macros::dec;
    use std::sync::Mutex as StdMutex;

    /// Hands out queued signals in order
    struct Scripted {
        queue: StdMutex<Vec<Option<Signal>>>,
    }

    impl Scripted {
        fn new(mut signals: Vec<Option<Signal>>) -> Self {
            signals.reverse();
            Self {
                queue: StdMutex::new(signals),
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

    fn inst() -> Instrument {
        Instrument::new("NSE", "SBIN")
    }

    fn candles(closes: &[(i64, i64, i64)]) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 3, 4, 9, 15, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &(low, high, close))| Candle {
                timestamp: start + ChronoDuration::minutes(i as i64),
                open: Decimal::from(close),
                high: Decimal::from(high),
                low: Decimal::from(low),
                close: Decimal::from(close),
                volume: dec!(100),
            })
            .collect()
    }

    /// Replay venue whose first order rests and then fills as its cancel arrives
    struct FillsOnCancel {
        inner: Arc<ReplayBroker>,
        resting: StdMutex<Option<String>>,
    }

    impl FillsOnCancel {
        const HELD: &'static str = "HELD-1";

        fn new(inner: Arc<ReplayBroker>) -> Self {
            Self {
                inner,
                resting: StdMutex::new(None),
            }
        }

        fn held_ack(status: OrderStatus, filled_quantity: u64, average_price: Option<Decimal>) -> OrderAck {
            OrderAck {
                order_id: Self::HELD.to_string(),
                status,
                filled_quantity,
                average_price,
                message: None,
                raw: None,
            }
        }
    }

    #[async_trait]
    impl BrokerClient for FillsOnCancel {
        fn name(&self) -> &str {
            "fills-on-cancel"
        }

        async fn get_quote(&self, instrument: &Instrument) -> BrokerResult<Quote> {
            self.inner.get_quote(instrument).await
        }

        async fn get_historical_candles(
            &self,
            instrument: &Instrument,
            interval: CandleInterval,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> BrokerResult<Vec<Candle>> {
            self.inner.get_historical_candles(instrument, interval, from, to).await
        }

        async fn place_order(&self, request: &OrderRequest) -> BrokerResult<OrderAck> {
            let first = self.resting.lock().unwrap().replace(Self::HELD.to_string()).is_none();
            if first {
                return Ok(Self::held_ack(OrderStatus::Open, 0, None));
            }
            self.inner.place_order(request).await
        }

        async fn cancel_order(&self, order_id: &str) -> BrokerResult<OrderAck> {
            if order_id == Self::HELD {
                return Ok(Self::held_ack(OrderStatus::Complete, 100, Some(dec!(500))));
            }
            self.inner.cancel_order(order_id).await
        }

        async fn get_order_status(&self, order_id: &str) -> BrokerResult<OrderAck> {
            if order_id == Self::HELD {
                return Ok(Self::held_ack(OrderStatus::Open, 0, None));
            }
            self.inner.get_order_status(order_id).await
        }
    }

    fn executor(
        mode: TradingMode,
        broker: Arc<dyn BrokerClient>,
        store: Arc<MemoryStore>,
        signals: Vec<Option<Signal>>,
    ) -> StrategyExecutor {
        let mut config = AppConfig::default_config(mode, vec!["NSE:SBIN".into()]);
        config.trading.scan_interval_seconds = 1;
        config.trading.stop_timeout_seconds = 2;
        let ctx = TradingContext::new(&config, broker, store, Arc::new(Scripted::new(signals))).unwrap();
        StrategyExecutor::new(ctx, ExecutorConfig::from_app(&config).unwrap())
    }

    #[tokio::test]
    async fn test_paper_entry_then_stop_exit() {
        let broker = Arc::new(
            ReplayBroker::new()
                .with_series(inst(), candles(&[(499, 501, 500), (480, 500, 485)]))
                .without_stream(),
        );
        let store = Arc::new(MemoryStore::new());
        let buy = Signal::buy(dec!(500), Some(dec!(490)), Some(dec!(520)), "test");
        let exec = executor(TradingMode::Paper, broker.clone(), Arc::clone(&store), vec![Some(buy)]);

        let summary = exec.run_iteration().await;
        assert_eq!(summary.orders_placed, 1);
        // 1000 risk / 10 per share = 100 shares; 50% cap = 100 shares
        let position = exec.context().positions.get(&inst()).await.unwrap();
        assert_eq!(position.quantity, 100);

        broker.advance().await;
        let summary = exec.run_iteration().await;
        assert_eq!(summary.exits_triggered, 1);
        assert_eq!(summary.trades.len(), 1);
        let trade = &summary.trades[0];
        assert_eq!(trade.exit_reason, ExitReason::StopLoss);
        assert_eq!(trade.pnl, dec!(-1500));
        assert_eq!(exec.context().risk.capital().await, dec!(98500));
        assert_eq!(store.orders().await.len(), 2);
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let broker = Arc::new(
            ReplayBroker::new()
                .with_series(inst(), candles(&[(99, 101, 100)]))
                .without_stream(),
        );
        let store = Arc::new(MemoryStore::new());
        let exec = executor(TradingMode::Paper, broker, Arc::clone(&store), vec![]);

        assert!(!exec.stop().await);
        assert!(exec.start().await);
        assert!(!exec.start().await);
        assert_eq!(exec.state().await, SessionState::Running);

        assert!(exec.pause().await);
        assert_eq!(exec.state().await, SessionState::Paused);
        assert!(!exec.pause().await);
        assert!(exec.resume().await);

        assert!(exec.stop().await);
        assert_eq!(exec.state().await, SessionState::Stopped);
        let sessions = store.sessions().await;
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].is_finalized());
        assert_eq!(sessions[0].final_capital, Some(dec!(100000)));
    }

    #[tokio::test]
    async fn test_emergency_stop_flattens_and_is_idempotent() {
        let broker = Arc::new(
            ReplayBroker::new()
                .with_series(inst(), candles(&[(499, 501, 500), (500, 512, 510)]))
                .without_stream(),
        );
        let store = Arc::new(MemoryStore::new());
        let buy = Signal::buy(dec!(500), Some(dec!(490)), Some(dec!(600)), "test");
        let exec = executor(TradingMode::Live, broker.clone(), store, vec![Some(buy)]);

        exec.run_iteration().await;
        assert_eq!(exec.context().positions.count().await, 1);
        broker.advance().await;

        let report = exec.emergency_stop().await;
        assert_eq!(report.closed.len(), 1);
        assert_eq!(report.closed[0].exit_reason, ExitReason::Manual);
        assert_eq!(report.closed[0].exit_price, dec!(510));
        assert!(report.failed_closes.is_empty());
        assert_eq!(exec.context().positions.count().await, 0);

        let again = exec.emergency_stop().await;
        assert!(again.closed.is_empty());
        assert!(again.stopped);
        assert_eq!(exec.state().await, SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_emergency_stop_books_fill_reported_by_cancel() {
        let replay = Arc::new(
            ReplayBroker::new()
                .with_series(inst(), candles(&[(499, 501, 500), (500, 512, 510)]))
                .without_stream(),
        );
        let venue = Arc::new(FillsOnCancel::new(Arc::clone(&replay)));
        let store = Arc::new(MemoryStore::new());
        let buy = Signal::buy(dec!(500), Some(dec!(490)), Some(dec!(600)), "test");
        let exec = executor(TradingMode::Live, venue, Arc::clone(&store), vec![Some(buy)]);

        let summary = exec.run_iteration().await;
        assert_eq!(summary.orders_placed, 1);
        assert_eq!(exec.context().positions.count().await, 0);
        assert_eq!(exec.context().orders.pending_count().await, 1);
        replay.advance().await;

        let report = exec.emergency_stop().await;
        assert!(report.cancelled_orders.is_empty());
        assert_eq!(report.filled_orders, vec![FillsOnCancel::HELD.to_string()]);
        assert!(report.failed_cancels.is_empty());

        // The late fill opened a position that the sweep then flattened
        assert_eq!(report.closed.len(), 1);
        let trade = &report.closed[0];
        assert_eq!(trade.quantity, 100);
        assert_eq!(trade.entry_price, dec!(500));
        assert_eq!(trade.exit_price, dec!(510));
        assert_eq!(trade.exit_reason, ExitReason::Manual);
        assert!(report.failed_closes.is_empty());
        assert_eq!(exec.context().positions.count().await, 0);

        let held = store.order(FillsOnCancel::HELD).await.unwrap();
        assert_eq!(held.status, OrderStatus::Complete);
        assert_eq!(held.filled_quantity, 100);
    }

    #[tokio::test]
    async fn test_live_placement_failure_leaves_no_position() {
        let broker = Arc::new(
            ReplayBroker::new()
                .with_series(inst(), candles(&[(499, 501, 500)]))
                .without_stream(),
        );
        broker
            .fail_next_order(crate::error::BrokerError::OrderRejected("margin".into()))
            .await;
        let store = Arc::new(MemoryStore::new());
        let buy = Signal::buy(dec!(500), Some(dec!(490)), None, "test");
        let exec = executor(TradingMode::Live, broker, Arc::clone(&store), vec![Some(buy)]);

        exec.run_iteration().await;
        assert_eq!(exec.context().positions.count().await, 0);
        let orders = store.orders().await;
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, OrderStatus::Failed);
    }

    #[tokio::test]
    async fn test_opposite_signal_reverses() {
        let broker = Arc::new(
            ReplayBroker::new()
                .with_series(inst(), candles(&[(499, 501, 500), (505, 511, 510)]))
                .without_stream(),
        );
        let store = Arc::new(MemoryStore::new());
        let buy = Signal::buy(dec!(500), Some(dec!(490)), Some(dec!(600)), "up");
        let sell = Signal::sell(dec!(510), Some(dec!(520)), Some(dec!(480)), "down");
        let exec = executor(TradingMode::Paper, broker.clone(), store, vec![Some(buy), Some(sell)]);

        exec.run_iteration().await;
        broker.advance().await;
        let summary = exec.run_iteration().await;

        assert_eq!(summary.trades.len(), 1);
        assert_eq!(summary.trades[0].exit_reason, ExitReason::Signal);
        assert_eq!(summary.trades[0].pnl, dec!(1000));
        let position = exec.context().positions.get(&inst()).await.unwrap();
        assert_eq!(position.side, crate::domain::PositionSide::Short);
    }
}
