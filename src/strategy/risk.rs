use chrono::{NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::RiskConfig;
use crate::domain::PositionSide;
use crate::error::RiskError;

/// Result of risk-based sizing. Zero quantity means "skip this signal".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionSize {
    pub quantity: u64,
    /// `quantity * risk_per_share`
    pub risk_amount: Decimal,
    pub risk_per_share: Decimal,
}

impl PositionSize {
    pub fn zero() -> Self {
        Self {
            quantity: 0,
            risk_amount: Decimal::ZERO,
            risk_per_share: Decimal::ZERO,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.quantity == 0
    }
}

/// Risk-per-trade sizing, shared by the live risk manager and the backtest
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionSizer {
    pub max_risk_per_trade_pct: Decimal,
    pub max_position_size_pct: Decimal,
}

impl PositionSizer {
    pub fn new(max_risk_per_trade_pct: Decimal, max_position_size_pct: Decimal) -> Self {
        Self {
            max_risk_per_trade_pct,
            max_position_size_pct,
        }
    }

    pub fn from_config(config: &RiskConfig) -> Self {
        Self::new(config.max_risk_per_trade_pct, config.max_position_size_pct)
    }

    /// Size a position against `capital`.
    ///
    /// The quantity is the smaller of the risk cap
    /// `floor(capital * risk_pct / |entry - stop|)` and the notional cap
    /// `floor(capital * position_pct / entry)`. A stop at entry sizes to zero.
    /// Stop placement relative to `side` is checked by `Signal::validate`.
    pub fn size(
        &self,
        capital: Decimal,
        entry_price: Decimal,
        stop_loss: Decimal,
        _side: PositionSide,
    ) -> PositionSize {
        let risk_per_share = (entry_price - stop_loss).abs();
        if risk_per_share <= Decimal::ZERO || entry_price <= Decimal::ZERO || capital <= Decimal::ZERO {
            return PositionSize::zero();
        }

        let max_risk_amount = capital * self.max_risk_per_trade_pct / Decimal::ONE_HUNDRED;
        let by_risk = (max_risk_amount / risk_per_share).floor();

        let max_position_value = capital * self.max_position_size_pct / Decimal::ONE_HUNDRED;
        let by_value = (max_position_value / entry_price).floor();

        let quantity = by_risk.min(by_value).to_u64().unwrap_or(0);

        PositionSize {
            quantity,
            risk_amount: Decimal::from(quantity) * risk_per_share,
            risk_per_share,
        }
    }
}

/// Stop-loss `risk_pct` percent away from entry, against the position
pub fn calculate_stop_loss(entry: Decimal, side: PositionSide, risk_pct: Decimal) -> Decimal {
    let distance = entry * risk_pct / Decimal::ONE_HUNDRED;
    let stop = match side {
        PositionSide::Long => entry - distance,
        PositionSide::Short => entry + distance,
    };
    stop.round_dp(2)
}

/// Target at `risk_reward_ratio` times the stop distance, in the position's favour
pub fn calculate_target(
    entry: Decimal,
    side: PositionSide,
    risk_pct: Decimal,
    risk_reward_ratio: Decimal,
) -> Decimal {
    let reward = entry * risk_pct / Decimal::ONE_HUNDRED * risk_reward_ratio;
    let target = match side {
        PositionSide::Long => entry + reward,
        PositionSide::Short => entry - reward,
    };
    target.round_dp(2)
}

/// Outcome of an admission check. A rejection is an expected result, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Admission {
    pub allowed: bool,
    pub reason: Option<String>,
    /// This check tripped a circuit breaker
    pub halt_triggered: bool,
}

impl Admission {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            halt_triggered: false,
        }
    }

    fn reject(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            halt_triggered: false,
        }
    }

    fn halt(reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            halt_triggered: true,
        }
    }
}

/// Capital and daily counters for one executor or backtest run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    pub starting_capital: Decimal,
    pub current_capital: Decimal,
    /// High-water mark
    pub peak_capital: Decimal,
    /// Capital when the current trading day began
    pub day_open_capital: Decimal,
    pub daily_pnl: Decimal,
    pub daily_trade_count: u32,
    pub trading_date: NaiveDate,
    pub halted: bool,
    pub halt_reason: Option<String>,
    /// Day the halt was raised; halts expire when the date moves on
    pub halted_on: Option<NaiveDate>,
}

impl RiskState {
    pub fn new(capital: Decimal, today: NaiveDate) -> Self {
        Self {
            starting_capital: capital,
            current_capital: capital,
            peak_capital: capital,
            day_open_capital: capital,
            daily_pnl: Decimal::ZERO,
            daily_trade_count: 0,
            trading_date: today,
            halted: false,
            halt_reason: None,
            halted_on: None,
        }
    }

    pub fn drawdown(&self) -> Decimal {
        (self.peak_capital - self.current_capital).max(Decimal::ZERO)
    }

    /// `(peak - current) / peak` in percent
    pub fn drawdown_pct(&self) -> Decimal {
        if self.peak_capital <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.drawdown() / self.peak_capital * Decimal::ONE_HUNDRED
    }

    pub fn total_pnl(&self) -> Decimal {
        self.current_capital - self.starting_capital
    }

    fn halt_active(&self, today: NaiveDate) -> bool {
        self.halted && self.halted_on.map_or(true, |d| d >= today)
    }

    /// Reset daily counters on a new calendar date. Returns true when a reset happened.
    fn roll_day(&mut self, today: NaiveDate) -> bool {
        if today <= self.trading_date {
            return false;
        }
        self.trading_date = today;
        self.daily_pnl = Decimal::ZERO;
        self.daily_trade_count = 0;
        self.day_open_capital = self.current_capital;
        self.halted = false;
        self.halt_reason = None;
        self.halted_on = None;
        true
    }

    fn set_halt(&mut self, reason: String, today: NaiveDate) {
        self.halted = true;
        self.halt_reason = Some(reason);
        self.halted_on = Some(today);
    }

    /// Daily-loss and drawdown breakers, in that order
    fn breached_limit(&self, config: &RiskConfig) -> Option<String> {
        if self.daily_pnl < Decimal::ZERO {
            let loss = -self.daily_pnl;
            if loss >= config.max_daily_loss {
                return Some(format!(
                    "daily loss limit breached: loss {} >= limit {}",
                    loss, config.max_daily_loss
                ));
            }
            if self.day_open_capital > Decimal::ZERO {
                let loss_pct = loss / self.day_open_capital * Decimal::ONE_HUNDRED;
                if loss_pct >= config.max_daily_loss_pct {
                    return Some(format!(
                        "daily loss limit breached: {}% >= {}%",
                        loss_pct.round_dp(2),
                        config.max_daily_loss_pct
                    ));
                }
            }
        }

        let drawdown_pct = self.drawdown_pct();
        if drawdown_pct >= config.max_drawdown_pct {
            return Some(format!(
                "max drawdown breached: {}% >= {}%",
                drawdown_pct.round_dp(2),
                config.max_drawdown_pct
            ));
        }
        None
    }

    /// Admission check, evaluated in fixed order
    pub fn validate(
        &mut self,
        config: &RiskConfig,
        quantity: u64,
        price: Decimal,
        open_positions: usize,
        today: NaiveDate,
    ) -> Admission {
        if self.halt_active(today) {
            let reason = self.halt_reason.clone().unwrap_or_else(|| "trading halted".into());
            return Admission::reject(RiskError::TradingHalted { reason }.to_string());
        }

        self.roll_day(today);

        if open_positions >= config.max_positions as usize {
            return Admission::reject(
                RiskError::MaxPositions {
                    open: open_positions,
                    limit: config.max_positions,
                }
                .to_string(),
            );
        }

        let value = Decimal::from(quantity) * price;
        let limit = self.current_capital * config.max_position_size_pct / Decimal::ONE_HUNDRED;
        if value > limit {
            return Admission::reject(RiskError::PositionTooLarge { value, limit }.to_string());
        }

        if let Some(reason) = self.breached_limit(config) {
            self.set_halt(reason.clone(), today);
            return Admission::halt(reason);
        }

        Admission::allow()
    }

    /// Book realized P&L. Returns the halt reason when this update trips a breaker.
    pub fn update_capital(&mut self, config: &RiskConfig, pnl: Decimal, today: NaiveDate) -> Option<String> {
        self.roll_day(today);

        self.current_capital += pnl;
        self.daily_pnl += pnl;
        if self.current_capital > self.peak_capital {
            self.peak_capital = self.current_capital;
        }
        self.daily_trade_count += 1;

        if self.halt_active(today) {
            return None;
        }
        let reason = self.breached_limit(config)?;
        self.set_halt(reason.clone(), today);
        Some(reason)
    }
}

/// Admission control, sizing and circuit breakers.
///
/// All state sits behind one mutex so validate-then-update sequences from
/// the control loop and order callbacks never interleave.
pub struct RiskManager {
    config: RiskConfig,
    sizer: PositionSizer,
    state: Mutex<RiskState>,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self::starting_on(config, Utc::now().date_naive())
    }

    /// Create with an explicit trading date
    pub fn starting_on(config: RiskConfig, today: NaiveDate) -> Self {
        let sizer = PositionSizer::from_config(&config);
        let state = RiskState::new(config.capital, today);
        Self {
            config,
            sizer,
            state: Mutex::new(state),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn sizer(&self) -> PositionSizer {
        self.sizer
    }

    /// Size a position against current capital
    pub async fn size_position(&self, entry_price: Decimal, stop_loss: Decimal, side: PositionSide) -> PositionSize {
        let capital = self.state.lock().await.current_capital;
        let size = self.sizer.size(capital, entry_price, stop_loss, side);
        debug!(
            %entry_price, %stop_loss, %side, quantity = size.quantity, risk = %size.risk_amount,
            "position sized"
        );
        size
    }

    pub async fn validate_trade(&self, quantity: u64, price: Decimal, open_positions: usize) -> Admission {
        self.validate_trade_on(quantity, price, open_positions, Utc::now().date_naive())
            .await
    }

    pub async fn validate_trade_on(
        &self,
        quantity: u64,
        price: Decimal,
        open_positions: usize,
        today: NaiveDate,
    ) -> Admission {
        let mut state = self.state.lock().await;
        let admission = state.validate(&self.config, quantity, price, open_positions, today);

        if admission.halt_triggered {
            error!("CIRCUIT BREAKER TRIGGERED: {}", admission.reason.as_deref().unwrap_or_default());
        } else if let Some(reason) = &admission.reason {
            warn!(quantity, %price, open_positions, "trade rejected: {}", reason);
        }
        admission
    }

    /// Book realized P&L. Returns the halt reason when a breaker trips.
    pub async fn update_capital(&self, pnl: Decimal) -> Option<String> {
        self.update_capital_on(pnl, Utc::now().date_naive()).await
    }

    pub async fn update_capital_on(&self, pnl: Decimal, today: NaiveDate) -> Option<String> {
        let mut state = self.state.lock().await;
        let halt = state.update_capital(&self.config, pnl, today);

        info!(
            %pnl, capital = %state.current_capital, daily_pnl = %state.daily_pnl,
            "capital updated"
        );
        if let Some(reason) = &halt {
            error!("CIRCUIT BREAKER TRIGGERED: {}", reason);
        }
        halt
    }

    pub fn calculate_stop_loss(&self, entry: Decimal, side: PositionSide) -> Decimal {
        calculate_stop_loss(entry, side, self.config.default_stop_loss_pct)
    }

    pub fn calculate_target(&self, entry: Decimal, side: PositionSide) -> Decimal {
        calculate_target(
            entry,
            side,
            self.config.default_stop_loss_pct,
            self.config.risk_reward_ratio,
        )
    }

    pub async fn snapshot(&self) -> RiskState {
        self.state.lock().await.clone()
    }

    pub async fn capital(&self) -> Decimal {
        self.state.lock().await.current_capital
    }

    pub async fn is_halted(&self) -> bool {
        let state = self.state.lock().await;
        state.halt_active(Utc::now().date_naive())
    }

    pub async fn halt_reason(&self) -> Option<String> {
        self.state.lock().await.halt_reason.clone()
    }

    /// Manual override
    pub async fn reset_halt(&self) {
        let mut state = self.state.lock().await;
        state.halted = false;
        state.halt_reason = None;
        state.halted_on = None;
        info!("Circuit breaker reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn config() -> RiskConfig {
        RiskConfig::default()
    }

    #[test]
    fn test_sizing_scenario() {
        let sizer = PositionSizer::new(dec!(1), dec!(50));
        let size = sizer.size(dec!(100000), dec!(2500), dec!(2450), PositionSide::Long);
        assert_eq!(size.risk_per_share, dec!(50));
        assert_eq!(size.quantity, 20);
        assert_eq!(size.risk_amount, dec!(1000));
    }

    #[test]
    fn test_sizing_zero_risk_per_share() {
        let sizer = PositionSizer::new(dec!(1), dec!(50));
        assert!(sizer.size(dec!(100000), dec!(2500), dec!(2500), PositionSide::Long).is_zero());
        assert!(sizer.size(dec!(100000), dec!(2500), dec!(2500), PositionSide::Short).is_zero());
    }

    #[test]
    fn test_sizing_uses_absolute_stop_distance() {
        let sizer = PositionSizer::new(dec!(1), dec!(50));
        for side in [PositionSide::Long, PositionSide::Short] {
            let below = sizer.size(dec!(100000), dec!(2500), dec!(2450), side);
            assert_eq!(below.risk_per_share, dec!(50));
            assert_eq!(below.quantity, 20);
            assert_eq!(below.risk_amount, dec!(1000));

            let above = sizer.size(dec!(100000), dec!(2500), dec!(2550), side);
            assert_eq!(above.quantity, 20);
        }
    }

    #[test]
    fn test_sizing_respects_both_caps() {
        // Tight stop: risk cap allows 1000 shares, 10% notional cap allows 100
        let sizer = PositionSizer::new(dec!(1), dec!(10));
        let size = sizer.size(dec!(100000), dec!(100), dec!(99), PositionSide::Long);
        assert_eq!(size.quantity, 100);
        assert_eq!(size.risk_amount, dec!(100));

        for (entry, stop) in [(dec!(731), dec!(722.5)), (dec!(48.3), dec!(47.95)), (dec!(5100), dec!(4990))] {
            let s = sizer.size(dec!(100000), entry, stop, PositionSide::Long);
            assert!(s.risk_amount <= dec!(1000));
            assert!(Decimal::from(s.quantity) * entry <= dec!(10000));
        }
    }

    #[test]
    fn test_stop_and_target_derivation() {
        assert_eq!(calculate_stop_loss(dec!(2500), PositionSide::Long, dec!(2)), dec!(2450));
        assert_eq!(calculate_stop_loss(dec!(2500), PositionSide::Short, dec!(2)), dec!(2550));
        assert_eq!(calculate_target(dec!(2500), PositionSide::Long, dec!(2), dec!(2)), dec!(2600));
        assert_eq!(calculate_target(dec!(2500), PositionSide::Short, dec!(2), dec!(2)), dec!(2400));
    }

    #[tokio::test]
    async fn test_daily_loss_halts_trading() {
        let risk = RiskManager::starting_on(config(), day(4));

        assert_eq!(risk.update_capital_on(dec!(-2000), day(4)).await, None);
        let halt = risk.update_capital_on(dec!(-3500), day(4)).await;
        assert!(halt.unwrap().contains("daily loss"));

        let state = risk.snapshot().await;
        assert!(state.halted);
        assert!(state.halt_reason.unwrap().contains("daily loss"));

        let admission = risk.validate_trade_on(1, dec!(100), 0, day(4)).await;
        assert!(!admission.allowed);
        assert!(admission.reason.unwrap().contains("daily loss"));
    }

    #[tokio::test]
    async fn test_rollover_clears_halt_once() {
        let risk = RiskManager::starting_on(config(), day(4));
        risk.update_capital_on(dec!(-6000), day(4)).await;
        assert!(!risk.validate_trade_on(1, dec!(100), 0, day(4)).await.allowed);

        // New day: counters reset, halt cleared
        let admission = risk.validate_trade_on(1, dec!(100), 0, day(5)).await;
        assert!(admission.allowed, "{:?}", admission.reason);
        let state = risk.snapshot().await;
        assert_eq!(state.daily_pnl, dec!(0));
        assert_eq!(state.daily_trade_count, 0);
        assert_eq!(state.day_open_capital, dec!(94000));

        // Further trades on the same day are not reset again
        risk.update_capital_on(dec!(500), day(5)).await;
        risk.validate_trade_on(1, dec!(100), 0, day(5)).await;
        let state = risk.snapshot().await;
        assert_eq!(state.daily_pnl, dec!(500));
        assert_eq!(state.daily_trade_count, 1);
    }

    #[tokio::test]
    async fn test_rejections_in_order() {
        let risk = RiskManager::starting_on(config(), day(4));

        let full = risk.validate_trade_on(1, dec!(100), 5, day(4)).await;
        assert!(!full.allowed);
        assert!(full.reason.unwrap().contains("Max positions"));

        // 50% of 100000 = 50000 notional cap
        let big = risk.validate_trade_on(21, dec!(2500), 0, day(4)).await;
        assert!(!big.allowed);
        assert!(!big.halt_triggered);
        assert!(risk.validate_trade_on(20, dec!(2500), 0, day(4)).await.allowed);
    }

    #[tokio::test]
    async fn test_drawdown_breaker_across_days() {
        let mut cfg = config();
        cfg.max_daily_loss = dec!(100000);
        cfg.max_daily_loss_pct = dec!(100);
        cfg.max_drawdown_pct = dec!(10);
        let risk = RiskManager::starting_on(cfg, day(4));

        risk.update_capital_on(dec!(20000), day(4)).await;
        risk.update_capital_on(dec!(-6000), day(5)).await;
        let halt = risk.update_capital_on(dec!(-6000), day(6)).await;
        // Peak 120000, current 108000: 10% drawdown
        assert!(halt.unwrap().contains("drawdown"));
        assert_eq!(risk.snapshot().await.drawdown_pct(), dec!(10));

        risk.reset_halt().await;
        assert!(risk.snapshot().await.halt_reason.is_none());
    }

    #[tokio::test]
    async fn test_capital_conservation() {
        let risk = RiskManager::starting_on(config(), day(4));
        let pnls = [dec!(120.5), dec!(-80), dec!(310), dec!(-45.25)];
        for pnl in pnls {
            risk.update_capital_on(pnl, day(4)).await;
        }
        let total: Decimal = pnls.iter().sum();
        assert_eq!(risk.capital().await, dec!(100000) + total);
        assert_eq!(risk.snapshot().await.peak_capital, dec!(100350.5));
    }
}
