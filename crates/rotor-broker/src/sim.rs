//! The simulated broker: an in-memory ledger with instantaneous fills.
//!
//! Dry-run mode and the facade-level test double. Orders validate
//! against the same risk thresholds as the live variant, fill
//! synchronously at the last known price, and never produce a
//! connection error or an indeterminate outcome.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use rotor_core::{
    Bar, BarInterval, EquityPoint, OrderId, OrderOutcome, OrderSide, Position, Price, Qty, Quote,
    Symbol, TradeRecord,
};
use rotor_risk::{RiskConfig, ValidationError};
use rotor_telemetry::Metrics;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::broker::{Broker, BrokerConfig};
use crate::error::{BrokerError, BrokerResult};
use crate::now_ms;
use crate::performance::{PerformanceReport, PerformanceTracker};
use crate::sizing;

fn half_spread() -> Decimal {
    Decimal::new(5, 2) // 0.05
}

fn interval_ms(interval: BarInterval) -> i64 {
    const MINUTE: i64 = 60_000;
    match interval {
        BarInterval::OneMinute => MINUTE,
        BarInterval::FiveMinutes => 5 * MINUTE,
        BarInterval::FifteenMinutes => 15 * MINUTE,
        BarInterval::ThirtyMinutes => 30 * MINUTE,
        BarInterval::OneHour => 60 * MINUTE,
        BarInterval::OneDay => 24 * 60 * MINUTE,
        BarInterval::OneWeek => 7 * 24 * 60 * MINUTE,
        BarInterval::OneMonth => 30 * 24 * 60 * MINUTE,
    }
}

// ============================================================================
//                                   Ledger
// ============================================================================

struct SimState {
    connected: bool,
    cash: Decimal,
    positions: HashMap<Symbol, Position>,
    last_prices: HashMap<Symbol, Price>,
    next_order_id: u64,
    tracker: PerformanceTracker,
}

impl SimState {
    fn mark_price(&self, position: &Position) -> Price {
        self.last_prices
            .get(&position.symbol)
            .copied()
            .unwrap_or(position.avg_cost)
    }

    /// Cash plus positions marked at the last known price.
    fn portfolio_value(&self) -> Decimal {
        let marked: Decimal = self
            .positions
            .values()
            .map(|p| p.quantity.signed_value(self.mark_price(p)))
            .sum();
        self.cash + marked
    }

    fn gross_value(&self) -> Decimal {
        self.positions
            .values()
            .map(|p| p.market_value(self.mark_price(p)))
            .sum()
    }

    /// Initial-margin model: `multiplier x equity - gross position
    /// value`, so a cash buy of N dollars consumes exactly N of buying
    /// power.
    fn buying_power(&self, multiplier: u32) -> Decimal {
        Decimal::from(multiplier) * self.portfolio_value() - self.gross_value()
    }
}

// ============================================================================
//                                   Broker
// ============================================================================

pub struct SimBroker {
    config: BrokerConfig,
    risk: RiskConfig,
    state: Mutex<SimState>,
}

impl SimBroker {
    #[must_use]
    pub fn new(config: BrokerConfig, risk: RiskConfig) -> Self {
        let last_prices = config
            .seed_prices
            .iter()
            .map(|(symbol, price)| (symbol.clone(), Price::new(*price)))
            .collect();
        let state = SimState {
            connected: false,
            cash: config.total_capital,
            positions: HashMap::new(),
            last_prices,
            next_order_id: 1,
            tracker: PerformanceTracker::new(Price::new(config.total_capital)),
        };
        Self {
            config,
            risk,
            state: Mutex::new(state),
        }
    }

    /// Updates the last price used for quotes, marks and fills.
    pub fn set_price(&self, symbol: &Symbol, price: Price) {
        debug!(%symbol, %price, "Simulated price set");
        self.state.lock().last_prices.insert(symbol.clone(), price);
    }

    /// Same ordered checks as the live risk validator, against the
    /// ledger instead of the reconciler.
    fn check_order(
        &self,
        state: &SimState,
        symbol: &Symbol,
        side: OrderSide,
        qty: Qty,
        ref_price: Price,
    ) -> Result<(), ValidationError> {
        if qty.inner() <= 0 {
            return Err(ValidationError::InvalidQuantity { qty: qty.inner() });
        }

        let account_value = state.portfolio_value();
        let current = state
            .positions
            .get(symbol)
            .map(|p| p.quantity)
            .unwrap_or(Qty::ZERO);
        let projected = Qty::new(current.inner() + qty.inner() * side.sign());
        let projected_value = projected.notional(ref_price);

        let position_limit = account_value * self.risk.max_position_pct;
        if projected_value > position_limit {
            return Err(ValidationError::ExceedsPositionLimit {
                symbol: symbol.clone(),
                projected: projected_value,
                limit: position_limit,
            });
        }

        let mut gross = projected_value;
        for position in state.positions.values() {
            if position.symbol != *symbol {
                gross += position.cost_basis();
            }
        }
        let exposure_limit = account_value * self.risk.max_exposure_pct;
        if gross > exposure_limit {
            return Err(ValidationError::ExceedsExposureLimit {
                projected: gross,
                limit: exposure_limit,
            });
        }

        if side == OrderSide::Buy {
            let required = qty.notional(ref_price);
            let available = state.buying_power(self.config.buying_power_multiplier)
                * (Decimal::ONE - self.risk.cash_safety_margin_pct);
            if required > available {
                return Err(ValidationError::InsufficientBuyingPower {
                    required,
                    available,
                });
            }
        }
        Ok(())
    }

    fn apply_fill(
        &self,
        state: &mut SimState,
        order_id: OrderId,
        symbol: &Symbol,
        side: OrderSide,
        quantity: Qty,
        price: Price,
    ) -> OrderOutcome {
        let timestamp_ms = now_ms();
        let old = state
            .positions
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| Position::flat(symbol.clone()));
        let old_qty = old.quantity.inner();
        let new_qty = old_qty + quantity.inner() * side.sign();

        if new_qty == 0 {
            state.positions.remove(symbol);
        } else {
            let avg_cost = if old_qty == 0 || old_qty.signum() != new_qty.signum() {
                price
            } else if new_qty.abs() > old_qty.abs() {
                Price::new(
                    (old.cost_basis() + quantity.notional(price)) / Decimal::from(new_qty.abs()),
                )
            } else {
                old.avg_cost
            };
            state.positions.insert(
                symbol.clone(),
                Position::new(symbol.clone(), Qty::new(new_qty), avg_cost, timestamp_ms),
            );
        }
        state.cash -= Decimal::from(side.sign()) * quantity.notional(price);

        let record = TradeRecord {
            timestamp_ms,
            symbol: symbol.clone(),
            side,
            quantity,
            price,
            rationale: String::new(),
        };
        let value = state.portfolio_value();
        state.tracker.record_trade(&record);
        state.tracker.record_equity(timestamp_ms, Price::new(value));

        Metrics::order_submitted(symbol.as_str(), &side.to_string());
        Metrics::order_filled(symbol.as_str());
        Metrics::net_liquidation(value.to_f64().unwrap_or(0.0));
        Metrics::buying_power(
            state
                .buying_power(self.config.buying_power_multiplier)
                .to_f64()
                .unwrap_or(0.0),
        );
        Metrics::open_positions(state.positions.len() as i64);

        info!(
            %symbol,
            order_id = order_id.inner(),
            %side,
            quantity = quantity.inner(),
            %price,
            "Simulated fill"
        );

        OrderOutcome::Filled {
            order_id,
            symbol: symbol.clone(),
            side,
            quantity,
            avg_fill_price: price,
        }
    }

    fn last_price(&self, state: &SimState, symbol: &Symbol) -> BrokerResult<Price> {
        state
            .last_prices
            .get(symbol)
            .copied()
            .ok_or_else(|| BrokerError::NoMarketData {
                symbol: symbol.clone(),
            })
    }
}

#[async_trait]
impl Broker for SimBroker {
    async fn connect(&mut self) -> BrokerResult<()> {
        let mut state = self.state.lock();
        if !state.connected {
            state.connected = true;
            info!(capital = %self.config.total_capital, "Simulated broker session started");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    async fn disconnect(&mut self) -> BrokerResult<()> {
        self.state.lock().connected = false;
        info!("Simulated broker session closed");
        Ok(())
    }

    async fn market_data(&self, symbol: &Symbol) -> BrokerResult<Quote> {
        let state = self.state.lock();
        if !state.connected {
            return Err(BrokerError::NotConnected);
        }
        let last = self.last_price(&state, symbol)?;
        Ok(Quote {
            symbol: symbol.clone(),
            bid: Price::new(last.inner() - half_spread()),
            ask: Price::new(last.inner() + half_spread()),
            last,
            timestamp_ms: now_ms(),
        })
    }

    /// Deterministic bars: closes ramp linearly from 95% of the last
    /// price up to it, oldest first.
    async fn historical_data(
        &self,
        symbol: &Symbol,
        days: u32,
        interval: BarInterval,
    ) -> BrokerResult<Vec<Bar>> {
        let last = {
            let state = self.state.lock();
            if !state.connected {
                return Err(BrokerError::NotConnected);
            }
            self.last_price(&state, symbol)?
        };

        let count = days.max(1) as i64;
        let step = interval_ms(interval);
        let end = now_ms();
        let start_price = last.inner() * Decimal::new(95, 2);
        let span = last.inner() - start_price;

        let mut bars = Vec::with_capacity(count as usize);
        let mut prev_close = start_price;
        for i in 0..count {
            let fraction = if count > 1 {
                Decimal::from(i) / Decimal::from(count - 1)
            } else {
                Decimal::ONE
            };
            let close = start_price + span * fraction;
            bars.push(Bar {
                timestamp_ms: end - (count - 1 - i) * step,
                open: Price::new(prev_close),
                high: Price::new(close * Decimal::new(1002, 3)),
                low: Price::new(close * Decimal::new(998, 3)),
                close: Price::new(close),
                volume: 1_000_000 + i as u64 * 1_000,
            });
            prev_close = close;
        }
        Ok(bars)
    }

    fn position(&self, symbol: &Symbol) -> Position {
        self.state
            .lock()
            .positions
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| Position::flat(symbol.clone()))
    }

    fn all_positions(&self) -> Vec<Position> {
        self.state.lock().positions.values().cloned().collect()
    }

    fn account_balance(&self) -> Price {
        Price::new(self.state.lock().cash)
    }

    fn buying_power(&self) -> Price {
        Price::new(
            self.state
                .lock()
                .buying_power(self.config.buying_power_multiplier),
        )
    }

    fn portfolio_value(&self) -> Price {
        Price::new(self.state.lock().portfolio_value())
    }

    async fn place_order(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        quantity: Qty,
    ) -> BrokerResult<OrderOutcome> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(BrokerError::NotConnected);
        }
        let price = self.last_price(&state, symbol)?;
        self.check_order(&state, symbol, side, quantity, price)?;

        let order_id = OrderId::new(state.next_order_id);
        state.next_order_id += 1;
        Ok(self.apply_fill(&mut state, order_id, symbol, side, quantity, price))
    }

    async fn close_position(&self, symbol: &Symbol) -> BrokerResult<OrderOutcome> {
        let flatten = {
            let state = self.state.lock();
            match state.positions.get(symbol) {
                Some(p) if !p.is_flat() => {
                    let side = if p.is_long() {
                        OrderSide::Sell
                    } else {
                        OrderSide::Buy
                    };
                    Some((side, p.quantity.abs()))
                }
                _ => None,
            }
        };
        match flatten {
            Some((side, qty)) => self.place_order(symbol, side, qty).await,
            None => Ok(OrderOutcome::NoChange {
                symbol: symbol.clone(),
                quantity: Qty::ZERO,
            }),
        }
    }

    async fn validate_order(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        quantity: Qty,
    ) -> BrokerResult<()> {
        let state = self.state.lock();
        if !state.connected {
            return Err(BrokerError::NotConnected);
        }
        let price = self.last_price(&state, symbol)?;
        self.check_order(&state, symbol, side, quantity, price)?;
        Ok(())
    }

    fn calculate_shares(&self, symbol: &Symbol, price: Price) -> Qty {
        let account_value = self.state.lock().portfolio_value();
        let shares = sizing::shares_for(account_value, self.config.position_size_pct, price);
        debug!(%symbol, %price, shares = shares.inner(), "Sized allocation");
        shares
    }

    fn performance_metrics(&self) -> PerformanceReport {
        self.state.lock().tracker.report()
    }

    fn record_equity(&self) -> EquityPoint {
        let mut state = self.state.lock();
        let value = state.portfolio_value();
        state.tracker.record_equity(now_ms(), Price::new(value))
    }

    async fn force_resync(&self) -> BrokerResult<()> {
        // The ledger is authoritative already.
        Ok(())
    }

    async fn acknowledge_drift(&self) -> BrokerResult<()> {
        Ok(())
    }
}

// ============================================================================
//                                    Tests
// ============================================================================
