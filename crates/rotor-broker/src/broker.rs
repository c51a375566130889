//! The broker facade: one capability trait, two variants.

use std::collections::HashMap;

use async_trait::async_trait;
use rotor_core::{
    Bar, BarInterval, EquityPoint, OrderOutcome, OrderSide, Position, Price, Qty, Quote, Symbol,
};
use rotor_executor::ExecutorConfig;
use rotor_gateway::ConnectionConfig;
use rotor_risk::RiskConfig;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::BrokerResult;
use crate::live::LiveBroker;
use crate::performance::PerformanceReport;
use crate::sim::SimBroker;

// ============================================================================
//                                Configuration
// ============================================================================

/// Which facade variant to construct. Selected once at startup, never
/// switched at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    Live,
    Simulated,
}

impl Default for BrokerKind {
    fn default() -> Self {
        Self::Simulated
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub kind: BrokerKind,
    /// Gateway client identity. Empty means generate one per session.
    #[serde(default)]
    pub client_id: String,
    /// Fallback account value until the first account snapshot arrives,
    /// and the simulated variant's starting cash.
    #[serde(default = "default_total_capital")]
    pub total_capital: Decimal,
    /// Fraction of account value allocated per position.
    #[serde(default = "default_position_size_pct")]
    pub position_size_pct: Decimal,
    /// Symbols to subscribe for streaming quotes on connect.
    #[serde(default)]
    pub watch_symbols: Vec<Symbol>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Bound on the initial position/account refresh after connect.
    #[serde(default = "default_resync_timeout_ms")]
    pub resync_timeout_ms: u64,
    /// Bound on draining in-flight orders during disconnect.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// Simulated variant only: margin multiplier applied to equity when
    /// deriving buying power.
    #[serde(default = "default_buying_power_multiplier")]
    pub buying_power_multiplier: u32,
    /// Simulated variant only: initial last prices per symbol.
    #[serde(default)]
    pub seed_prices: HashMap<Symbol, Decimal>,
}

fn default_total_capital() -> Decimal {
    Decimal::from(100_000)
}

fn default_position_size_pct() -> Decimal {
    Decimal::new(95, 2) // 0.95
}

fn default_connect_timeout_ms() -> u64 {
    15_000
}

fn default_resync_timeout_ms() -> u64 {
    10_000
}

fn default_drain_timeout_ms() -> u64 {
    10_000
}

fn default_buying_power_multiplier() -> u32 {
    4
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::default(),
            client_id: String::new(),
            total_capital: default_total_capital(),
            position_size_pct: default_position_size_pct(),
            watch_symbols: Vec::new(),
            connect_timeout_ms: default_connect_timeout_ms(),
            resync_timeout_ms: default_resync_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            buying_power_multiplier: default_buying_power_multiplier(),
            seed_prices: HashMap::new(),
        }
    }
}

// ============================================================================
//                                   Trait
// ============================================================================

/// Uniform broker capability surface.
///
/// [`LiveBroker`] composes the gateway, reconciler, risk validator and
/// executor against a real connection; [`SimBroker`] answers everything
/// from an in-memory ledger with instantaneous fills. Callers hold a
/// `Box<dyn Broker>` and never learn which variant they got.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Establishes the session. Idempotent while already connected.
    async fn connect(&mut self) -> BrokerResult<()>;

    fn is_connected(&self) -> bool;

    /// Drains in-flight orders (bounded) and tears the session down.
    async fn disconnect(&mut self) -> BrokerResult<()>;

    /// Current quote for a symbol, from the stream cache or a fresh
    /// round trip.
    async fn market_data(&self, symbol: &Symbol) -> BrokerResult<Quote>;

    /// OHLCV history, oldest first.
    async fn historical_data(
        &self,
        symbol: &Symbol,
        days: u32,
        interval: BarInterval,
    ) -> BrokerResult<Vec<Bar>>;

    /// Reconciled position for a symbol; flat if none.
    fn position(&self, symbol: &Symbol) -> Position;

    fn all_positions(&self) -> Vec<Position>;

    /// Cash balance from the latest account snapshot.
    fn account_balance(&self) -> Price;

    fn buying_power(&self) -> Price;

    /// Net liquidation value; the configured total capital until the
    /// first snapshot arrives.
    fn portfolio_value(&self) -> Price;

    /// Submits a relative order and waits for its terminal outcome.
    async fn place_order(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        quantity: Qty,
    ) -> BrokerResult<OrderOutcome>;

    /// Flattens a symbol; a no-op outcome when already flat.
    async fn close_position(&self, symbol: &Symbol) -> BrokerResult<OrderOutcome>;

    /// Runs the risk checks for an order without submitting anything.
    async fn validate_order(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        quantity: Qty,
    ) -> BrokerResult<()>;

    /// Whole shares the configured allocation affords at a reference
    /// price.
    fn calculate_shares(&self, symbol: &Symbol, price: Price) -> Qty;

    fn performance_metrics(&self) -> PerformanceReport;

    /// Samples the equity curve at the current portfolio value.
    fn record_equity(&self) -> EquityPoint;

    /// Requests a wholesale position/account refresh and waits for it.
    async fn force_resync(&self) -> BrokerResult<()>;

    /// Operator acknowledgment after a drift halt: resync, then clear
    /// the halt.
    async fn acknowledge_drift(&self) -> BrokerResult<()>;
}

/// Builds the configured variant.
#[must_use]
pub fn build_broker(
    broker: BrokerConfig,
    connection: ConnectionConfig,
    risk: RiskConfig,
    executor: ExecutorConfig,
) -> Box<dyn Broker> {
    match broker.kind {
        BrokerKind::Live => Box::new(LiveBroker::new(broker, connection, risk, executor)),
        BrokerKind::Simulated => Box::new(SimBroker::new(broker, risk)),
    }
}
