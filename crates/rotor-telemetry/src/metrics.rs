//! Prometheus metrics for the rotor execution layer.
//!
//! Covers the surfaces an operator needs to watch:
//! - Gateway connection state and reconnects
//! - Event dispatch throughput and drops
//! - Order lifecycle (submitted / filled / rejected) and round-trip latency
//! - Risk blocks, resyncs, drift detection, trading halt
//! - Account gauges (net liquidation, buying power)
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. If registration fails,
//! it indicates a fatal configuration error (e.g., duplicate metric names)
//! that should cause an immediate crash at startup rather than silent failure.
//! These panics only occur during static initialization, never at runtime.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec,
    register_int_gauge, CounterVec, Gauge, GaugeVec, HistogramVec, IntGauge, TextEncoder,
};

use crate::error::{TelemetryError, TelemetryResult};

/// Gateway connection state (1 = connected, 0 = not connected).
pub static GATEWAY_CONNECTED: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "rotor_gateway_connected",
        "Gateway connection state (1=connected)"
    )
    .unwrap()
});

/// Connection state machine current state.
/// Labels: state (disconnected/connecting/connected/degraded/closing)
pub static GATEWAY_STATE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "rotor_gateway_state",
        "Connection state machine current state (1=active, 0=inactive)",
        &["state"]
    )
    .unwrap()
});

/// Total gateway reconnection attempts.
pub static GATEWAY_RECONNECT_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "rotor_gateway_reconnect_total",
        "Total gateway reconnection attempts",
        &["reason"]
    )
    .unwrap()
});

/// Orders submitted to the gateway.
pub static ORDERS_SUBMITTED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "rotor_orders_submitted_total",
        "Total orders submitted",
        &["symbol", "side"]
    )
    .unwrap()
});

/// Orders that reached the Filled terminal state.
pub static ORDERS_FILLED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "rotor_orders_filled_total",
        "Total orders fully filled",
        &["symbol"]
    )
    .unwrap()
});

/// Orders that ended Rejected, Cancelled or Indeterminate.
pub static ORDERS_FAILED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "rotor_orders_failed_total",
        "Total orders that did not fill",
        &["symbol", "outcome"]
    )
    .unwrap()
});

/// Submission-to-terminal round trip in milliseconds.
pub static ORDER_ROUNDTRIP_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "rotor_order_roundtrip_ms",
        "Order submission to terminal state in milliseconds",
        &["symbol"],
        vec![10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 15000.0, 60000.0]
    )
    .unwrap()
});

/// Risk validator blocks.
pub static RISK_BLOCKED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "rotor_risk_blocked_total",
        "Total orders blocked by the risk validator",
        &["check", "symbol"]
    )
    .unwrap()
});

/// Full position/account resyncs requested.
pub static RESYNC_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "rotor_resync_total",
        "Total wholesale position resyncs",
        &["reason"]
    )
    .unwrap()
});

/// Position drift observations (expected vs reported mismatch).
pub static DRIFT_EVENTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "rotor_drift_events_total",
        "Total position drift observations",
        &["symbol"]
    )
    .unwrap()
});

/// Trading halt flag (1 = halted pending operator acknowledgment).
pub static TRADING_HALTED: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "rotor_trading_halted",
        "Automated trading halted (1=halted)"
    )
    .unwrap()
});

/// Account net liquidation value.
pub static NET_LIQUIDATION: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "rotor_net_liquidation",
        "Account net liquidation value as last reported"
    )
    .unwrap()
});

/// Account buying power.
pub static BUYING_POWER: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "rotor_buying_power",
        "Account buying power as last reported"
    )
    .unwrap()
});

/// Number of open (non-flat) positions.
pub static OPEN_POSITIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("rotor_open_positions", "Number of non-flat positions").unwrap()
});

/// Metrics facade for convenient recording.
pub struct Metrics;

impl Metrics {
    /// Record gateway connected.
    pub fn gateway_connected() {
        GATEWAY_CONNECTED.set(1.0);
    }

    /// Record gateway disconnected.
    pub fn gateway_disconnected() {
        GATEWAY_CONNECTED.set(0.0);
    }

    /// Set connection state machine state.
    /// Only the active state is set to 1, all others to 0.
    pub fn gateway_state_set(state: &str) {
        for s in &[
            "disconnected",
            "connecting",
            "connected",
            "degraded",
            "closing",
        ] {
            GATEWAY_STATE.with_label_values(&[s]).set(0.0);
        }
        GATEWAY_STATE.with_label_values(&[state]).set(1.0);
    }

    /// Record a gateway reconnection attempt.
    pub fn gateway_reconnect(reason: &str) {
        GATEWAY_RECONNECT_TOTAL.with_label_values(&[reason]).inc();
    }

    /// Record an order submission.
    pub fn order_submitted(symbol: &str, side: &str) {
        ORDERS_SUBMITTED_TOTAL
            .with_label_values(&[symbol, side])
            .inc();
    }

    /// Record a fully filled order.
    pub fn order_filled(symbol: &str) {
        ORDERS_FILLED_TOTAL.with_label_values(&[symbol]).inc();
    }

    /// Record an order that ended without a full fill.
    pub fn order_failed(symbol: &str, outcome: &str) {
        ORDERS_FAILED_TOTAL
            .with_label_values(&[symbol, outcome])
            .inc();
    }

    /// Record submission-to-terminal latency.
    pub fn order_roundtrip(symbol: &str, ms: f64) {
        ORDER_ROUNDTRIP_MS.with_label_values(&[symbol]).observe(ms);
    }

    /// Record a risk validator block.
    pub fn risk_blocked(check: &str, symbol: &str) {
        RISK_BLOCKED_TOTAL.with_label_values(&[check, symbol]).inc();
    }

    /// Record a wholesale resync.
    pub fn resync(reason: &str) {
        RESYNC_TOTAL.with_label_values(&[reason]).inc();
    }

    /// Record a drift observation.
    pub fn drift_detected(symbol: &str) {
        DRIFT_EVENTS_TOTAL.with_label_values(&[symbol]).inc();
    }

    /// Set the trading halt flag.
    pub fn trading_halted(halted: bool) {
        TRADING_HALTED.set(if halted { 1.0 } else { 0.0 });
    }

    /// Set the net liquidation gauge.
    pub fn net_liquidation(value: f64) {
        NET_LIQUIDATION.set(value);
    }

    /// Set the buying power gauge.
    pub fn buying_power(value: f64) {
        BUYING_POWER.set(value);
    }

    /// Set the open position count.
    pub fn open_positions(count: i64) {
        OPEN_POSITIONS.set(count);
    }
}

/// Render all registered metrics in Prometheus text exposition format.
///
/// Used for the shutdown dump and for ad-hoc inspection; there is no
/// HTTP scrape endpoint in this service.
pub fn render() -> TelemetryResult<String> {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    encoder
        .encode_to_string(&families)
        .map_err(|e| TelemetryError::Metrics(e.to_string()))
}
