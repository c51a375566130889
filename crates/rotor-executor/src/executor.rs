//! Order submission and lifecycle management.
//!
//! One `OrderExecutor` owns the path from "change this position to
//! `target`" to a terminal outcome. The pipeline for a single request:
//! halt gate, resync lock, single-flight claim, risk validation,
//! submission, then a bounded wait for the gateway to report a terminal
//! state. Timeouts escalate to a cancel, and a cancel the gateway never
//! confirms leaves the symbol locked until the next resync completes.
//!
//! Order state here is advisory: fills feed the reconciler on their own
//! channel, and a filled order is verified against the reconciled
//! position before it is reported as a success.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rotor_core::{
    GatewayEvent, Order, OrderId, OrderOutcome, OrderSide, OrderState, OrderStatusKind, Price, Qty,
    Symbol, TrackedOrder,
};
use rotor_gateway::GatewayClient;
use rotor_position::ReconcilerHandle;
use rotor_risk::RiskValidator;
use rotor_telemetry::Metrics;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::{ExecutionError, ExecutionResult};
use crate::ids::OrderIdGenerator;

/// Poll interval for position verification and idle waits.
const POLL_INTERVAL_MS: u64 = 25;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// How long to wait for a terminal order state before cancelling.
    #[serde(default = "default_order_timeout_ms")]
    pub order_timeout_ms: u64,
    /// Grace window after a cancel request for the gateway to confirm.
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
    /// How long to poll the reconciler for the post-fill position.
    #[serde(default = "default_verify_timeout_ms")]
    pub verify_timeout_ms: u64,
}

fn default_order_timeout_ms() -> u64 {
    30_000
}

fn default_cancel_grace_ms() -> u64 {
    5_000
}

fn default_verify_timeout_ms() -> u64 {
    2_000
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            order_timeout_ms: default_order_timeout_ms(),
            cancel_grace_ms: default_cancel_grace_ms(),
            verify_timeout_ms: default_verify_timeout_ms(),
        }
    }
}

// ============================================================================
// Order slots
// ============================================================================

/// Snapshot of an order's observed progress, published on a watch
/// channel so the submitting task can wait without holding map locks.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderProgress {
    pub state: OrderState,
    pub filled: Qty,
    pub avg_fill_price: Price,
    /// Gateway-supplied reason for a cancel or reject, when given.
    pub reason: Option<String>,
}

/// Live tracking entry for one submitted order.
pub struct OrderSlot {
    tracked: TrackedOrder,
    reason: Option<String>,
    progress_tx: watch::Sender<OrderProgress>,
}

impl OrderSlot {
    fn new(tracked: TrackedOrder) -> (Self, watch::Receiver<OrderProgress>) {
        let initial = OrderProgress {
            state: tracked.state,
            filled: tracked.filled,
            avg_fill_price: tracked.avg_fill_price,
            reason: None,
        };
        let (progress_tx, progress_rx) = watch::channel(initial);
        (
            Self {
                tracked,
                reason: None,
                progress_tx,
            },
            progress_rx,
        )
    }

    fn publish(&self) {
        self.progress_tx.send_replace(OrderProgress {
            state: self.tracked.state,
            filled: self.tracked.filled,
            avg_fill_price: self.tracked.avg_fill_price,
            reason: self.reason.clone(),
        });
    }
}

// ============================================================================
// Event pump
// ============================================================================

/// Consume order-scoped gateway events and update the matching slots.
///
/// Runs until the channel closes or `shutdown` fires. Events for ids
/// with no slot (prior sessions, resync-era replays) are dropped at
/// debug level.
pub async fn run_order_events(
    orders: Arc<DashMap<OrderId, OrderSlot>>,
    mut events_rx: mpsc::Receiver<GatewayEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Order event pump shutting down");
                break;
            }
            maybe = events_rx.recv() => {
                let Some(event) = maybe else {
                    debug!("Order event channel closed");
                    break;
                };
                apply_order_event(&orders, event);
            }
        }
    }
}

fn apply_order_event(orders: &DashMap<OrderId, OrderSlot>, event: GatewayEvent) {
    match event {
        GatewayEvent::OrderStatus {
            order_id,
            status,
            reason,
        } => {
            let Some(mut slot) = orders.get_mut(&order_id) else {
                debug!(order_id = order_id.inner(), %status, "Status for untracked order");
                return;
            };
            let next = match status {
                OrderStatusKind::Submitted => OrderState::Submitted,
                OrderStatusKind::Cancelled => OrderState::Cancelled,
                OrderStatusKind::Rejected => OrderState::Rejected,
            };
            if slot.tracked.transition(next, now_ms()) {
                if reason.is_some() {
                    slot.reason = reason;
                }
                slot.publish();
            } else {
                debug!(
                    order_id = order_id.inner(),
                    from = %slot.tracked.state,
                    to = %next,
                    "Dropping illegal order transition"
                );
            }
        }
        GatewayEvent::Execution(exec) => {
            let Some(mut slot) = orders.get_mut(&exec.order_id) else {
                debug!(order_id = exec.order_id.inner(), "Execution for untracked order");
                return;
            };
            // Fills can race the submission ack.
            if slot.tracked.state == OrderState::PendingSubmit {
                slot.tracked.transition(OrderState::Submitted, exec.timestamp_ms);
            }
            slot.tracked
                .record_fill(exec.quantity, exec.price, exec.timestamp_ms);
            slot.publish();
        }
        GatewayEvent::Error {
            code,
            message,
            order_id: Some(order_id),
        } => {
            let Some(mut slot) = orders.get_mut(&order_id) else {
                debug!(order_id = order_id.inner(), code, "Error for untracked order");
                return;
            };
            if slot.tracked.transition(OrderState::Rejected, now_ms()) {
                slot.reason = Some(format!("gateway error {code}: {message}"));
                slot.publish();
            }
        }
        other => {
            trace!(kind = ?other.kind(), "Ignoring non-order event");
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ============================================================================
// Single-flight guard
// ============================================================================

/// Releases the per-symbol claim when the submission path exits, on
/// every path.
struct FlightGuard {
    in_flight: Arc<DashMap<Symbol, ()>>,
    symbol: Symbol,
}

impl FlightGuard {
    fn claim(in_flight: Arc<DashMap<Symbol, ()>>, symbol: &Symbol) -> ExecutionResult<Self> {
        match in_flight.entry(symbol.clone()) {
            Entry::Occupied(_) => {
                return Err(ExecutionError::InProgress {
                    symbol: symbol.clone(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }
        Ok(Self {
            in_flight,
            symbol: symbol.clone(),
        })
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.symbol);
    }
}

// ============================================================================
// Wait machinery
// ============================================================================

enum WaitOutcome {
    Terminal(OrderProgress),
    TimedOut,
    /// The slot was dropped mid-wait (session reset).
    Closed,
}

async fn wait_for_terminal(
    rx: &mut watch::Receiver<OrderProgress>,
    deadline: tokio::time::Instant,
) -> WaitOutcome {
    loop {
        let progress = rx.borrow_and_update().clone();
        if progress.state.is_terminal() {
            return WaitOutcome::Terminal(progress);
        }
        match tokio::time::timeout_at(deadline, rx.changed()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return WaitOutcome::Closed,
            Err(_) => return WaitOutcome::TimedOut,
        }
    }
}

/// Everything a settlement path needs to know about the request.
struct SubmitContext {
    order_id: OrderId,
    symbol: Symbol,
    side: OrderSide,
    /// Unsigned order quantity.
    requested: Qty,
    /// Absolute signed position target.
    target: Qty,
    /// Reconciled position at submission time.
    initial: Qty,
    submitted_at: Instant,
}

// ============================================================================
// OrderExecutor
// ============================================================================

#[derive(Clone)]
pub struct OrderExecutor {
    client: GatewayClient,
    reconciler: ReconcilerHandle,
    validator: Arc<RiskValidator>,
    config: ExecutorConfig,
    id_gen: Arc<OrderIdGenerator>,
    orders: Arc<DashMap<OrderId, OrderSlot>>,
    in_flight: Arc<DashMap<Symbol, ()>>,
    /// Symbols frozen by an indeterminate outcome, keyed to the resync
    /// generation observed at freeze time.
    resync_required: Arc<DashMap<Symbol, u64>>,
}

impl OrderExecutor {
    #[must_use]
    pub fn new(
        client: GatewayClient,
        reconciler: ReconcilerHandle,
        validator: Arc<RiskValidator>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            client,
            reconciler,
            validator,
            config,
            id_gen: Arc::new(OrderIdGenerator::new()),
            orders: Arc::new(DashMap::new()),
            in_flight: Arc::new(DashMap::new()),
            resync_required: Arc::new(DashMap::new()),
        }
    }

    /// Spawn the pump that feeds order-scoped gateway events into the
    /// tracking slots. Wire it to a dispatcher subscription covering
    /// order statuses and executions.
    pub fn spawn_order_events(
        &self,
        events_rx: mpsc::Receiver<GatewayEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(run_order_events(
            Arc::clone(&self.orders),
            events_rx,
            shutdown,
        ))
    }

    /// Adopt the order-id seed from a fresh session handshake.
    pub fn seed(&self, next_order_id: u64) {
        self.id_gen.seed(next_order_id);
    }

    /// Drop all in-flight tracking state after a session bounce.
    ///
    /// Waiters observe their watch channel closing and settle as
    /// indeterminate. Resync locks survive: they clear on generation,
    /// not on reconnect.
    pub fn reset(&self) {
        let dropped = self.orders.len();
        self.orders.clear();
        self.in_flight.clear();
        if dropped > 0 {
            warn!(dropped, "Cleared order tracking state");
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn tracked_order_count(&self) -> usize {
        self.orders.len()
    }

    /// Wait until no submission is in flight, up to `wait`.
    pub async fn wait_idle(&self, wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if self.in_flight.is_empty() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
        }
    }

    /// Drive the position in `symbol` to `target` with one market order.
    ///
    /// Resolves to a terminal `OrderOutcome` or an error describing why
    /// nothing (or something unknown) happened. At most one change per
    /// symbol runs at a time.
    pub async fn submit_position_change(
        &self,
        symbol: &Symbol,
        target: Qty,
    ) -> ExecutionResult<OrderOutcome> {
        if let Some(reason) = self.reconciler.halt_reason() {
            warn!(%symbol, %reason, "Order refused: trading halted");
            return Err(ExecutionError::Halted {
                reason: reason.to_string(),
            });
        }

        self.check_resync_lock(symbol)?;

        let _guard = FlightGuard::claim(Arc::clone(&self.in_flight), symbol)?;

        let initial = self.reconciler.current_position(symbol).quantity;
        let delta = target - initial;
        let Some(side) = OrderSide::from_delta(delta) else {
            trace!(%symbol, target = target.inner(), "Already at target");
            return Ok(OrderOutcome::NoChange {
                symbol: symbol.clone(),
                quantity: target,
            });
        };
        let requested = delta.abs();

        let ref_price = self.reference_price(symbol).await?;
        self.validator.validate(symbol, side, requested, ref_price)?;

        let order_id = OrderId::new(self.id_gen.next());
        let order = Order::market(order_id, symbol.clone(), side, requested);
        let (slot, mut progress_rx) = OrderSlot::new(TrackedOrder::new(order.clone()));
        self.orders.insert(order_id, slot);

        // Registration must land before the gateway can emit a fill for
        // this id, or the reconciler flags it as an unknown order.
        self.reconciler.register_order(order_id).await;

        if let Err(e) = self.client.place_order(&order).await {
            self.orders.remove(&order_id);
            self.reconciler.release_order(order_id).await;
            warn!(%symbol, order_id = order_id.inner(), error = %e, "Order never left the client");
            return Err(e.into());
        }

        Metrics::order_submitted(symbol.as_str(), &side.to_string());
        info!(
            order_id = order_id.inner(),
            %symbol,
            %side,
            qty = requested.inner(),
            target = target.inner(),
            price_ref = %ref_price,
            "Order submitted"
        );

        let ctx = SubmitContext {
            order_id,
            symbol: symbol.clone(),
            side,
            requested,
            target,
            initial,
            submitted_at: Instant::now(),
        };

        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.config.order_timeout_ms);
        match wait_for_terminal(&mut progress_rx, deadline).await {
            WaitOutcome::Terminal(progress) => self.settle(&ctx, progress).await,
            WaitOutcome::TimedOut | WaitOutcome::Closed => {
                self.cancel_and_settle(&ctx, &mut progress_rx).await
            }
        }
    }

    /// A symbol frozen by an indeterminate outcome stays frozen until a
    /// resync generation newer than the freeze completes.
    fn check_resync_lock(&self, symbol: &Symbol) -> ExecutionResult<()> {
        let Some(entry) = self.resync_required.get(symbol) else {
            return Ok(());
        };
        let frozen_at = *entry.value();
        drop(entry);

        if self.reconciler.resync_generation() > frozen_at {
            self.resync_required.remove(symbol);
            info!(%symbol, "Resync completed, symbol unfrozen");
            return Ok(());
        }
        Err(ExecutionError::ResyncRequired {
            symbol: symbol.clone(),
        })
    }

    /// Cached quote if fresh enough to carry a price, else one
    /// round-trip to the gateway.
    async fn reference_price(&self, symbol: &Symbol) -> ExecutionResult<Price> {
        if let Some(price) = self
            .client
            .cached_quote(symbol)
            .and_then(|q| q.reference_price())
        {
            return Ok(price);
        }

        let quote = self.client.market_data(symbol).await?;
        quote
            .reference_price()
            .ok_or_else(|| ExecutionError::NoReferencePrice {
                symbol: symbol.clone(),
            })
    }

    async fn settle(
        &self,
        ctx: &SubmitContext,
        progress: OrderProgress,
    ) -> ExecutionResult<OrderOutcome> {
        // What the fills say the position now is.
        let believed = ctx.initial + Qty::new(progress.filled.inner() * ctx.side.sign());

        match progress.state {
            OrderState::Filled => {
                let actual = self.verify_position(&ctx.symbol, ctx.target).await;
                self.reconciler
                    .expect_position(ctx.symbol.clone(), ctx.target)
                    .await;
                self.reconciler.release_order(ctx.order_id).await;

                if actual != ctx.target {
                    Metrics::order_failed(ctx.symbol.as_str(), "verification_failed");
                    error!(
                        order_id = ctx.order_id.inner(),
                        symbol = %ctx.symbol,
                        expected = ctx.target.inner(),
                        actual = actual.inner(),
                        "Filled order failed position verification"
                    );
                    return Err(ExecutionError::VerificationFailed {
                        symbol: ctx.symbol.clone(),
                        expected: ctx.target,
                        actual,
                    });
                }

                Metrics::order_filled(ctx.symbol.as_str());
                Metrics::order_roundtrip(
                    ctx.symbol.as_str(),
                    ctx.submitted_at.elapsed().as_secs_f64() * 1000.0,
                );
                info!(
                    order_id = ctx.order_id.inner(),
                    symbol = %ctx.symbol,
                    side = %ctx.side,
                    qty = ctx.requested.inner(),
                    avg_price = %progress.avg_fill_price,
                    "Order filled and verified"
                );
                Ok(OrderOutcome::Filled {
                    order_id: ctx.order_id,
                    symbol: ctx.symbol.clone(),
                    side: ctx.side,
                    quantity: ctx.requested,
                    avg_fill_price: progress.avg_fill_price,
                })
            }
            OrderState::Cancelled => {
                self.reconciler
                    .expect_position(ctx.symbol.clone(), believed)
                    .await;
                self.reconciler.release_order(ctx.order_id).await;
                Metrics::order_failed(ctx.symbol.as_str(), "cancelled");
                warn!(
                    order_id = ctx.order_id.inner(),
                    symbol = %ctx.symbol,
                    requested = ctx.requested.inner(),
                    filled = progress.filled.inner(),
                    "Order cancelled"
                );
                Ok(OrderOutcome::Cancelled {
                    order_id: ctx.order_id,
                    symbol: ctx.symbol.clone(),
                    requested: ctx.requested,
                    filled: progress.filled,
                })
            }
            OrderState::Rejected => {
                self.reconciler
                    .expect_position(ctx.symbol.clone(), believed)
                    .await;
                self.reconciler.release_order(ctx.order_id).await;
                Metrics::order_failed(ctx.symbol.as_str(), "rejected");
                let reason = progress
                    .reason
                    .unwrap_or_else(|| "no reason given".to_string());
                warn!(
                    order_id = ctx.order_id.inner(),
                    symbol = %ctx.symbol,
                    reason = %reason,
                    "Order rejected"
                );
                Err(ExecutionError::Rejected {
                    order_id: ctx.order_id,
                    reason,
                })
            }
            state => {
                // wait_for_terminal only hands back terminal states.
                error!(
                    order_id = ctx.order_id.inner(),
                    %state,
                    "Settlement reached with non-terminal state"
                );
                Err(ExecutionError::Indeterminate {
                    order_id: ctx.order_id,
                    symbol: ctx.symbol.clone(),
                })
            }
        }
    }

    /// Timeout path: request a cancel, then give the gateway a grace
    /// window to land either the cancel confirm or a late fill.
    async fn cancel_and_settle(
        &self,
        ctx: &SubmitContext,
        progress_rx: &mut watch::Receiver<OrderProgress>,
    ) -> ExecutionResult<OrderOutcome> {
        warn!(
            order_id = ctx.order_id.inner(),
            symbol = %ctx.symbol,
            timeout_ms = self.config.order_timeout_ms,
            "Order timed out, requesting cancel"
        );
        if let Err(e) = self.client.cancel_order(ctx.order_id).await {
            warn!(
                order_id = ctx.order_id.inner(),
                error = %e,
                "Cancel request failed to send"
            );
        }

        let grace =
            tokio::time::Instant::now() + Duration::from_millis(self.config.cancel_grace_ms);
        match wait_for_terminal(progress_rx, grace).await {
            WaitOutcome::Terminal(progress) => self.settle(ctx, progress).await,
            WaitOutcome::TimedOut | WaitOutcome::Closed => {
                // No terminal signal. Fills for this id may still be in
                // flight, so the registration stays and the symbol is
                // frozen until the next resync replaces its position.
                self.resync_required
                    .insert(ctx.symbol.clone(), self.reconciler.resync_generation());
                Metrics::order_failed(ctx.symbol.as_str(), "indeterminate");
                error!(
                    order_id = ctx.order_id.inner(),
                    symbol = %ctx.symbol,
                    "Order outcome indeterminate, symbol frozen until resync"
                );
                Err(ExecutionError::Indeterminate {
                    order_id: ctx.order_id,
                    symbol: ctx.symbol.clone(),
                })
            }
        }
    }

    /// Poll the reconciled position until it matches `target` or the
    /// verification window closes. Returns the last observed quantity.
    async fn verify_position(&self, symbol: &Symbol, target: Qty) -> Qty {
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.config.verify_timeout_ms);
        loop {
            let actual = self.reconciler.current_position(symbol).quantity;
            if actual == target {
                return actual;
            }
            if tokio::time::Instant::now() >= deadline {
                return actual;
            }
            tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rotor_core::{AccountSnapshot, Execution, Position, Quote};
    use rotor_gateway::{ConnectionState, PendingRequests, QuoteCache};
    use rotor_position::spawn_reconciler;
    use rotor_risk::RiskConfig;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn test_config() -> ExecutorConfig {
        ExecutorConfig {
            order_timeout_ms: 200,
            cancel_grace_ms: 100,
            verify_timeout_ms: 300,
        }
    }

    fn test_account(net: i64) -> AccountSnapshot {
        AccountSnapshot::new(
            Price::new(Decimal::from(net)),
            Price::new(Decimal::from(net * 4)),
            Price::new(Decimal::from(net)),
            1_000,
        )
    }

    fn test_quote(symbol: &str, last: Decimal) -> Quote {
        Quote {
            symbol: Symbol::new(symbol),
            bid: Price::new(last - dec!(0.05)),
            ask: Price::new(last + dec!(0.05)),
            last: Price::new(last),
            timestamp_ms: 1_000,
        }
    }

    fn status(order_id: u64, status: OrderStatusKind, reason: Option<&str>) -> GatewayEvent {
        GatewayEvent::OrderStatus {
            order_id: OrderId::new(order_id),
            status,
            reason: reason.map(str::to_string),
        }
    }

    fn fill(order_id: u64, symbol: &str, side: OrderSide, qty: i64, price: Decimal, n: u32) -> GatewayEvent {
        GatewayEvent::Execution(Execution {
            order_id: OrderId::new(order_id),
            exec_id: format!("E-{order_id}-{n}"),
            symbol: Symbol::new(symbol),
            side,
            quantity: Qty::new(qty),
            price: Price::new(price),
            timestamp_ms: 1_000 + i64::from(n),
        })
    }

    fn resync_pos(symbol: &str, qty: i64, avg: Decimal) -> GatewayEvent {
        GatewayEvent::ResyncPosition(Position::new(
            Symbol::new(symbol),
            Qty::new(qty),
            Price::new(avg),
            1_000,
        ))
    }

    async fn settle_tasks() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    struct Rig {
        executor: OrderExecutor,
        reconciler: ReconcilerHandle,
        events_tx: mpsc::Sender<GatewayEvent>,
        outbound_rx: mpsc::Receiver<String>,
        _state_tx: watch::Sender<ConnectionState>,
        _violation_rx: mpsc::Receiver<rotor_core::ProtocolError>,
        _shutdown: CancellationToken,
    }

    impl Rig {
        async fn new() -> Self {
            Self::with(RiskConfig::default(), test_config()).await
        }

        async fn with(risk: RiskConfig, config: ExecutorConfig) -> Self {
            let (violation_tx, violation_rx) = mpsc::channel(8);
            let (reconciler, _task) = spawn_reconciler(64, violation_tx);
            reconciler
                .apply_event(GatewayEvent::AccountSummary(test_account(1_000_000)))
                .await;
            settle_tasks().await;

            let (outbound_tx, outbound_rx) = mpsc::channel(32);
            let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
            let pending = Arc::new(PendingRequests::new(1_000));
            let quotes = Arc::new(QuoteCache::new());
            quotes.insert(test_quote("TQQQ", dec!(450)));
            let client = GatewayClient::new(outbound_tx, state_rx, pending, quotes);
            let validator = Arc::new(RiskValidator::new(risk, reconciler.clone()));
            let executor = OrderExecutor::new(client, reconciler.clone(), validator, config);

            let shutdown = CancellationToken::new();
            let (events_tx, events_rx) = mpsc::channel(64);
            executor.spawn_order_events(events_rx, shutdown.clone());

            Self {
                executor,
                reconciler,
                events_tx,
                outbound_rx,
                _state_tx: state_tx,
                _violation_rx: violation_rx,
                _shutdown: shutdown,
            }
        }

        /// Feed an event the way the dispatcher would: to the order pump
        /// and the reconciler both.
        async fn deliver(&self, event: GatewayEvent) {
            self.events_tx.send(event.clone()).await.unwrap();
            self.reconciler.apply_event(event).await;
        }

        async fn deliver_pump_only(&self, event: GatewayEvent) {
            self.events_tx.send(event).await.unwrap();
        }

        async fn next_frame(&mut self) -> serde_json::Value {
            let frame = tokio::time::timeout(Duration::from_secs(1), self.outbound_rx.recv())
                .await
                .expect("timed out waiting for an outbound frame")
                .expect("outbound channel closed");
            serde_json::from_str(&frame).expect("outbound frame is not JSON")
        }
    }

    #[test]
    fn test_config_defaults() {
        let config: ExecutorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.order_timeout_ms, 30_000);
        assert_eq!(config.cancel_grace_ms, 5_000);
        assert_eq!(config.verify_timeout_ms, 2_000);
    }

    #[tokio::test]
    async fn test_no_change_when_already_at_target() {
        let mut rig = Rig::new().await;
        let symbol = Symbol::new("TQQQ");

        let outcome = rig
            .executor
            .submit_position_change(&symbol, Qty::ZERO)
            .await
            .unwrap();
        assert!(outcome.is_no_change());
        assert!(rig.outbound_rx.try_recv().is_err());
        assert_eq!(rig.executor.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_full_fill_across_partials() {
        let mut rig = Rig::new().await;
        let symbol = Symbol::new("TQQQ");

        let executor = rig.executor.clone();
        let sym = symbol.clone();
        let task =
            tokio::spawn(async move { executor.submit_position_change(&sym, Qty::new(111)).await });

        let frame = rig.next_frame().await;
        assert_eq!(frame["type"], "place_order");
        assert_eq!(frame["side"], "BUY");
        assert_eq!(frame["quantity"], 111);
        let id = frame["order_id"].as_u64().unwrap();

        rig.deliver(status(id, OrderStatusKind::Submitted, None)).await;
        rig.deliver(fill(id, "TQQQ", OrderSide::Buy, 40, dec!(450), 1)).await;
        rig.deliver(fill(id, "TQQQ", OrderSide::Buy, 60, dec!(450), 2)).await;
        rig.deliver(fill(id, "TQQQ", OrderSide::Buy, 11, dec!(450), 3)).await;

        let outcome = task.await.unwrap().unwrap();
        match outcome {
            OrderOutcome::Filled {
                quantity,
                avg_fill_price,
                side,
                ..
            } => {
                assert_eq!(quantity, Qty::new(111));
                assert_eq!(avg_fill_price, Price::new(dec!(450)));
                assert_eq!(side, OrderSide::Buy);
            }
            other => panic!("expected Filled, got {other:?}"),
        }

        assert_eq!(
            rig.reconciler.current_position(&symbol).quantity,
            Qty::new(111)
        );
        assert_eq!(rig.executor.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_second_change_for_same_symbol_is_refused() {
        let mut rig = Rig::new().await;
        let symbol = Symbol::new("TQQQ");

        let executor = rig.executor.clone();
        let sym = symbol.clone();
        let task =
            tokio::spawn(async move { executor.submit_position_change(&sym, Qty::new(50)).await });

        let frame = rig.next_frame().await;
        let id = frame["order_id"].as_u64().unwrap();

        let err = rig
            .executor
            .submit_position_change(&symbol, Qty::new(60))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::InProgress { .. }));

        rig.deliver(status(id, OrderStatusKind::Submitted, None)).await;
        rig.deliver(fill(id, "TQQQ", OrderSide::Buy, 50, dec!(450), 1)).await;
        assert!(task.await.unwrap().unwrap().is_filled());

        // Only the one order frame went out.
        assert!(rig.outbound_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_risk_rejection_never_reaches_the_gateway() {
        let risk = RiskConfig {
            max_position_pct: dec!(0.2),
            ..RiskConfig::default()
        };
        let mut rig = Rig::with(risk, test_config()).await;
        let symbol = Symbol::new("TQQQ");

        // 1000 * 450 = 450k against a 200k cap on a 1M account.
        let err = rig
            .executor
            .submit_position_change(&symbol, Qty::new(1000))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Validation(_)));
        assert!(rig.outbound_rx.try_recv().is_err());
        assert_eq!(rig.executor.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_order_surfaces_reason() {
        let mut rig = Rig::new().await;
        let symbol = Symbol::new("TQQQ");

        let executor = rig.executor.clone();
        let sym = symbol.clone();
        let task =
            tokio::spawn(async move { executor.submit_position_change(&sym, Qty::new(30)).await });

        let frame = rig.next_frame().await;
        let id = frame["order_id"].as_u64().unwrap();
        rig.deliver(status(id, OrderStatusKind::Rejected, Some("margin check failed")))
            .await;

        let err = task.await.unwrap().unwrap_err();
        match err {
            ExecutionError::Rejected { reason, .. } => assert!(reason.contains("margin")),
            other => panic!("expected Rejected, got {other:?}"),
        }
        assert_eq!(rig.executor.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_cancels_and_reports_fill_total() {
        let mut rig = Rig::new().await;
        let symbol = Symbol::new("TQQQ");

        let executor = rig.executor.clone();
        let sym = symbol.clone();
        let task =
            tokio::spawn(async move { executor.submit_position_change(&sym, Qty::new(80)).await });

        let place = rig.next_frame().await;
        let id = place["order_id"].as_u64().unwrap();
        rig.deliver(status(id, OrderStatusKind::Submitted, None)).await;
        rig.deliver(fill(id, "TQQQ", OrderSide::Buy, 30, dec!(450), 1)).await;

        // No more fills; the order times out and a cancel goes out.
        let cancel = rig.next_frame().await;
        assert_eq!(cancel["type"], "cancel_order");
        assert_eq!(cancel["order_id"].as_u64().unwrap(), id);

        rig.deliver(status(id, OrderStatusKind::Cancelled, None)).await;
        let outcome = task.await.unwrap().unwrap();
        match outcome {
            OrderOutcome::Cancelled {
                requested, filled, ..
            } => {
                assert_eq!(requested, Qty::new(80));
                assert_eq!(filled, Qty::new(30));
            }
            other => panic!("expected Cancelled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fill_landing_in_cancel_grace_still_succeeds() {
        let mut rig = Rig::new().await;
        let symbol = Symbol::new("TQQQ");

        let executor = rig.executor.clone();
        let sym = symbol.clone();
        let task =
            tokio::spawn(async move { executor.submit_position_change(&sym, Qty::new(25)).await });

        let place = rig.next_frame().await;
        let id = place["order_id"].as_u64().unwrap();
        rig.deliver(status(id, OrderStatusKind::Submitted, None)).await;

        // Let the timeout fire and the cancel go out, then fill anyway.
        let cancel = rig.next_frame().await;
        assert_eq!(cancel["type"], "cancel_order");
        rig.deliver(fill(id, "TQQQ", OrderSide::Buy, 25, dec!(450), 1)).await;

        assert!(task.await.unwrap().unwrap().is_filled());
    }

    #[tokio::test]
    async fn test_unconfirmed_cancel_freezes_symbol_until_resync() {
        let mut rig = Rig::new().await;
        let symbol = Symbol::new("TQQQ");

        let executor = rig.executor.clone();
        let sym = symbol.clone();
        let task =
            tokio::spawn(async move { executor.submit_position_change(&sym, Qty::new(7)).await });

        let place = rig.next_frame().await;
        assert_eq!(place["type"], "place_order");
        let cancel = rig.next_frame().await;
        assert_eq!(cancel["type"], "cancel_order");

        // The cancel is never confirmed.
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ExecutionError::Indeterminate { .. }));

        let err = rig
            .executor
            .submit_position_change(&symbol, Qty::new(7))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::ResyncRequired { .. }));

        // A completed resync unfreezes the symbol.
        rig.reconciler.apply_event(GatewayEvent::ResyncBegin).await;
        rig.reconciler.apply_event(resync_pos("TQQQ", 7, dec!(450))).await;
        rig.reconciler.apply_event(GatewayEvent::ResyncEnd).await;
        settle_tasks().await;

        let outcome = rig
            .executor
            .submit_position_change(&symbol, Qty::new(7))
            .await
            .unwrap();
        assert!(outcome.is_no_change());
    }

    #[tokio::test]
    async fn test_filled_order_fails_verification_when_reconciler_disagrees() {
        let mut rig = Rig::new().await;
        let symbol = Symbol::new("TQQQ");

        let executor = rig.executor.clone();
        let sym = symbol.clone();
        let task =
            tokio::spawn(async move { executor.submit_position_change(&sym, Qty::new(50)).await });

        let frame = rig.next_frame().await;
        let id = frame["order_id"].as_u64().unwrap();

        // The pump sees the fills but the reconciler never does.
        rig.deliver_pump_only(status(id, OrderStatusKind::Submitted, None)).await;
        rig.deliver_pump_only(fill(id, "TQQQ", OrderSide::Buy, 50, dec!(450), 1)).await;

        let err = task.await.unwrap().unwrap_err();
        match err {
            ExecutionError::VerificationFailed {
                expected, actual, ..
            } => {
                assert_eq!(expected, Qty::new(50));
                assert_eq!(actual, Qty::ZERO);
            }
            other => panic!("expected VerificationFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_halted_reconciler_blocks_submissions() {
        let rig = Rig::new().await;
        let symbol = Symbol::new("TQQQ");

        // Unmet expectation surviving two resyncs halts trading.
        rig.reconciler
            .expect_position(symbol.clone(), Qty::new(111))
            .await;
        for _ in 0..2 {
            rig.reconciler.apply_event(GatewayEvent::ResyncBegin).await;
            rig.reconciler
                .apply_event(resync_pos("TQQQ", 100, dec!(450)))
                .await;
            rig.reconciler.apply_event(GatewayEvent::ResyncEnd).await;
            settle_tasks().await;
        }
        assert!(rig.reconciler.is_halted());

        let err = rig
            .executor
            .submit_position_change(&symbol, Qty::new(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Halted { .. }));
    }

    #[tokio::test]
    async fn test_reset_clears_tracking_and_waiters_go_indeterminate() {
        let mut rig = Rig::new().await;
        let symbol = Symbol::new("TQQQ");

        let executor = rig.executor.clone();
        let sym = symbol.clone();
        let task =
            tokio::spawn(async move { executor.submit_position_change(&sym, Qty::new(10)).await });

        let _place = rig.next_frame().await;
        assert_eq!(rig.executor.tracked_order_count(), 1);

        rig.executor.reset();
        assert_eq!(rig.executor.tracked_order_count(), 0);
        assert_eq!(rig.executor.in_flight_count(), 0);

        // The dropped slot closes the waiter's channel; after the cancel
        // attempt goes unanswered the outcome is indeterminate.
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ExecutionError::Indeterminate { .. }));
    }
}
