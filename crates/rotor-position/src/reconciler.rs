//! Position reconciliation actor.
//!
//! Single-threaded actor owning the authoritative position table and the
//! last account snapshot. The table is built exclusively from execution
//! events; order statuses are advisory and never move a position. Resync
//! bursts from the gateway wholesale-replace the table, and executions
//! arriving mid-burst are buffered and applied after the replacement.
//!
//! # Actor vs handle state
//!
//! The actor owns the authoritative `HashMap` table and mutates it only
//! while processing its mailbox, so position math needs no locking. The
//! handle shares `DashMap`/`RwLock` caches the actor publishes into,
//! giving the executor and risk path synchronous reads without a channel
//! round trip.
//!
//! # Drift policy
//!
//! After every completed order the executor posts the quantity it
//! expects the table to show. A mismatch opens a drift entry; an entry
//! still mismatched after two consecutive resyncs escalates to
//! `PersistentDrift`, which halts submissions until an operator
//! acknowledges.

use crate::error::{ReconciliationError, ReconciliationResult};
use dashmap::DashMap;
use parking_lot::RwLock;
use rotor_core::{
    AccountSnapshot, Execution, GatewayEvent, OrderId, Position, ProtocolError, Qty, Symbol,
};
use rotor_telemetry::Metrics;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// How many resyncs a mismatch may survive before trading halts.
const DRIFT_STRIKE_LIMIT: u8 = 2;

// ============================================================================
// Messages
// ============================================================================

/// Messages for the reconciler actor.
#[derive(Debug)]
pub enum ReconcilerMsg {
    /// Apply one fill to the table.
    Execution(Execution),

    /// Replace the account snapshot.
    AccountSummary(AccountSnapshot),

    /// A resync burst starts; buffer fills until it ends.
    ResyncBegin,

    /// One position inside the current resync burst.
    ResyncPosition(Position),

    /// Burst complete; wholesale-replace the table.
    ResyncEnd,

    /// An order this session is about to submit; fills referencing it
    /// are legitimate.
    RegisterOrder(OrderId),

    /// Order reached a clean terminal state; forget its id.
    ReleaseOrder(OrderId),

    /// Executor's post-completion expectation for a symbol.
    ExpectPosition { symbol: Symbol, expected: Qty },

    /// Reconnect: clear session-scoped tracking. The table stays until
    /// the forced resync replaces it.
    Reset,

    /// Operator acknowledged a drift halt.
    AcknowledgeDrift,

    /// Graceful shutdown.
    Shutdown,
}

#[derive(Debug)]
struct DriftEntry {
    expected: Qty,
    /// Consecutive resyncs that ended with the mismatch still present.
    strikes: u8,
}

// ============================================================================
// ReconcilerTask
// ============================================================================

/// Reconciler actor task. Processes messages sequentially.
pub struct ReconcilerTask {
    rx: mpsc::Receiver<ReconcilerMsg>,

    /// Authoritative table: symbol -> position. Flat positions are
    /// removed, never stored.
    positions: HashMap<Symbol, Position>,

    /// Order ids submitted (and not yet released) this session.
    known_orders: HashSet<OrderId>,

    /// Buffer for fills and expectations received mid-resync.
    resync_buffer: Vec<ReconcilerMsg>,

    /// Positions collected from the current burst.
    resync_incoming: Vec<Position>,

    in_resync: bool,

    /// Open drift entries by symbol.
    drift: HashMap<Symbol, DriftEntry>,

    // === Shared with the handle ===
    positions_data: Arc<DashMap<Symbol, Position>>,
    account: Arc<RwLock<AccountSnapshot>>,
    halted: Arc<RwLock<Option<ReconciliationError>>>,
    resync_watch: watch::Sender<u64>,

    /// Protocol violations surface here; the session supervisor drops
    /// the connection in response.
    violation_tx: mpsc::Sender<ProtocolError>,
}

impl ReconcilerTask {
    /// Run the reconciler until `Shutdown` or the mailbox closes.
    pub async fn run(mut self) {
        debug!("Reconciler started");

        while let Some(msg) = self.rx.recv().await {
            match msg {
                ReconcilerMsg::Shutdown => {
                    debug!("Reconciler shutting down");
                    break;
                }
                msg if self.in_resync && Self::buffer_during_resync(&msg) => {
                    trace!(?msg, "Buffering message during resync");
                    self.resync_buffer.push(msg);
                }
                msg => self.handle_message(msg),
            }
        }

        debug!("Reconciler terminated");
    }

    /// Fills and expectations wait out a resync; everything else is
    /// processed immediately.
    fn buffer_during_resync(msg: &ReconcilerMsg) -> bool {
        matches!(
            msg,
            ReconcilerMsg::Execution(_) | ReconcilerMsg::ExpectPosition { .. }
        )
    }

    fn handle_message(&mut self, msg: ReconcilerMsg) {
        match msg {
            ReconcilerMsg::Execution(exec) => self.on_execution(exec),
            ReconcilerMsg::AccountSummary(snapshot) => self.on_account_summary(snapshot),
            ReconcilerMsg::ResyncBegin => self.on_resync_begin(),
            ReconcilerMsg::ResyncPosition(position) => self.on_resync_position(position),
            ReconcilerMsg::ResyncEnd => self.on_resync_end(),
            ReconcilerMsg::RegisterOrder(order_id) => {
                trace!(order_id = order_id.inner(), "Order registered");
                self.known_orders.insert(order_id);
            }
            ReconcilerMsg::ReleaseOrder(order_id) => {
                trace!(order_id = order_id.inner(), "Order released");
                self.known_orders.remove(&order_id);
            }
            ReconcilerMsg::ExpectPosition { symbol, expected } => {
                self.on_expect_position(symbol, expected);
            }
            ReconcilerMsg::Reset => self.on_reset(),
            ReconcilerMsg::AcknowledgeDrift => self.on_acknowledge_drift(),
            ReconcilerMsg::Shutdown => unreachable!("Shutdown handled in run()"),
        }
    }

    fn on_execution(&mut self, exec: Execution) {
        if !self.known_orders.contains(&exec.order_id) {
            error!(
                order_id = exec.order_id.inner(),
                exec_id = %exec.exec_id,
                symbol = %exec.symbol,
                "Execution references an order this session never submitted"
            );
            let violation = ProtocolError::UnknownOrderReference {
                order_id: exec.order_id,
            };
            if self.violation_tx.try_send(violation).is_err() {
                warn!("Violation channel full or closed");
            }
            // The fill is not applied; the forced resync carries the truth.
            return;
        }

        trace!(
            order_id = exec.order_id.inner(),
            symbol = %exec.symbol,
            quantity = exec.quantity.inner(),
            side = %exec.side,
            "Applying execution"
        );
        self.apply_execution(&exec);
        self.publish_positions();
    }

    /// Fold one fill into the table.
    ///
    /// Same direction extends the position and folds the price into the
    /// volume-weighted average cost; the opposite direction reduces at
    /// the held average, and a fill past flat flips the position with a
    /// fresh cost basis at the fill price.
    fn apply_execution(&mut self, exec: &Execution) {
        let delta = exec.signed_quantity();
        let symbol = exec.symbol.clone();

        let Some(pos) = self.positions.get_mut(&symbol) else {
            self.positions.insert(
                symbol.clone(),
                Position::new(symbol, delta, exec.price, exec.timestamp_ms),
            );
            return;
        };

        let old_qty = pos.quantity.inner();
        let new_qty = old_qty + delta.inner();
        pos.last_update_ms = exec.timestamp_ms;

        if old_qty.signum() == delta.inner().signum() {
            // Extending: new avg = (|old|*avg + |delta|*price) / |new|
            let old_abs = Decimal::from(old_qty.abs());
            let add_abs = Decimal::from(delta.inner().abs());
            let total = old_abs + add_abs;
            pos.avg_cost = rotor_core::Price::new(
                (pos.avg_cost.inner() * old_abs + exec.price.inner() * add_abs) / total,
            );
            pos.quantity = Qty::new(new_qty);
        } else if new_qty == 0 {
            self.positions.remove(&exec.symbol);
        } else if new_qty.signum() == old_qty.signum() {
            // Partial reduction keeps the entry cost.
            pos.quantity = Qty::new(new_qty);
        } else {
            // Flipped through flat; the surviving quantity entered here.
            pos.quantity = Qty::new(new_qty);
            pos.avg_cost = exec.price;
        }
    }

    fn on_account_summary(&mut self, snapshot: AccountSnapshot) {
        debug!(
            cash = %snapshot.cash,
            buying_power = %snapshot.buying_power,
            net_liquidation = %snapshot.net_liquidation,
            "Account snapshot replaced"
        );
        Metrics::net_liquidation(snapshot.net_liquidation.to_f64());
        Metrics::buying_power(snapshot.buying_power.to_f64());
        *self.account.write() = snapshot;
    }

    fn on_resync_begin(&mut self) {
        if self.in_resync {
            warn!("resync_begin while already resyncing, restarting collection");
        }
        debug!("Resync burst started");
        self.in_resync = true;
        self.resync_incoming.clear();
    }

    fn on_resync_position(&mut self, position: Position) {
        if !self.in_resync {
            warn!(symbol = %position.symbol, "Stray resync position outside a burst, ignoring");
            return;
        }
        self.resync_incoming.push(position);
    }

    fn on_resync_end(&mut self) {
        if !self.in_resync {
            warn!("Stray resync_end outside a burst, ignoring");
            return;
        }
        self.in_resync = false;

        let incoming = std::mem::take(&mut self.resync_incoming);
        debug!(
            existing = self.positions.len(),
            incoming = incoming.len(),
            "Applying resync replacement"
        );

        // Add/update first, remove stale after, so a position is never
        // transiently absent from the shared cache.
        let incoming_symbols: HashSet<Symbol> =
            incoming.iter().map(|p| p.symbol.clone()).collect();
        for position in incoming {
            if position.is_flat() {
                continue;
            }
            self.positions
                .insert(position.symbol.clone(), position.clone());
            self.positions_data.insert(position.symbol.clone(), position);
        }
        let stale: Vec<Symbol> = self
            .positions
            .keys()
            .filter(|s| !incoming_symbols.contains(*s))
            .cloned()
            .collect();
        for symbol in stale {
            debug!(%symbol, "Removing stale position");
            self.positions.remove(&symbol);
            self.positions_data.remove(&symbol);
        }

        // Fills that raced the burst apply on top of the replacement.
        let buffered = std::mem::take(&mut self.resync_buffer);
        if !buffered.is_empty() {
            debug!(count = buffered.len(), "Applying buffered messages");
            for msg in buffered {
                self.handle_message(msg);
            }
        }

        self.check_drift_after_resync();
        self.publish_positions();

        let generation = *self.resync_watch.borrow() + 1;
        let _ = self.resync_watch.send_replace(generation);
        info!(
            generation,
            positions = self.positions.len(),
            "Resync complete"
        );
    }

    /// Strike every still-mismatched drift entry; escalate at the limit.
    fn check_drift_after_resync(&mut self) {
        let mut escalation: Option<ReconciliationError> = None;

        self.drift.retain(|symbol, entry| {
            let reported = self
                .positions
                .get(symbol)
                .map(|p| p.quantity)
                .unwrap_or(Qty::ZERO);

            if reported == entry.expected {
                info!(%symbol, quantity = reported.inner(), "Drift cleared by resync");
                return false;
            }

            entry.strikes += 1;
            warn!(
                %symbol,
                expected = entry.expected.inner(),
                reported = reported.inner(),
                strikes = entry.strikes,
                "Drift persists after resync"
            );

            if entry.strikes >= DRIFT_STRIKE_LIMIT && escalation.is_none() {
                escalation = Some(ReconciliationError::PersistentDrift {
                    symbol: symbol.clone(),
                    expected: entry.expected,
                    reported,
                });
            }
            true
        });

        if let Some(err) = escalation {
            error!(error = %err, "Persistent drift, halting trading");
            Metrics::trading_halted(true);
            *self.halted.write() = Some(err);
        }
    }

    fn on_expect_position(&mut self, symbol: Symbol, expected: Qty) {
        let reported = self
            .positions
            .get(&symbol)
            .map(|p| p.quantity)
            .unwrap_or(Qty::ZERO);

        if reported == expected {
            if self.drift.remove(&symbol).is_some() {
                info!(%symbol, "Drift entry cleared, expectation met");
            }
            return;
        }

        warn!(
            %symbol,
            expected = expected.inner(),
            reported = reported.inner(),
            "Position does not match executor expectation"
        );
        Metrics::drift_detected(symbol.as_str());
        // A new expectation supersedes any open entry for the symbol.
        self.drift.insert(
            symbol,
            DriftEntry {
                expected,
                strikes: 0,
            },
        );
    }

    fn on_reset(&mut self) {
        info!(
            known_orders = self.known_orders.len(),
            buffered = self.resync_buffer.len(),
            "Reconciler reset for new session"
        );
        self.known_orders.clear();
        self.in_resync = false;
        self.resync_incoming.clear();
        // Buffered fills belong to the dead session; the forced resync
        // replaces the table anyway.
        self.resync_buffer.clear();
    }

    fn on_acknowledge_drift(&mut self) {
        let cleared = self.drift.len();
        self.drift.clear();
        *self.halted.write() = None;
        Metrics::trading_halted(false);
        info!(cleared, "Drift acknowledged by operator, trading resumed");
    }

    /// Mirror the authoritative table into the shared cache.
    fn publish_positions(&self) {
        for (symbol, position) in &self.positions {
            self.positions_data
                .insert(symbol.clone(), position.clone());
        }
        self.positions_data
            .retain(|symbol, _| self.positions.contains_key(symbol));
        Metrics::open_positions(self.positions.len() as i64);
    }
}

// ============================================================================
// ReconcilerHandle
// ============================================================================

/// Handle for the reconciler actor.
///
/// Async methods feed the mailbox; sync methods read the shared caches.
#[derive(Clone)]
pub struct ReconcilerHandle {
    tx: mpsc::Sender<ReconcilerMsg>,
    positions_data: Arc<DashMap<Symbol, Position>>,
    account: Arc<RwLock<AccountSnapshot>>,
    halted: Arc<RwLock<Option<ReconciliationError>>>,
    resync_rx: watch::Receiver<u64>,
}

impl ReconcilerHandle {
    // === Async methods (send to actor) ===

    /// Route one gateway event into the mailbox. Events outside the
    /// reconciler's concern are ignored.
    pub async fn apply_event(&self, event: GatewayEvent) {
        let msg = match event {
            GatewayEvent::Execution(exec) => ReconcilerMsg::Execution(exec),
            GatewayEvent::AccountSummary(snapshot) => ReconcilerMsg::AccountSummary(snapshot),
            GatewayEvent::ResyncBegin => ReconcilerMsg::ResyncBegin,
            GatewayEvent::ResyncPosition(position) => ReconcilerMsg::ResyncPosition(position),
            GatewayEvent::ResyncEnd => ReconcilerMsg::ResyncEnd,
            other => {
                debug!(kind = ?other.kind(), "Reconciler ignoring event");
                return;
            }
        };
        let _ = self.tx.send(msg).await;
    }

    /// Mark an order id as belonging to this session. Must complete
    /// before the order frame is sent.
    pub async fn register_order(&self, order_id: OrderId) {
        let _ = self.tx.send(ReconcilerMsg::RegisterOrder(order_id)).await;
    }

    pub async fn release_order(&self, order_id: OrderId) {
        let _ = self.tx.send(ReconcilerMsg::ReleaseOrder(order_id)).await;
    }

    /// Post the quantity the executor expects the table to show.
    pub async fn expect_position(&self, symbol: Symbol, expected: Qty) {
        let _ = self
            .tx
            .send(ReconcilerMsg::ExpectPosition { symbol, expected })
            .await;
    }

    /// Clear session-scoped tracking after a reconnect.
    pub async fn reset(&self) {
        let _ = self.tx.send(ReconcilerMsg::Reset).await;
    }

    /// Operator acknowledgment of a drift halt. The facade runs a
    /// resync first so the table is fresh when trading resumes.
    pub async fn acknowledge_drift(&self) {
        let _ = self.tx.send(ReconcilerMsg::AcknowledgeDrift).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(ReconcilerMsg::Shutdown).await;
    }

    /// Wait until a resync completes that started after this call.
    ///
    /// Returns the new resync generation.
    pub async fn wait_for_resync(&self, wait: Duration) -> ReconciliationResult<u64> {
        let start_generation = *self.resync_rx.borrow();
        self.wait_past_generation(start_generation, wait).await
    }

    /// Wait until the resync generation exceeds `start_generation`.
    ///
    /// Callers that trigger a resync themselves should capture the
    /// generation first, then request, then wait; the completion cannot
    /// be missed that way.
    pub async fn wait_past_generation(
        &self,
        start_generation: u64,
        wait: Duration,
    ) -> ReconciliationResult<u64> {
        let started = Instant::now();
        let mut rx = self.resync_rx.clone();

        let waiter = async {
            loop {
                let generation = *rx.borrow_and_update();
                if generation > start_generation {
                    return Some(generation);
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        };

        match tokio::time::timeout(wait, waiter).await {
            Ok(Some(generation)) => Ok(generation),
            // Channel closed means the actor is gone and no resync can
            // ever complete; surface it the same way as a timeout.
            Ok(None) | Err(_) => Err(ReconciliationError::ResyncTimeout {
                waited_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }

    // === Sync methods (cache reads) ===

    /// Current position for a symbol; flat if never traded.
    pub fn current_position(&self, symbol: &Symbol) -> Position {
        self.positions_data
            .get(symbol)
            .map(|entry| entry.clone())
            .unwrap_or_else(|| Position::flat(symbol.clone()))
    }

    pub fn all_positions(&self) -> Vec<Position> {
        self.positions_data
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn position_count(&self) -> usize {
        self.positions_data.len()
    }

    /// Last account snapshot reported by the gateway.
    pub fn account_snapshot(&self) -> AccountSnapshot {
        self.account.read().clone()
    }

    /// Whether a persistent-drift halt is in force.
    pub fn is_halted(&self) -> bool {
        self.halted.read().is_some()
    }

    pub fn halt_reason(&self) -> Option<ReconciliationError> {
        self.halted.read().clone()
    }

    /// Completed-resync counter; bumps once per `ResyncEnd`.
    pub fn resync_generation(&self) -> u64 {
        *self.resync_rx.borrow()
    }
}

// ============================================================================
// Spawn function
// ============================================================================

/// Spawn the reconciler actor.
///
/// Protocol violations (executions referencing unknown orders) are
/// reported on `violation_tx`; the session supervisor reacts by
/// dropping the connection.
#[must_use]
pub fn spawn_reconciler(
    capacity: usize,
    violation_tx: mpsc::Sender<ProtocolError>,
) -> (ReconcilerHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity);
    let (resync_watch, resync_rx) = watch::channel(0u64);

    let positions_data = Arc::new(DashMap::new());
    let account = Arc::new(RwLock::new(AccountSnapshot::empty()));
    let halted = Arc::new(RwLock::new(None));

    let task = ReconcilerTask {
        rx,
        positions: HashMap::new(),
        known_orders: HashSet::new(),
        resync_buffer: Vec::new(),
        resync_incoming: Vec::new(),
        in_resync: false,
        drift: HashMap::new(),
        positions_data: Arc::clone(&positions_data),
        account: Arc::clone(&account),
        halted: Arc::clone(&halted),
        resync_watch,
        violation_tx,
    };

    let handle = ReconcilerHandle {
        tx,
        positions_data,
        account,
        halted,
        resync_rx,
    };

    let join_handle = tokio::spawn(task.run());

    (handle, join_handle)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rotor_core::{OrderSide, Price};
    use rust_decimal_macros::dec;

    fn exec(order_id: u64, symbol: &str, side: OrderSide, qty: i64, price: Decimal) -> Execution {
        Execution {
            order_id: OrderId::new(order_id),
            exec_id: format!("x-{order_id}-{qty}"),
            symbol: Symbol::new(symbol),
            side,
            quantity: Qty::new(qty),
            price: Price::new(price),
            timestamp_ms: 1_700_000_000_000,
        }
    }

    fn resync_position(symbol: &str, qty: i64, avg_cost: Decimal) -> Position {
        Position::new(
            Symbol::new(symbol),
            Qty::new(qty),
            Price::new(avg_cost),
            1_700_000_000_000,
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn setup() -> (
        ReconcilerHandle,
        mpsc::Receiver<ProtocolError>,
        JoinHandle<()>,
    ) {
        let (violation_tx, violation_rx) = mpsc::channel(8);
        let (handle, join) = spawn_reconciler(64, violation_tx);
        (handle, violation_rx, join)
    }

    #[tokio::test]
    async fn test_partial_fills_equal_one_big_fill() {
        let (handle, _violations, _join) = setup();
        handle.register_order(OrderId::new(1)).await;
        handle.register_order(OrderId::new(2)).await;

        // Three slices of one order.
        for qty in [40, 60, 11] {
            handle
                .apply_event(GatewayEvent::Execution(exec(
                    1,
                    "TQQQ",
                    OrderSide::Buy,
                    qty,
                    dec!(450),
                )))
                .await;
        }
        // One fill of the full quantity on another symbol.
        handle
            .apply_event(GatewayEvent::Execution(exec(
                2,
                "QQQ",
                OrderSide::Buy,
                111,
                dec!(450),
            )))
            .await;
        settle().await;

        let sliced = handle.current_position(&Symbol::new("TQQQ"));
        let whole = handle.current_position(&Symbol::new("QQQ"));
        assert_eq!(sliced.quantity, Qty::new(111));
        assert_eq!(sliced.quantity, whole.quantity);
        assert_eq!(sliced.avg_cost, whole.avg_cost);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_vwap_reduce_and_flip() {
        let (handle, _violations, _join) = setup();
        for id in 1..=4 {
            handle.register_order(OrderId::new(id)).await;
        }

        // 50 @ 100 + 50 @ 110 -> 100 @ 105
        handle
            .apply_event(GatewayEvent::Execution(exec(
                1,
                "TQQQ",
                OrderSide::Buy,
                50,
                dec!(100),
            )))
            .await;
        handle
            .apply_event(GatewayEvent::Execution(exec(
                2,
                "TQQQ",
                OrderSide::Buy,
                50,
                dec!(110),
            )))
            .await;
        settle().await;

        let pos = handle.current_position(&Symbol::new("TQQQ"));
        assert_eq!(pos.quantity, Qty::new(100));
        assert_eq!(pos.avg_cost, Price::new(dec!(105)));

        // Selling 40 keeps the entry cost.
        handle
            .apply_event(GatewayEvent::Execution(exec(
                3,
                "TQQQ",
                OrderSide::Sell,
                40,
                dec!(120),
            )))
            .await;
        settle().await;

        let pos = handle.current_position(&Symbol::new("TQQQ"));
        assert_eq!(pos.quantity, Qty::new(60));
        assert_eq!(pos.avg_cost, Price::new(dec!(105)));

        // Selling 90 flips short 30 with a fresh basis at the fill price.
        handle
            .apply_event(GatewayEvent::Execution(exec(
                4,
                "TQQQ",
                OrderSide::Sell,
                90,
                dec!(118),
            )))
            .await;
        settle().await;

        let pos = handle.current_position(&Symbol::new("TQQQ"));
        assert_eq!(pos.quantity, Qty::new(-30));
        assert_eq!(pos.avg_cost, Price::new(dec!(118)));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_close_removes_position() {
        let (handle, _violations, _join) = setup();
        handle.register_order(OrderId::new(1)).await;
        handle.register_order(OrderId::new(2)).await;

        handle
            .apply_event(GatewayEvent::Execution(exec(
                1,
                "SOXL",
                OrderSide::Buy,
                25,
                dec!(30),
            )))
            .await;
        handle
            .apply_event(GatewayEvent::Execution(exec(
                2,
                "SOXL",
                OrderSide::Sell,
                25,
                dec!(31),
            )))
            .await;
        settle().await;

        assert_eq!(handle.position_count(), 0);
        assert!(handle.current_position(&Symbol::new("SOXL")).is_flat());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_resync_wholesale_replace_removes_stale() {
        let (handle, _violations, _join) = setup();
        handle.register_order(OrderId::new(1)).await;
        handle.register_order(OrderId::new(2)).await;

        handle
            .apply_event(GatewayEvent::Execution(exec(
                1,
                "TQQQ",
                OrderSide::Buy,
                100,
                dec!(50),
            )))
            .await;
        handle
            .apply_event(GatewayEvent::Execution(exec(
                2,
                "QQQ",
                OrderSide::Buy,
                50,
                dec!(400),
            )))
            .await;
        settle().await;
        assert_eq!(handle.position_count(), 2);
        assert_eq!(handle.resync_generation(), 0);

        // The gateway now reports only TQQQ at a different quantity.
        handle.apply_event(GatewayEvent::ResyncBegin).await;
        handle
            .apply_event(GatewayEvent::ResyncPosition(resync_position(
                "TQQQ",
                70,
                dec!(51),
            )))
            .await;
        handle.apply_event(GatewayEvent::ResyncEnd).await;
        settle().await;

        assert_eq!(handle.resync_generation(), 1);
        assert_eq!(handle.position_count(), 1);
        let pos = handle.current_position(&Symbol::new("TQQQ"));
        assert_eq!(pos.quantity, Qty::new(70));
        assert!(
            handle.current_position(&Symbol::new("QQQ")).is_flat(),
            "stale symbol must be removed"
        );

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_fill_during_resync_applies_after_replace() {
        let (handle, _violations, _join) = setup();
        handle.register_order(OrderId::new(9)).await;

        handle.apply_event(GatewayEvent::ResyncBegin).await;
        handle
            .apply_event(GatewayEvent::ResyncPosition(resync_position(
                "TQQQ",
                100,
                dec!(50),
            )))
            .await;
        // This fill races the burst; it must land on the replaced table.
        handle
            .apply_event(GatewayEvent::Execution(exec(
                9,
                "TQQQ",
                OrderSide::Buy,
                11,
                dec!(52),
            )))
            .await;
        handle.apply_event(GatewayEvent::ResyncEnd).await;
        settle().await;

        let pos = handle.current_position(&Symbol::new("TQQQ"));
        assert_eq!(pos.quantity, Qty::new(111));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_order_execution_raises_violation() {
        let (handle, mut violations, _join) = setup();

        handle
            .apply_event(GatewayEvent::Execution(exec(
                777,
                "TQQQ",
                OrderSide::Buy,
                10,
                dec!(50),
            )))
            .await;

        let violation = violations.recv().await.unwrap();
        assert_eq!(
            violation,
            ProtocolError::UnknownOrderReference {
                order_id: OrderId::new(777)
            }
        );
        // The fill itself is not applied.
        assert_eq!(handle.position_count(), 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_reset_clears_known_orders() {
        let (handle, mut violations, _join) = setup();
        handle.register_order(OrderId::new(5)).await;
        handle.reset().await;

        handle
            .apply_event(GatewayEvent::Execution(exec(
                5,
                "TQQQ",
                OrderSide::Buy,
                10,
                dec!(50),
            )))
            .await;

        assert!(violations.recv().await.is_some());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_account_snapshot_replaced_wholesale() {
        let (handle, _violations, _join) = setup();
        assert!(handle.account_snapshot().is_empty());

        handle
            .apply_event(GatewayEvent::AccountSummary(AccountSnapshot::new(
                Price::new(dec!(100000)),
                Price::new(dec!(400000)),
                Price::new(dec!(100000)),
                1_700_000_000_000,
            )))
            .await;
        settle().await;

        let snap = handle.account_snapshot();
        assert_eq!(snap.buying_power, Price::new(dec!(400000)));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_drift_escalates_after_two_resyncs_and_acknowledge_clears() {
        let (handle, _violations, _join) = setup();
        handle.register_order(OrderId::new(1)).await;

        handle
            .apply_event(GatewayEvent::Execution(exec(
                1,
                "TQQQ",
                OrderSide::Buy,
                100,
                dec!(50),
            )))
            .await;
        // The executor expected 111; the table says 100.
        handle
            .expect_position(Symbol::new("TQQQ"), Qty::new(111))
            .await;
        settle().await;
        assert!(!handle.is_halted());

        let run_resync = |qty: i64| {
            let handle = handle.clone();
            async move {
                handle.apply_event(GatewayEvent::ResyncBegin).await;
                handle
                    .apply_event(GatewayEvent::ResyncPosition(resync_position(
                        "TQQQ",
                        qty,
                        dec!(50),
                    )))
                    .await;
                handle.apply_event(GatewayEvent::ResyncEnd).await;
                settle().await;
            }
        };

        // First resync still reports 100: strike one, no halt yet.
        run_resync(100).await;
        assert!(!handle.is_halted());

        // Second consecutive mismatch: halt.
        run_resync(100).await;
        assert!(handle.is_halted());
        assert!(matches!(
            handle.halt_reason(),
            Some(ReconciliationError::PersistentDrift { expected, reported, .. })
                if expected == Qty::new(111) && reported == Qty::new(100)
        ));

        handle.acknowledge_drift().await;
        settle().await;
        assert!(!handle.is_halted());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_drift_cleared_when_resync_matches() {
        let (handle, _violations, _join) = setup();
        handle.register_order(OrderId::new(1)).await;

        handle
            .apply_event(GatewayEvent::Execution(exec(
                1,
                "TQQQ",
                OrderSide::Buy,
                100,
                dec!(50),
            )))
            .await;
        handle
            .expect_position(Symbol::new("TQQQ"), Qty::new(111))
            .await;
        settle().await;

        // The gateway agrees with the expectation; the entry clears.
        handle.apply_event(GatewayEvent::ResyncBegin).await;
        handle
            .apply_event(GatewayEvent::ResyncPosition(resync_position(
                "TQQQ",
                111,
                dec!(50),
            )))
            .await;
        handle.apply_event(GatewayEvent::ResyncEnd).await;
        settle().await;
        assert!(!handle.is_halted());

        // Later mismatched resyncs start a fresh count.
        handle.apply_event(GatewayEvent::ResyncBegin).await;
        handle
            .apply_event(GatewayEvent::ResyncPosition(resync_position(
                "TQQQ",
                100,
                dec!(50),
            )))
            .await;
        handle.apply_event(GatewayEvent::ResyncEnd).await;
        settle().await;
        assert!(!handle.is_halted());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_wait_for_resync() {
        let (handle, _violations, _join) = setup();

        let err = handle
            .wait_for_resync(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconciliationError::ResyncTimeout { .. }));

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_for_resync(Duration::from_secs(1)).await })
        };
        // Let the waiter park on the watch channel before the burst.
        settle().await;

        handle.apply_event(GatewayEvent::ResyncBegin).await;
        handle.apply_event(GatewayEvent::ResyncEnd).await;

        let generation = waiter.await.unwrap().unwrap();
        assert_eq!(generation, 1);

        handle.shutdown().await;
    }
}
