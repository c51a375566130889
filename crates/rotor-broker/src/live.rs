//! The live broker: gateway-backed composition.
//!
//! Wires the connection manager, dispatcher, reconciler, risk validator
//! and order executor into one facade. The session lifecycle is
//! one-shot: construct, `connect`, trade, `disconnect`. Reconnects
//! within a session are handled internally by the supervisor task; a
//! disconnected broker cannot be reopened.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rotor_core::{
    Bar, BarInterval, ClientId, ConnectionEvent, EquityPoint, EventKind, GatewayEvent,
    OrderOutcome, OrderSide, Position, Price, ProtocolError, Qty, Quote, Symbol, TradeRecord,
};
use rotor_executor::{ExecutorConfig, OrderExecutor};
use rotor_gateway::{
    ConnectionConfig, ConnectionManager, DispatchStats, Dispatcher, GatewayClient, GatewayError,
    PendingRequests, QuoteCache,
};
use rotor_position::{spawn_reconciler, ReconcilerHandle};
use rotor_risk::{RiskConfig, RiskValidator, ValidationError};
use rotor_telemetry::Metrics;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerConfig};
use crate::error::{BrokerError, BrokerResult};
use crate::now_ms;
use crate::performance::{PerformanceReport, PerformanceTracker};
use crate::sizing;

const MESSAGE_QUEUE_DEPTH: usize = 1024;
const CONNECTION_EVENT_DEPTH: usize = 32;
const VIOLATION_QUEUE_DEPTH: usize = 16;
const RECONCILER_QUEUE_DEPTH: usize = 256;
const SUBSCRIBER_QUEUE_DEPTH: usize = 256;
const STATUS_QUEUE_DEPTH: usize = 64;

/// Dispatch counter logging cadence.
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Channel ends and the dispatcher, consumed when the session starts.
struct SessionWiring {
    dispatcher: Dispatcher,
    conn_rx: mpsc::Receiver<ConnectionEvent>,
    violation_rx: mpsc::Receiver<ProtocolError>,
    reconciler_rx: mpsc::Receiver<GatewayEvent>,
    executor_rx: mpsc::Receiver<GatewayEvent>,
    status_rx: mpsc::Receiver<GatewayEvent>,
    reconciler_join: JoinHandle<()>,
}

pub struct LiveBroker {
    config: BrokerConfig,
    manager: Arc<ConnectionManager>,
    client: GatewayClient,
    executor: OrderExecutor,
    reconciler: ReconcilerHandle,
    validator: Arc<RiskValidator>,
    tracker: Mutex<PerformanceTracker>,
    shutdown: CancellationToken,
    stats: Arc<DispatchStats>,
    wiring: Option<SessionWiring>,
    tasks: Vec<JoinHandle<()>>,
}

impl LiveBroker {
    #[must_use]
    pub fn new(
        config: BrokerConfig,
        connection: ConnectionConfig,
        risk: RiskConfig,
        executor_config: ExecutorConfig,
    ) -> Self {
        let client_id = if config.client_id.is_empty() {
            ClientId::generate()
        } else {
            ClientId::from_string(config.client_id.clone())
        };

        let (message_tx, message_rx) = mpsc::channel(MESSAGE_QUEUE_DEPTH);
        let (conn_tx, conn_rx) = mpsc::channel(CONNECTION_EVENT_DEPTH);
        let (violation_tx, violation_rx) = mpsc::channel(VIOLATION_QUEUE_DEPTH);

        let manager = Arc::new(ConnectionManager::new(
            connection.clone(),
            client_id,
            message_tx,
            conn_tx,
        ));
        let pending = Arc::new(PendingRequests::new(connection.request_timeout_ms));
        let quotes = Arc::new(QuoteCache::new());

        let mut dispatcher = Dispatcher::new(message_rx, Arc::clone(&pending), Arc::clone(&quotes));
        let reconciler_rx = dispatcher.subscribe(
            "reconciler",
            vec![EventKind::Executions, EventKind::Account, EventKind::Resync],
            SUBSCRIBER_QUEUE_DEPTH,
        );
        // Order-scoped gateway errors arrive as Status-class events.
        let executor_rx = dispatcher.subscribe(
            "executor",
            vec![EventKind::Orders, EventKind::Executions, EventKind::Status],
            SUBSCRIBER_QUEUE_DEPTH,
        );
        let status_rx = dispatcher.subscribe("status", vec![EventKind::Status], STATUS_QUEUE_DEPTH);
        let stats = dispatcher.stats();

        let (reconciler, reconciler_join) = spawn_reconciler(RECONCILER_QUEUE_DEPTH, violation_tx);
        let client = GatewayClient::new(
            manager.outbound_sender(),
            manager.state_rx(),
            Arc::clone(&pending),
            Arc::clone(&quotes),
        );
        let validator = Arc::new(RiskValidator::new(risk, reconciler.clone()));
        let executor = OrderExecutor::new(
            client.clone(),
            reconciler.clone(),
            Arc::clone(&validator),
            executor_config,
        );
        let tracker = Mutex::new(PerformanceTracker::new(Price::new(config.total_capital)));

        Self {
            config,
            manager,
            client,
            executor,
            reconciler,
            validator,
            tracker,
            shutdown: CancellationToken::new(),
            stats,
            wiring: Some(SessionWiring {
                dispatcher,
                conn_rx,
                violation_rx,
                reconciler_rx,
                executor_rx,
                status_rx,
                reconciler_join,
            }),
            tasks: Vec::new(),
        }
    }

    /// Net liquidation from the latest snapshot, or the configured
    /// capital before the gateway has reported.
    fn account_value(&self) -> Price {
        let snapshot = self.reconciler.account_snapshot();
        if snapshot.is_empty() {
            Price::new(self.config.total_capital)
        } else {
            snapshot.net_liquidation
        }
    }

    async fn reference_price(&self, symbol: &Symbol) -> BrokerResult<Price> {
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
            .ok_or_else(|| BrokerError::NoMarketData {
                symbol: symbol.clone(),
            })
    }

    /// Feeds filled outcomes into the performance history.
    fn record_outcome(&self, outcome: &OrderOutcome) {
        if let OrderOutcome::Filled {
            symbol,
            side,
            quantity,
            avg_fill_price,
            ..
        } = outcome
        {
            let timestamp_ms = now_ms();
            let record = TradeRecord {
                timestamp_ms,
                symbol: symbol.clone(),
                side: *side,
                quantity: *quantity,
                price: *avg_fill_price,
                rationale: String::new(),
            };
            let value = self.account_value();
            let mut tracker = self.tracker.lock();
            tracker.record_trade(&record);
            tracker.record_equity(timestamp_ms, value);
        }
    }

    fn spawn_session_tasks(&mut self, wiring: SessionWiring) {
        let SessionWiring {
            dispatcher,
            mut conn_rx,
            mut violation_rx,
            mut reconciler_rx,
            executor_rx,
            mut status_rx,
            reconciler_join,
        } = wiring;

        // Transport.
        let manager = Arc::clone(&self.manager);
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = manager.run().await {
                error!(error = %e, "Connection manager exited");
            }
        }));

        // Frame fan-out.
        self.tasks
            .push(tokio::spawn(dispatcher.run(self.shutdown.child_token())));

        // Reconciler event pump.
        let reconciler = self.reconciler.clone();
        let shutdown = self.shutdown.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = reconciler_rx.recv() => match event {
                        Some(event) => reconciler.apply_event(event).await,
                        None => break,
                    },
                }
            }
            debug!("Reconciler event pump stopped");
        }));

        // Order event pump.
        self.tasks.push(
            self.executor
                .spawn_order_events(executor_rx, self.shutdown.child_token()),
        );

        // Gateway status logging. Order-scoped errors are owned by the
        // executor's pump and skipped here.
        let shutdown = self.shutdown.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = status_rx.recv() => match event {
                        Some(GatewayEvent::Status { code, message }) => {
                            info!(code, message = %message, "Gateway status");
                        }
                        Some(GatewayEvent::Error { code, message, order_id: None }) => {
                            warn!(code, message = %message, "Gateway error");
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
        }));

        // Session supervisor: handshake seeding, resync on (re)connect,
        // protocol violations.
        let manager = Arc::clone(&self.manager);
        let client = self.client.clone();
        let executor = self.executor.clone();
        let reconciler = self.reconciler.clone();
        let shutdown = self.shutdown.clone();
        let watch_symbols = self.config.watch_symbols.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    violation = violation_rx.recv() => match violation {
                        Some(violation) => {
                            error!(error = %violation, "Protocol violation, dropping the session");
                            manager.abort_session();
                        }
                        None => break,
                    },
                    event = conn_rx.recv() => match event {
                        Some(ConnectionEvent::Established { session_id, next_order_id }) => {
                            info!(%session_id, next_order_id, "Session established, resetting tracking");
                            executor.seed(next_order_id);
                            executor.reset();
                            reconciler.reset().await;
                            Metrics::gateway_connected();
                            if !watch_symbols.is_empty() {
                                if let Err(e) = client.subscribe_quotes(&watch_symbols).await {
                                    warn!(error = %e, "Quote subscription failed");
                                }
                            }
                            Metrics::resync("connect");
                            if let Err(e) = client.request_resync().await {
                                error!(error = %e, "Resync request failed");
                            }
                        }
                        Some(ConnectionEvent::Lost { reason }) => {
                            warn!(%reason, "Gateway connection lost");
                            Metrics::gateway_disconnected();
                            Metrics::gateway_reconnect(&reason);
                        }
                        Some(ConnectionEvent::RetriesExhausted) => {
                            error!("Gateway retry budget exhausted, session is over");
                        }
                        None => break,
                    },
                }
            }
            debug!("Session supervisor stopped");
        }));

        // Dispatch counter heartbeat.
        let stats = Arc::clone(&self.stats);
        let shutdown = self.shutdown.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATS_LOG_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let snapshot = stats.snapshot();
                        info!(
                            frames = snapshot.frames,
                            events = snapshot.events,
                            dropped_events = snapshot.dropped_events,
                            requests_completed = snapshot.requests_completed,
                            requests_unmatched = snapshot.requests_unmatched,
                            "Dispatch counters"
                        );
                    }
                }
            }
        }));

        self.tasks.push(reconciler_join);
    }
}

#[async_trait]
impl Broker for LiveBroker {
    async fn connect(&mut self) -> BrokerResult<()> {
        if self.manager.is_connected() {
            return Ok(());
        }
        let wiring = self.wiring.take().ok_or_else(|| {
            BrokerError::Connection(GatewayError::NotReady(
                "broker session cannot be reopened after disconnect".to_string(),
            ))
        })?;

        info!("Starting live broker session");
        self.spawn_session_tasks(wiring);

        let session = self
            .manager
            .wait_connected(Duration::from_millis(self.config.connect_timeout_ms))
            .await?;
        info!(session_id = %session.session_id, "Gateway session up");

        // The supervisor requested a resync on Established; hold the
        // caller until the first refresh lands.
        self.reconciler
            .wait_past_generation(0, Duration::from_millis(self.config.resync_timeout_ms))
            .await?;
        info!(
            positions = self.reconciler.position_count(),
            "Initial state synchronized"
        );
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    async fn disconnect(&mut self) -> BrokerResult<()> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        if let Some(wiring) = self.wiring.take() {
            // Session never started; only the reconciler actor is live.
            self.shutdown.cancel();
            self.reconciler.shutdown().await;
            let _ = wiring.reconciler_join.await;
            return Ok(());
        }

        info!("Stopping live broker session");
        let drain = Duration::from_millis(self.config.drain_timeout_ms);
        if !self.executor.wait_idle(drain).await {
            warn!(
                in_flight = self.executor.in_flight_count(),
                "Disconnecting with orders still in flight"
            );
        }
        self.manager.disconnect();
        self.shutdown.cancel();
        self.reconciler.shutdown().await;
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        Metrics::gateway_disconnected();
        info!("Live broker session closed");
        Ok(())
    }

    async fn market_data(&self, symbol: &Symbol) -> BrokerResult<Quote> {
        if let Some(quote) = self.client.cached_quote(symbol) {
            return Ok(quote);
        }
        Ok(self.client.market_data(symbol).await?)
    }

    async fn historical_data(
        &self,
        symbol: &Symbol,
        days: u32,
        interval: BarInterval,
    ) -> BrokerResult<Vec<Bar>> {
        Ok(self.client.historical_data(symbol, days, interval).await?)
    }

    fn position(&self, symbol: &Symbol) -> Position {
        self.reconciler.current_position(symbol)
    }

    fn all_positions(&self) -> Vec<Position> {
        self.reconciler.all_positions()
    }

    fn account_balance(&self) -> Price {
        self.reconciler.account_snapshot().cash
    }

    fn buying_power(&self) -> Price {
        self.reconciler.account_snapshot().buying_power
    }

    fn portfolio_value(&self) -> Price {
        self.account_value()
    }

    async fn place_order(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        quantity: Qty,
    ) -> BrokerResult<OrderOutcome> {
        if quantity.inner() <= 0 {
            return Err(ValidationError::InvalidQuantity {
                qty: quantity.inner(),
            }
            .into());
        }
        let current = self.reconciler.current_position(symbol).quantity;
        let target = Qty::new(current.inner() + quantity.inner() * side.sign());
        let outcome = self
            .executor
            .submit_position_change(symbol, target)
            .await
            .map_err(BrokerError::from)?;
        self.record_outcome(&outcome);
        Ok(outcome)
    }

    async fn close_position(&self, symbol: &Symbol) -> BrokerResult<OrderOutcome> {
        let outcome = self
            .executor
            .submit_position_change(symbol, Qty::ZERO)
            .await
            .map_err(BrokerError::from)?;
        self.record_outcome(&outcome);
        Ok(outcome)
    }

    async fn validate_order(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        quantity: Qty,
    ) -> BrokerResult<()> {
        let price = self.reference_price(symbol).await?;
        self.validator.validate(symbol, side, quantity, price)?;
        Ok(())
    }

    fn calculate_shares(&self, symbol: &Symbol, price: Price) -> Qty {
        let shares = sizing::shares_for(
            self.account_value().inner(),
            self.config.position_size_pct,
            price,
        );
        debug!(%symbol, %price, shares = shares.inner(), "Sized allocation");
        shares
    }

    fn performance_metrics(&self) -> PerformanceReport {
        self.tracker.lock().report()
    }

    fn record_equity(&self) -> EquityPoint {
        let value = self.account_value();
        self.tracker.lock().record_equity(now_ms(), value)
    }

    async fn force_resync(&self) -> BrokerResult<()> {
        let start = self.reconciler.resync_generation();
        Metrics::resync("forced");
        self.client.request_resync().await?;
        self.reconciler
            .wait_past_generation(start, Duration::from_millis(self.config.resync_timeout_ms))
            .await?;
        Ok(())
    }

    async fn acknowledge_drift(&self) -> BrokerResult<()> {
        self.force_resync().await?;
        self.reconciler.acknowledge_drift().await;
        info!("Drift acknowledged, automated trading resumed");
        Ok(())
    }
}

// ============================================================================
//                                    Tests
// ============================================================================
