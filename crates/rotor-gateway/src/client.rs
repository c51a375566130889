//! Client handle for the gateway.
//!
//! Cheap to clone; every component that talks to the gateway holds one.
//! Outbound frames go through the connection manager's queue, correlated
//! requests block on their pending-request slot, and the quote cache
//! offers the last seen top-of-book without a round trip.

use crate::connection::ConnectionState;
use crate::error::{GatewayError, GatewayResult};
use crate::protocol::GatewayRequest;
use crate::requests::{PendingRequests, RequestKind, RequestOutcome};
use dashmap::DashMap;
use rotor_core::{Bar, BarInterval, Order, OrderId, Quote, Symbol};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Last observed quote per symbol, updated by the dispatcher.
#[derive(Debug, Default)]
pub struct QuoteCache {
    quotes: DashMap<Symbol, Quote>,
}

impl QuoteCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, quote: Quote) {
        self.quotes.insert(quote.symbol.clone(), quote);
    }

    pub fn get(&self, symbol: &Symbol) -> Option<Quote> {
        self.quotes.get(symbol).map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.quotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }
}

/// Handle for sending frames and running correlated requests.
#[derive(Clone)]
pub struct GatewayClient {
    outbound_tx: mpsc::Sender<String>,
    state_rx: watch::Receiver<ConnectionState>,
    pending: Arc<PendingRequests>,
    quotes: Arc<QuoteCache>,
}

impl GatewayClient {
    #[must_use]
    pub fn new(
        outbound_tx: mpsc::Sender<String>,
        state_rx: watch::Receiver<ConnectionState>,
        pending: Arc<PendingRequests>,
        quotes: Arc<QuoteCache>,
    ) -> Self {
        Self {
            outbound_tx,
            state_rx,
            pending,
            quotes,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Serialize and queue one frame. Fails fast when no session is up.
    pub async fn send_frame(&self, request: &GatewayRequest) -> GatewayResult<()> {
        if !self.is_connected() {
            return Err(GatewayError::NotReady(format!(
                "connection is {}",
                self.state()
            )));
        }

        let json = serde_json::to_string(request)?;
        self.outbound_tx
            .send(json)
            .await
            .map_err(|_| GatewayError::SendFailed("outbound queue closed".to_string()))
    }

    pub async fn place_order(&self, order: &Order) -> GatewayResult<()> {
        debug!(order_id = order.id.inner(), symbol = %order.symbol, "Sending place_order");
        self.send_frame(&GatewayRequest::place_order(order)).await
    }

    pub async fn cancel_order(&self, order_id: OrderId) -> GatewayResult<()> {
        debug!(order_id = order_id.inner(), "Sending cancel_order");
        self.send_frame(&GatewayRequest::cancel_order(order_id))
            .await
    }

    /// Ask the gateway to replay the full position table.
    pub async fn request_resync(&self) -> GatewayResult<()> {
        self.send_frame(&GatewayRequest::resync()).await
    }

    pub async fn subscribe_quotes(&self, symbols: &[Symbol]) -> GatewayResult<()> {
        self.send_frame(&GatewayRequest::subscribe_quotes(symbols))
            .await
    }

    /// Request a fresh top-of-book quote and wait for the response.
    pub async fn market_data(&self, symbol: &Symbol) -> GatewayResult<Quote> {
        let (request_id, outcome_rx) = self.pending.create(RequestKind::MarketData);
        let frame = GatewayRequest::market_data(request_id, symbol);

        if let Err(e) = self.send_frame(&frame).await {
            self.pending.abort(request_id);
            return Err(e);
        }

        match self.pending.await_response(request_id, outcome_rx).await? {
            RequestOutcome::Quote(quote) => Ok(quote),
            RequestOutcome::Rejected { code, message } => {
                Err(GatewayError::RequestRejected { code, message })
            }
            RequestOutcome::Bars(_) => Err(GatewayError::RequestRejected {
                code: 0,
                message: "unexpected response payload".to_string(),
            }),
        }
    }

    /// Request daily-or-finer bars for the trailing `days` window.
    pub async fn historical_data(
        &self,
        symbol: &Symbol,
        days: u32,
        interval: BarInterval,
    ) -> GatewayResult<Vec<Bar>> {
        let (request_id, outcome_rx) = self.pending.create(RequestKind::HistoricalData);
        let frame = GatewayRequest::historical_data(request_id, symbol, days, interval);

        if let Err(e) = self.send_frame(&frame).await {
            self.pending.abort(request_id);
            return Err(e);
        }

        match self.pending.await_response(request_id, outcome_rx).await? {
            RequestOutcome::Bars(bars) => Ok(bars),
            RequestOutcome::Rejected { code, message } => {
                Err(GatewayError::RequestRejected { code, message })
            }
            RequestOutcome::Quote(_) => Err(GatewayError::RequestRejected {
                code: 0,
                message: "unexpected response payload".to_string(),
            }),
        }
    }

    /// Last quote the dispatcher saw for `symbol`, if any.
    pub fn cached_quote(&self, symbol: &Symbol) -> Option<Quote> {
        self.quotes.get(symbol)
    }
}
