//! Event dispatcher.
//!
//! Single consumer of the parsed-frame channel and the only fan-out
//! point in the crate. Each raw frame becomes at most one typed
//! `GatewayEvent`; correlated request/response frames are routed to
//! their pending waiter instead of the event stream. Processing is
//! strictly sequential, so subscribers observe events for the same
//! order id in gateway-emission order.
//!
//! Delivery is per event class: order, execution, account, resync and
//! connection events block on a full subscriber (they must not be
//! lost), while market data and status events are dropped with a
//! counter when a subscriber lags.

use crate::client::QuoteCache;
use crate::protocol::RawMessage;
use crate::requests::{PendingRequests, RequestOutcome};
use rotor_core::{EventKind, GatewayEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often stale pending requests are swept.
const SWEEP_INTERVAL_SECS: u64 = 5;

// ============================================================================
// Stats
// ============================================================================

/// Dispatch counters, shared with whoever wants to log them.
#[derive(Debug, Default)]
pub struct DispatchStats {
    frames: AtomicU64,
    events: AtomicU64,
    dropped_events: AtomicU64,
    requests_completed: AtomicU64,
    requests_unmatched: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSnapshot {
    pub frames: u64,
    pub events: u64,
    pub dropped_events: u64,
    pub requests_completed: u64,
    pub requests_unmatched: u64,
}

impl DispatchStats {
    fn record_frame(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    fn record_event(&self) {
        self.events.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dropped(&self) {
        self.dropped_events.fetch_add(1, Ordering::Relaxed);
    }

    fn record_request_completed(&self) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_request_unmatched(&self) {
        self.requests_unmatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            requests_unmatched: self.requests_unmatched.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

struct Subscriber {
    label: String,
    kinds: Vec<EventKind>,
    tx: mpsc::Sender<GatewayEvent>,
}

/// Translates raw frames into typed events and fans them out.
pub struct Dispatcher {
    message_rx: mpsc::Receiver<RawMessage>,
    pending: Arc<PendingRequests>,
    quotes: Arc<QuoteCache>,
    subscribers: Vec<Subscriber>,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        message_rx: mpsc::Receiver<RawMessage>,
        pending: Arc<PendingRequests>,
        quotes: Arc<QuoteCache>,
    ) -> Self {
        Self {
            message_rx,
            pending,
            quotes,
            subscribers: Vec::new(),
            stats: Arc::new(DispatchStats::default()),
        }
    }

    /// Register a subscriber for the given event classes.
    ///
    /// Must be called before `run`; the returned receiver yields only
    /// events whose `kind()` is in `kinds`.
    pub fn subscribe(
        &mut self,
        label: impl Into<String>,
        kinds: Vec<EventKind>,
        capacity: usize,
    ) -> mpsc::Receiver<GatewayEvent> {
        let (tx, rx) = mpsc::channel(capacity);
        let label = label.into();
        debug!(%label, ?kinds, capacity, "Subscriber registered");
        self.subscribers.push(Subscriber { label, kinds, tx });
        rx
    }

    pub fn stats(&self) -> Arc<DispatchStats> {
        Arc::clone(&self.stats)
    }

    /// Consume frames until shutdown or the frame channel closes.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(subscribers = self.subscribers.len(), "Dispatcher started");
        let mut sweep = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Dispatcher shutting down");
                    break;
                }

                msg = self.message_rx.recv() => {
                    match msg {
                        Some(msg) => self.process(msg).await,
                        None => {
                            info!("Frame channel closed, dispatcher exiting");
                            break;
                        }
                    }
                }

                _ = sweep.tick() => {
                    let expired = self.pending.expire_stale();
                    if expired > 0 {
                        warn!(expired, "Swept stale pending requests");
                    }
                }
            }
        }
    }

    async fn process(&self, msg: RawMessage) {
        self.stats.record_frame();

        // Correlated frames go to their waiter, not the event stream.
        if let Some(request_id) = msg.request_id() {
            if let Some(outcome) = msg.clone().into_request_outcome() {
                if let RequestOutcome::Quote(quote) = &outcome {
                    self.quotes.insert(quote.clone());
                }
                if self.pending.complete(request_id, outcome) {
                    self.stats.record_request_completed();
                } else {
                    debug!(request_id, "Response for expired request");
                    self.stats.record_request_unmatched();
                }
                return;
            }
        }

        let Some(event) = msg.into_event() else {
            return;
        };

        if let GatewayEvent::Quote(quote) = &event {
            self.quotes.insert(quote.clone());
        }

        self.fan_out(event).await;
    }

    async fn fan_out(&self, event: GatewayEvent) {
        let kind = event.kind();
        self.stats.record_event();

        for subscriber in &self.subscribers {
            if !subscriber.kinds.contains(&kind) {
                continue;
            }

            if is_lossless(kind) {
                if subscriber.tx.send(event.clone()).await.is_err() {
                    warn!(label = %subscriber.label, "Subscriber dropped its receiver");
                }
            } else {
                match subscriber.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.stats.record_dropped();
                        debug!(label = %subscriber.label, ?kind, "Subscriber full, event dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        warn!(label = %subscriber.label, "Subscriber dropped its receiver");
                    }
                }
            }
        }
    }
}

/// Event classes whose delivery must never drop an event.
fn is_lossless(kind: EventKind) -> bool {
    matches!(
        kind,
        EventKind::Connection
            | EventKind::Orders
            | EventKind::Executions
            | EventKind::Account
            | EventKind::Resync
    )
}
