//! Correlation of request/response frames.
//!
//! `market_data` and `historical_data` round trips carry a locally
//! generated `request_id`; the dispatcher completes the matching waiter
//! when the correlated response (or error) arrives. Waiters time out on
//! their own; a periodic sweep clears entries whose waiter disappeared
//! without a response.

use crate::error::{GatewayError, GatewayResult};
use dashmap::DashMap;
use rotor_core::{Bar, Quote};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// What kind of round trip a pending entry belongs to. For logging only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    MarketData,
    HistoricalData,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MarketData => "market_data",
            Self::HistoricalData => "historical_data",
        }
    }
}

/// Payload of a completed request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    Quote(Quote),
    Bars(Vec<Bar>),
    Rejected { code: u32, message: String },
}

struct PendingRequest {
    tx: oneshot::Sender<RequestOutcome>,
    kind: RequestKind,
    created_at: Instant,
}

/// Tracks in-flight correlated requests.
pub struct PendingRequests {
    pending: DashMap<u64, PendingRequest>,
    next_request_id: AtomicU64,
    timeout: Duration,
}

impl PendingRequests {
    #[must_use]
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            pending: DashMap::new(),
            next_request_id: AtomicU64::new(1),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    /// Register a new request and return its id plus the response slot.
    pub fn create(&self, kind: RequestKind) -> (u64, oneshot::Receiver<RequestOutcome>) {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            request_id,
            PendingRequest {
                tx,
                kind,
                created_at: Instant::now(),
            },
        );
        debug!(request_id, kind = kind.as_str(), "Registered request");
        (request_id, rx)
    }

    /// Complete a request with its outcome.
    ///
    /// Returns `false` if the id is unknown (already timed out or never
    /// issued) or the waiter has gone away.
    pub fn complete(&self, request_id: u64, outcome: RequestOutcome) -> bool {
        let Some((_, entry)) = self.pending.remove(&request_id) else {
            return false;
        };

        let age_ms = entry.created_at.elapsed().as_millis() as u64;
        debug!(
            request_id,
            kind = entry.kind.as_str(),
            age_ms,
            "Completing request"
        );
        entry.tx.send(outcome).is_ok()
    }

    /// Drop a request without completing it (e.g. the send failed).
    pub fn abort(&self, request_id: u64) {
        self.pending.remove(&request_id);
    }

    /// Await the outcome for a previously created request.
    ///
    /// On timeout the entry is removed so a late response is discarded
    /// instead of waking a dead waiter.
    pub async fn await_response(
        &self,
        request_id: u64,
        rx: oneshot::Receiver<RequestOutcome>,
    ) -> GatewayResult<RequestOutcome> {
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => {
                self.pending.remove(&request_id);
                Err(GatewayError::NotReady(
                    "dispatcher stopped before responding".to_string(),
                ))
            }
            Err(_) => {
                self.pending.remove(&request_id);
                Err(GatewayError::RequestTimeout { request_id })
            }
        }
    }

    /// Remove entries old enough that their waiter must be gone.
    ///
    /// Called periodically by the dispatcher. Entries are considered
    /// stale at twice the request timeout; live waiters clean up after
    /// themselves well before that.
    pub fn expire_stale(&self) -> usize {
        let cutoff = self.timeout * 2;
        let stale: Vec<u64> = self
            .pending
            .iter()
            .filter(|entry| entry.created_at.elapsed() > cutoff)
            .map(|entry| *entry.key())
            .collect();

        for request_id in &stale {
            if let Some((_, entry)) = self.pending.remove(request_id) {
                warn!(
                    request_id,
                    kind = entry.kind.as_str(),
                    "Expired abandoned request"
                );
            }
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
