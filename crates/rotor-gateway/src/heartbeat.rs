//! Heartbeat management for the gateway connection.
//!
//! Tracks ping/pong timing and inbound message activity so the message
//! loop can detect a silent transport and force a reconnect.

use parking_lot::RwLock;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
struct HeartbeatState {
    /// Last ping sent.
    last_ping: Option<Instant>,
    /// Last pong received.
    last_pong: Option<Instant>,
    /// Last inbound frame of any kind.
    last_inbound: Instant,
    /// Whether a ping is outstanding.
    awaiting_pong: bool,
}

/// Heartbeat manager for connection health.
pub struct HeartbeatManager {
    /// How often to consider sending a ping.
    interval_ms: u64,
    /// How long to wait for a pong before declaring the link dead.
    timeout_ms: u64,
    state: RwLock<HeartbeatState>,
}

impl HeartbeatManager {
    #[must_use]
    pub fn new(interval_ms: u64, timeout_ms: u64) -> Self {
        Self {
            interval_ms,
            timeout_ms,
            state: RwLock::new(HeartbeatState {
                last_ping: None,
                last_pong: None,
                last_inbound: Instant::now(),
                awaiting_pong: false,
            }),
        }
    }

    /// Reset heartbeat state (called on connection).
    pub fn reset(&self) {
        let mut state = self.state.write();
        state.last_ping = None;
        state.last_pong = None;
        state.last_inbound = Instant::now();
        state.awaiting_pong = false;
    }

    /// Record that a ping was sent.
    pub fn record_ping(&self) {
        let mut state = self.state.write();
        state.last_ping = Some(Instant::now());
        state.awaiting_pong = true;
    }

    /// Record that a pong was received.
    pub fn record_pong(&self) {
        let mut state = self.state.write();
        state.last_pong = Some(Instant::now());
        state.awaiting_pong = false;

        if let Some(ping_time) = state.last_ping {
            let rtt_ms = ping_time.elapsed().as_millis() as u64;
            debug!(rtt_ms, "Received pong");
        }
    }

    /// Record that any inbound frame arrived.
    pub fn record_message(&self) {
        self.state.write().last_inbound = Instant::now();
    }

    /// Whether the outstanding ping has gone unanswered past the timeout.
    pub fn is_timed_out(&self) -> bool {
        let state = self.state.read();
        if !state.awaiting_pong {
            return false;
        }
        match state.last_ping {
            Some(ping_time) => ping_time.elapsed() > Duration::from_millis(self.timeout_ms),
            None => false,
        }
    }

    /// Milliseconds since the last inbound frame.
    pub fn idle_ms(&self) -> u128 {
        self.state.read().last_inbound.elapsed().as_millis()
    }

    /// Whether a ping should be sent now.
    ///
    /// Pings are suppressed while one is outstanding and while regular
    /// traffic proves the link is alive.
    pub fn should_send_heartbeat(&self) -> bool {
        if self.state.read().awaiting_pong {
            return false;
        }
        self.idle_ms() >= u128::from(self.interval_ms)
    }

    /// Wait until the next heartbeat check.
    pub async fn wait_for_check(&self) {
        tokio::time::sleep(Duration::from_millis(self.interval_ms / 2)).await;
    }
}
