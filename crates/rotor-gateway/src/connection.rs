//! Gateway connection manager.
//!
//! Owns the WebSocket lifecycle: dial, hello/hello_ack handshake,
//! heartbeat watchdog, and automatic reconnection with exponential
//! backoff. Raw inbound frames are parsed once here and handed to the
//! dispatcher over a channel; outbound frames arrive on a channel from
//! the client handle, so no other component ever touches the socket.

use crate::error::{GatewayError, GatewayResult};
use crate::heartbeat::HeartbeatManager;
use crate::protocol::{GatewayRequest, RawMessage};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rotor_core::{ClientId, ConnectionEvent};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex as TokioMutex, Notify};
use tokio_tungstenite::{
    connect_async_tls_with_config, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport; nothing in progress.
    Disconnected,
    /// Dialing or handshaking (including between reconnect attempts).
    Connecting,
    /// Handshake complete; frames flowing.
    Connected,
    /// Retry budget exhausted; waiting for operator intervention.
    Degraded,
    /// Graceful shutdown requested; draining.
    Closing,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
            Self::Closing => "closing",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: String,
    /// First order id this session may use; all later ids must be higher.
    pub next_order_id: u64,
}

/// Connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// WebSocket URL of the gateway.
    #[serde(default = "default_url")]
    pub url: String,
    /// Dial timeout.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// How long to wait for `hello_ack` once the socket is open.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Maximum consecutive reconnection attempts (0 = infinite).
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Base delay for exponential backoff.
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    /// Maximum delay for exponential backoff.
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    /// Heartbeat interval.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Heartbeat timeout (pong must arrive within this).
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// Timeout for correlated market/historical data requests.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_url() -> String {
    "ws://127.0.0.1:7497/ws".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_handshake_timeout_ms() -> u64 {
    5_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_reconnect_base_delay_ms() -> u64 {
    1_000
}

fn default_reconnect_max_delay_ms() -> u64 {
    60_000
}

fn default_heartbeat_interval_ms() -> u64 {
    15_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            connect_timeout_ms: default_connect_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Owns the gateway transport.
///
/// `run()` is the long-lived loop: it dials, handshakes, pumps frames,
/// and reconnects with backoff until shutdown or budget exhaustion.
/// `wait_connected()` lets callers block until the first session is up.
pub struct ConnectionManager {
    config: ConnectionConfig,
    client_id: ClientId,
    state_tx: watch::Sender<ConnectionState>,
    session: Arc<RwLock<Option<SessionInfo>>>,
    /// Parsed inbound frames, consumed by the dispatcher.
    message_tx: mpsc::Sender<RawMessage>,
    /// Local lifecycle notifications, consumed by the session supervisor.
    conn_tx: mpsc::Sender<ConnectionEvent>,
    outbound_tx: mpsc::Sender<String>,
    outbound_rx: Arc<TokioMutex<mpsc::Receiver<String>>>,
    heartbeat: Arc<HeartbeatManager>,
    /// Sessions established over the manager's lifetime. Used to reset
    /// the consecutive-failure count after a successful handshake.
    established_sessions: AtomicU64,
    /// Drops the current session without shutting the manager down.
    session_abort: Notify,
    shutdown_token: CancellationToken,
}

impl ConnectionManager {
    const OUTBOUND_QUEUE_DEPTH: usize = 256;

    #[must_use]
    pub fn new(
        config: ConnectionConfig,
        client_id: ClientId,
        message_tx: mpsc::Sender<RawMessage>,
        conn_tx: mpsc::Sender<ConnectionEvent>,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(Self::OUTBOUND_QUEUE_DEPTH);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            heartbeat: Arc::new(HeartbeatManager::new(
                config.heartbeat_interval_ms,
                config.heartbeat_timeout_ms,
            )),
            config,
            client_id,
            state_tx,
            session: Arc::new(RwLock::new(None)),
            message_tx,
            conn_tx,
            outbound_tx,
            outbound_rx: Arc::new(TokioMutex::new(outbound_rx)),
            established_sessions: AtomicU64::new(0),
            session_abort: Notify::new(),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Subscribe to state changes.
    pub fn state_rx(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Session info from the most recent successful handshake.
    pub fn session(&self) -> Option<SessionInfo> {
        self.session.read().clone()
    }

    /// Sender for pre-serialized outbound frames.
    ///
    /// Cloneable and reconnect-safe; frames queue while the socket is
    /// being re-established.
    pub fn outbound_sender(&self) -> mpsc::Sender<String> {
        self.outbound_tx.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Request a graceful disconnect. Idempotent.
    pub fn disconnect(&self) {
        let current = self.state();
        if matches!(
            current,
            ConnectionState::Closing | ConnectionState::Disconnected
        ) && self.shutdown_token.is_cancelled()
        {
            debug!(state = %current, "Disconnect requested again, ignoring");
            return;
        }
        info!("Disconnect requested");
        self.set_state(ConnectionState::Closing);
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Drop the current session and reconnect.
    ///
    /// Used when a protocol violation makes the session untrustworthy;
    /// the reconnect path resets tracking and forces a fresh resync.
    pub fn abort_session(&self) {
        warn!("Session abort requested");
        self.session_abort.notify_one();
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "Connection state changed");
        }
    }

    /// Block until the manager reports `Connected` (returning the session)
    /// or `Degraded` (the retry budget is spent).
    pub async fn wait_connected(&self, wait: Duration) -> GatewayResult<SessionInfo> {
        let mut rx = self.state_tx.subscribe();
        let waiter = async {
            loop {
                let state = *rx.borrow_and_update();
                match state {
                    ConnectionState::Connected => {
                        if let Some(session) = self.session() {
                            return Ok(session);
                        }
                    }
                    ConnectionState::Degraded => {
                        return Err(GatewayError::ExhaustedRetries {
                            attempts: self.config.max_reconnect_attempts,
                        });
                    }
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(GatewayError::NotReady(
                        "connection manager stopped".to_string(),
                    ));
                }
            }
        };

        tokio::time::timeout(wait, waiter)
            .await
            .map_err(|_| GatewayError::Timeout(format!("not connected within {:?}", wait)))?
    }

    /// Run the connection loop until shutdown or budget exhaustion.
    pub async fn run(&self) -> GatewayResult<()> {
        let mut attempt = 0u32;

        loop {
            if self.is_shutdown() {
                info!("Shutdown requested, exiting connect loop");
                self.set_state(ConnectionState::Disconnected);
                return Ok(());
            }

            self.set_state(ConnectionState::Connecting);

            let sessions_before = self.established_sessions.load(Ordering::SeqCst);
            let disconnect_reason = match self.try_connect().await {
                Ok(()) => {
                    info!("Gateway connection closed");
                    "connection closed".to_string()
                }
                Err(e) => {
                    error!(error = %e, "Gateway connection error");
                    e.to_string()
                }
            };

            let was_established =
                self.established_sessions.load(Ordering::SeqCst) > sessions_before;
            *self.session.write() = None;
            self.set_state(ConnectionState::Disconnected);

            if self.is_shutdown() {
                info!("Shutdown requested after disconnect, not reconnecting");
                return Ok(());
            }

            if was_established {
                // The failure streak ended with a working session.
                attempt = 0;
                if self
                    .conn_tx
                    .send(ConnectionEvent::Lost {
                        reason: disconnect_reason,
                    })
                    .await
                    .is_err()
                {
                    warn!("Connection event receiver dropped");
                }
            }

            attempt += 1;
            if self.config.max_reconnect_attempts > 0
                && attempt >= self.config.max_reconnect_attempts
            {
                error!(attempt, "Max reconnection attempts reached");
                self.set_state(ConnectionState::Degraded);
                let _ = self.conn_tx.send(ConnectionEvent::RetriesExhausted).await;
                return Err(GatewayError::ExhaustedRetries { attempts: attempt });
            }

            let delay = self.calculate_backoff_delay(attempt);
            warn!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");

            // Cancellation-aware backoff sleep
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.shutdown_token.cancelled() => {
                    info!("Shutdown requested during backoff, exiting");
                    self.set_state(ConnectionState::Disconnected);
                    return Ok(());
                }
            }
        }
    }

    async fn try_connect(&self) -> GatewayResult<()> {
        info!(url = %self.config.url, "Connecting to gateway");

        let dial = connect_async_tls_with_config(&self.config.url, None, true, None);
        let (ws_stream, _response) =
            tokio::time::timeout(Duration::from_millis(self.config.connect_timeout_ms), dial)
                .await
                .map_err(|_| {
                    GatewayError::Timeout(format!(
                        "no transport within {} ms",
                        self.config.connect_timeout_ms
                    ))
                })??;
        let (mut write, mut read) = ws_stream.split();

        let session = self.handshake(&mut write, &mut read).await?;
        *self.session.write() = Some(session.clone());
        self.established_sessions.fetch_add(1, Ordering::SeqCst);
        self.heartbeat.reset();
        self.set_state(ConnectionState::Connected);
        info!(
            session_id = %session.session_id,
            next_order_id = session.next_order_id,
            "Gateway session established"
        );

        if self
            .conn_tx
            .send(ConnectionEvent::Established {
                session_id: session.session_id,
                next_order_id: session.next_order_id,
            })
            .await
            .is_err()
        {
            warn!("Connection event receiver dropped");
        }

        self.message_loop(write, read).await
    }

    /// Perform the hello/hello_ack exchange on a fresh socket.
    async fn handshake(&self, write: &mut WsSink, read: &mut WsSource) -> GatewayResult<SessionInfo> {
        let hello = serde_json::to_string(&GatewayRequest::hello(&self.client_id))?;
        write.send(Message::Text(hello)).await?;
        debug!(client_id = %self.client_id, "Sent hello");

        let wait_for_ack = async {
            loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<RawMessage>(&text)
                    {
                        Ok(RawMessage::HelloAck {
                            session_id,
                            next_order_id,
                        }) => {
                            return Ok(SessionInfo {
                                session_id,
                                next_order_id,
                            });
                        }
                        Ok(_) => {
                            debug!("Ignoring frame before hello_ack");
                        }
                        Err(e) => {
                            warn!(error = %e, "Unparseable frame during handshake");
                        }
                    },
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) => {
                        return Err(GatewayError::HandshakeFailed(
                            "gateway closed during handshake".to_string(),
                        ));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        return Err(GatewayError::HandshakeFailed(
                            "stream ended during handshake".to_string(),
                        ));
                    }
                }
            }
        };

        tokio::time::timeout(
            Duration::from_millis(self.config.handshake_timeout_ms),
            wait_for_ack,
        )
        .await
        .map_err(|_| {
            GatewayError::HandshakeFailed(format!(
                "no hello_ack within {} ms",
                self.config.handshake_timeout_ms
            ))
        })?
    }

    async fn message_loop(&self, mut write: WsSink, mut read: WsSource) -> GatewayResult<()> {
        loop {
            // Lock outbound_rx for the select! block
            let outbound_recv = async { self.outbound_rx.lock().await.recv().await };

            tokio::select! {
                // Shutdown signal
                () = self.shutdown_token.cancelled() => {
                    info!("Shutdown signal received in message loop");
                    if let Err(e) = write.send(Message::Close(None)).await {
                        warn!(?e, "Failed to send Close frame during shutdown");
                    }
                    return Ok(());
                }

                // Session abort (protocol violation)
                () = self.session_abort.notified() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Err(GatewayError::ConnectionClosed {
                        code: 1000,
                        reason: "session aborted locally".to_string(),
                    });
                }

                // Inbound frame
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_frame(&text).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            // Transport-level pong
                            self.heartbeat.record_pong();
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (f.code.into(), f.reason.to_string()))
                                .unwrap_or((1006, "gateway closed".to_string()));
                            warn!(code, %reason, "Gateway closed the connection");
                            return Err(GatewayError::ConnectionClosed { code, reason });
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!(?e, "WebSocket read error");
                            return Err(e.into());
                        }
                        None => {
                            warn!("WebSocket stream ended");
                            return Err(GatewayError::ConnectionClosed {
                                code: 1006,
                                reason: "stream ended".to_string(),
                            });
                        }
                    }
                }

                // Outbound frame
                outbound = outbound_recv => {
                    if let Some(frame) = outbound {
                        write.send(Message::Text(frame)).await?;
                    }
                }

                // Heartbeat check
                _ = self.heartbeat.wait_for_check() => {
                    if self.heartbeat.is_timed_out() {
                        error!("Heartbeat timeout, forcing reconnect");
                        return Err(GatewayError::HeartbeatTimeout);
                    }

                    if self.heartbeat.should_send_heartbeat() {
                        let ping = serde_json::to_string(&GatewayRequest::ping())?;
                        write.send(Message::Text(ping)).await?;
                        self.heartbeat.record_ping();
                        debug!("Sent heartbeat ping");
                    }
                }
            }
        }
    }

    /// Parse one inbound text frame and forward it to the dispatcher.
    ///
    /// Unparseable frames are logged and dropped; one bad frame must
    /// never take down the session.
    async fn handle_frame(&self, text: &str) {
        self.heartbeat.record_message();

        let msg: RawMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "Dropping unparseable frame");
                return;
            }
        };

        // Application-level pong is a transport concern, not an event.
        if matches!(msg, RawMessage::Pong) {
            self.heartbeat.record_pong();
            return;
        }

        if self.message_tx.send(msg).await.is_err() {
            warn!("Message receiver dropped");
        }
    }

    fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.reconnect_base_delay_ms;
        let max = self.config.reconnect_max_delay_ms;

        // base * 2^(attempt-1), capped
        let exponent = attempt.saturating_sub(1).min(10);
        let delay = base.saturating_mul(1u64 << exponent);
        let delay = delay.min(max);

        Duration::from_millis(delay + rand_jitter())
    }
}

/// Generate random jitter (0-1000ms).
fn rand_jitter() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    u64::from(nanos % 1000)
}
