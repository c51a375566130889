//! Gateway error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The transport did not come up within the configured window.
    #[error("Connection timed out: {0}")]
    Timeout(String),

    /// The socket opened but the hello/hello_ack exchange failed.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// The reconnect budget is spent; the connection is degraded until
    /// an operator intervenes.
    #[error("Reconnect attempts exhausted after {attempts} tries")]
    ExhaustedRetries { attempts: u32 },

    #[error("Connection closed: code={code}, reason={reason}")]
    ConnectionClosed { code: u16, reason: String },

    #[error("Heartbeat timeout")]
    HeartbeatTimeout,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Not connected: {0}")]
    NotReady(String),

    /// The gateway answered a correlated request with an error code.
    #[error("Request rejected: code={code}, {message}")]
    RequestRejected { code: u32, message: String },

    /// No response arrived for a correlated request in time.
    #[error("Request {request_id} timed out")]
    RequestTimeout { request_id: u64 },

    #[error("Tungstenite error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type GatewayResult<T> = Result<T, GatewayError>;
