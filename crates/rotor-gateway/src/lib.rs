//! WebSocket gateway client.
//!
//! Everything the trading stack knows about the broker gateway lives
//! here: the JSON wire protocol, the connection manager with handshake,
//! heartbeat and reconnection, the correlated request table, and the
//! dispatcher that turns raw frames into typed events on one ordered
//! stream.

pub mod client;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod heartbeat;
pub mod protocol;
pub mod requests;

pub use client::{GatewayClient, QuoteCache};
pub use connection::{ConnectionConfig, ConnectionManager, ConnectionState, SessionInfo};
pub use dispatch::{DispatchSnapshot, DispatchStats, Dispatcher};
pub use error::{GatewayError, GatewayResult};
pub use heartbeat::HeartbeatManager;
pub use protocol::{GatewayRequest, RawMessage};
pub use requests::{PendingRequests, RequestKind, RequestOutcome};
