//! Protocol-violation errors.

use crate::order::OrderId;
use thiserror::Error;

/// A gateway/client desynchronization bug, not a recoverable business
/// condition. Always fatal to the current session: drop the connection
/// and force a fresh resync on reconnect.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// An execution referenced an order this session never submitted
    /// (or one already terminal). Executions for cancelled/rejected
    /// orders are impossible by gateway contract.
    #[error("execution references unknown order id {order_id}")]
    UnknownOrderReference { order_id: OrderId },
}
