//! Typed gateway events.
//!
//! The gateway delivers everything asynchronously on one stream: order
//! acks, executions, snapshots, quotes, status codes. The dispatcher
//! translates each raw frame into exactly one `GatewayEvent` and fans it
//! out to subscribers over bounded channels. Events for the same order id
//! are delivered in gateway-emission order.

use crate::account::{AccountSnapshot, Position};
use crate::execution::Execution;
use crate::market::{Bar, Quote};
use crate::order::OrderId;
use crate::symbol::Symbol;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Gateway-reported order status (acks and terminal signals).
///
/// Fills are not statuses; they arrive as `Execution` events and the
/// executor derives `PartiallyFilled`/`Filled` from the running sum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatusKind {
    /// Order accepted and working.
    Submitted,
    /// Order cancelled (by request or by the gateway).
    Cancelled,
    /// Order refused.
    Rejected,
}

impl fmt::Display for OrderStatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Submitted => "submitted",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
        };
        write!(f, "{s}")
    }
}

/// One typed event translated from the raw gateway stream.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// Handshake accepted; carries the order-id seed for this session.
    ConnectionAck {
        session_id: String,
        next_order_id: u64,
    },
    /// Order lifecycle signal.
    OrderStatus {
        order_id: OrderId,
        status: OrderStatusKind,
        reason: Option<String>,
    },
    /// A fill.
    Execution(Execution),
    /// Pushed or requested top-of-book quote.
    Quote(Quote),
    /// Response to a historical-data request.
    HistoricalBars {
        request_id: u64,
        symbol: Symbol,
        bars: Vec<Bar>,
    },
    /// Full account snapshot; replaces the previous one wholesale.
    AccountSummary(AccountSnapshot),
    /// Start of a position resync burst.
    ResyncBegin,
    /// One position within a resync burst.
    ResyncPosition(Position),
    /// End of a resync burst; the table is replaced at this point.
    ResyncEnd,
    /// Informational status code from the gateway.
    Status { code: u32, message: String },
    /// Gateway error, optionally tied to an order.
    Error {
        code: u32,
        message: String,
        order_id: Option<OrderId>,
    },
}

/// Event classes for dispatcher subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connection,
    Orders,
    Executions,
    MarketData,
    Account,
    Resync,
    Status,
}

impl GatewayEvent {
    /// The subscription class this event belongs to.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ConnectionAck { .. } => EventKind::Connection,
            Self::OrderStatus { .. } => EventKind::Orders,
            Self::Execution(_) => EventKind::Executions,
            Self::Quote(_) | Self::HistoricalBars { .. } => EventKind::MarketData,
            Self::AccountSummary(_) => EventKind::Account,
            Self::ResyncBegin | Self::ResyncPosition(_) | Self::ResyncEnd => EventKind::Resync,
            Self::Status { .. } | Self::Error { .. } => EventKind::Status,
        }
    }

    /// Order id this event is scoped to, if any.
    pub fn order_id(&self) -> Option<OrderId> {
        match self {
            Self::OrderStatus { order_id, .. } => Some(*order_id),
            Self::Execution(exec) => Some(exec.order_id),
            Self::Error { order_id, .. } => *order_id,
            _ => None,
        }
    }
}

/// Connection lifecycle notifications from the connection manager.
///
/// Separate from `GatewayEvent` because they originate locally, not from
/// gateway frames, and the session supervisor is their only consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Handshake completed; tracking must reset and a resync must run.
    Established {
        session_id: String,
        next_order_id: u64,
    },
    /// Transport dropped; a reconnect attempt follows.
    Lost { reason: String },
    /// Retry budget exhausted; the manager is now degraded.
    RetriesExhausted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decimal::{Price, Qty};
    use crate::order::OrderSide;

    #[test]
    fn test_event_kind_mapping() {
        let ack = GatewayEvent::ConnectionAck {
            session_id: "s1".to_string(),
            next_order_id: 100,
        };
        assert_eq!(ack.kind(), EventKind::Connection);

        let status = GatewayEvent::OrderStatus {
            order_id: OrderId::new(5),
            status: OrderStatusKind::Submitted,
            reason: None,
        };
        assert_eq!(status.kind(), EventKind::Orders);
        assert_eq!(status.order_id(), Some(OrderId::new(5)));

        assert_eq!(GatewayEvent::ResyncBegin.kind(), EventKind::Resync);
    }

    #[test]
    fn test_execution_event_order_id() {
        let exec = Execution {
            order_id: OrderId::new(42),
            exec_id: "e1".to_string(),
            symbol: Symbol::new("TQQQ"),
            side: OrderSide::Buy,
            quantity: Qty::new(10),
            price: Price::ZERO,
            timestamp_ms: 0,
        };
        let event = GatewayEvent::Execution(exec);
        assert_eq!(event.kind(), EventKind::Executions);
        assert_eq!(event.order_id(), Some(OrderId::new(42)));
    }
}
