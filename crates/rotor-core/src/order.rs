//! Order types and the order lifecycle state machine.
//!
//! Order ids are plain integers handed out monotonically from a seed the
//! gateway delivers in its handshake ack, so they are unique for the
//! lifetime of a connection session.

use crate::decimal::Qty;
use crate::symbol::Symbol;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Session-scoped order identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub u64);

impl OrderId {
    #[inline]
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    #[inline]
    pub fn inner(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Order side: buy or sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Returns the opposite side.
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Returns 1 for buy, -1 for sell (for position calculations).
    pub fn sign(&self) -> i64 {
        match self {
            Self::Buy => 1,
            Self::Sell => -1,
        }
    }

    /// Side that moves a position toward `delta` (positive = buy).
    pub fn from_delta(delta: Qty) -> Option<Self> {
        match delta.inner() {
            d if d > 0 => Some(Self::Buy),
            d if d < 0 => Some(Self::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Order kind. The execution core submits market orders only; the enum
/// leaves a seam for limit/bracket extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    #[default]
    Market,
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Market => write!(f, "market"),
        }
    }
}

/// Order lifecycle state.
///
/// Legal transitions:
/// `PendingSubmit -> Submitted -> {PartiallyFilled <-> Submitted} ->
/// Filled | Cancelled | Rejected`. Rejection straight from
/// `PendingSubmit` is also legal (the gateway can bounce an order before
/// acking it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    /// Sent to the gateway, no ack yet.
    PendingSubmit,
    /// Acked by the gateway, working.
    Submitted,
    /// At least one execution received, not yet complete.
    PartiallyFilled,
    /// Fully executed.
    Filled,
    /// Cancelled before completion.
    Cancelled,
    /// Refused by the gateway.
    Rejected,
}

impl OrderState {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected)
    }

    /// Active states can still receive executions.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::PendingSubmit | Self::Submitted | Self::PartiallyFilled
        )
    }

    /// Whether a transition to `next` is legal for this state machine.
    pub fn can_transition(&self, next: OrderState) -> bool {
        use OrderState::*;
        match (self, next) {
            (PendingSubmit, Submitted) => true,
            (PendingSubmit, Rejected) => true,
            (PendingSubmit, Cancelled) => true,
            (Submitted, PartiallyFilled) => true,
            (Submitted, Filled) => true,
            (Submitted, Cancelled) => true,
            (Submitted, Rejected) => true,
            (PartiallyFilled, Submitted) => true,
            (PartiallyFilled, PartiallyFilled) => true,
            (PartiallyFilled, Filled) => true,
            (PartiallyFilled, Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PendingSubmit => "pending_submit",
            Self::Submitted => "submitted",
            Self::PartiallyFilled => "partially_filled",
            Self::Filled => "filled",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
        };
        write!(f, "{s}")
    }
}

/// An order as submitted to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub symbol: Symbol,
    pub side: OrderSide,
    /// Always positive; direction is carried by `side`.
    pub quantity: Qty,
    pub kind: OrderKind,
    /// Unix milliseconds at submission.
    pub submitted_at_ms: i64,
}

impl Order {
    pub fn market(id: OrderId, symbol: Symbol, side: OrderSide, quantity: Qty) -> Self {
        Self {
            id,
            symbol,
            side,
            quantity,
            kind: OrderKind::Market,
            submitted_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Signed quantity: positive for buys, negative for sells.
    pub fn signed_quantity(&self) -> Qty {
        Qty::new(self.quantity.inner() * self.side.sign())
    }
}
