//! Execution records and order tracking.
//!
//! An `Execution` is the immutable fact that a slice of an order matched
//! at a price. Position math consumes executions exclusively; order
//! state is advisory and can race, so it never feeds positions.

use crate::decimal::{Price, Qty};
use crate::order::{Order, OrderId, OrderSide, OrderState};
use crate::symbol::Symbol;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Immutable fill record reported by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    pub order_id: OrderId,
    /// Gateway-assigned execution id, unique across the session.
    pub exec_id: String,
    pub symbol: Symbol,
    pub side: OrderSide,
    /// Filled quantity for this slice; always positive.
    pub quantity: Qty,
    pub price: Price,
    pub timestamp_ms: i64,
}

impl Execution {
    /// Signed position delta contributed by this fill.
    pub fn signed_quantity(&self) -> Qty {
        Qty::new(self.quantity.inner() * self.side.sign())
    }
}

/// An order plus everything observed about it since submission.
///
/// Owned by the executor; all mutation goes through the methods here so
/// the state machine stays legal.
#[derive(Debug, Clone)]
pub struct TrackedOrder {
    pub order: Order,
    pub state: OrderState,
    /// Cumulative filled quantity (positive).
    pub filled: Qty,
    /// Volume-weighted average fill price across all executions so far.
    pub avg_fill_price: Price,
    pub last_update_ms: i64,
}

impl TrackedOrder {
    pub fn new(order: Order) -> Self {
        let submitted_at_ms = order.submitted_at_ms;
        Self {
            order,
            state: OrderState::PendingSubmit,
            filled: Qty::ZERO,
            avg_fill_price: Price::ZERO,
            last_update_ms: submitted_at_ms,
        }
    }

    /// Remaining unfilled quantity.
    pub fn remaining(&self) -> Qty {
        self.order.quantity - self.filled
    }

    pub fn is_fully_filled(&self) -> bool {
        self.filled >= self.order.quantity
    }

    /// Apply a state transition if it is legal.
    ///
    /// Returns false (and leaves the order untouched) on an illegal
    /// transition; duplicate gateway status messages land here.
    pub fn transition(&mut self, next: OrderState, now_ms: i64) -> bool {
        if !self.state.can_transition(next) {
            return false;
        }
        self.state = next;
        self.last_update_ms = now_ms;
        true
    }

    /// Record an execution slice: accumulate quantity, fold the price
    /// into the volume-weighted average, and advance the state machine.
    pub fn record_fill(&mut self, quantity: Qty, price: Price, now_ms: i64) {
        let prev_filled = Decimal::from(self.filled.inner());
        let add = Decimal::from(quantity.inner());
        let total = prev_filled + add;
        if total > Decimal::ZERO {
            self.avg_fill_price = Price::new(
                (self.avg_fill_price.inner() * prev_filled + price.inner() * add) / total,
            );
        }
        self.filled = self.filled + quantity;

        let next = if self.is_fully_filled() {
            OrderState::Filled
        } else {
            OrderState::PartiallyFilled
        };
        self.transition(next, now_ms);
    }
}

/// Terminal result of a position-change request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderOutcome {
    /// Target already held; nothing was submitted.
    NoChange { symbol: Symbol, quantity: Qty },
    /// Order reached `Filled`; the position matches the intent.
    Filled {
        order_id: OrderId,
        symbol: Symbol,
        side: OrderSide,
        quantity: Qty,
        avg_fill_price: Price,
    },
    /// Order reached `Cancelled` (gateway- or timeout-initiated) with a
    /// known fill total; the position reflects exactly those fills.
    Cancelled {
        order_id: OrderId,
        symbol: Symbol,
        requested: Qty,
        filled: Qty,
    },
}

impl OrderOutcome {
    pub fn is_filled(&self) -> bool {
        matches!(self, Self::Filled { .. })
    }

    pub fn is_no_change(&self) -> bool {
        matches!(self, Self::NoChange { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn buy_order(qty: i64) -> Order {
        Order::market(
            OrderId::new(7),
            Symbol::new("TQQQ"),
            OrderSide::Buy,
            Qty::new(qty),
        )
    }

    #[test]
    fn test_partial_fills_accumulate() {
        let mut tracked = TrackedOrder::new(buy_order(111));
        assert!(tracked.transition(OrderState::Submitted, 1));

        tracked.record_fill(Qty::new(40), Price::new(dec!(450)), 2);
        assert_eq!(tracked.state, OrderState::PartiallyFilled);
        assert_eq!(tracked.remaining(), Qty::new(71));

        tracked.record_fill(Qty::new(60), Price::new(dec!(450)), 3);
        assert_eq!(tracked.state, OrderState::PartiallyFilled);

        tracked.record_fill(Qty::new(11), Price::new(dec!(450)), 4);
        assert_eq!(tracked.state, OrderState::Filled);
        assert_eq!(tracked.filled, Qty::new(111));
        assert_eq!(tracked.remaining(), Qty::ZERO);
        assert_eq!(tracked.avg_fill_price, Price::new(dec!(450)));
    }

    #[test]
    fn test_vwap_across_mixed_prices() {
        let mut tracked = TrackedOrder::new(buy_order(100));
        tracked.transition(OrderState::Submitted, 1);

        tracked.record_fill(Qty::new(50), Price::new(dec!(100)), 2);
        tracked.record_fill(Qty::new(50), Price::new(dec!(110)), 3);

        assert_eq!(tracked.avg_fill_price, Price::new(dec!(105)));
        assert_eq!(tracked.state, OrderState::Filled);
    }

    #[test]
    fn test_illegal_transition_is_ignored() {
        let mut tracked = TrackedOrder::new(buy_order(10));
        tracked.transition(OrderState::Submitted, 1);
        tracked.record_fill(Qty::new(10), Price::new(dec!(50)), 2);
        assert_eq!(tracked.state, OrderState::Filled);

        // A late duplicate status message must not resurrect the order.
        assert!(!tracked.transition(OrderState::Submitted, 3));
        assert_eq!(tracked.state, OrderState::Filled);
    }

    #[test]
    fn test_execution_signed_quantity() {
        let exec = Execution {
            order_id: OrderId::new(1),
            exec_id: "x1".to_string(),
            symbol: Symbol::new("QQQ"),
            side: OrderSide::Sell,
            quantity: Qty::new(25),
            price: Price::new(dec!(400)),
            timestamp_ms: 0,
        };
        assert_eq!(exec.signed_quantity(), Qty::new(-25));
    }
}
