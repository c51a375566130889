//! Positions and account snapshots.

use crate::decimal::{Price, Qty};
use crate::symbol::Symbol;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A position in one instrument.
///
/// `quantity` is signed (negative = short) and is always the signed sum
/// of executions applied since the last full resync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub quantity: Qty,
    /// Volume-weighted average cost of the open quantity.
    pub avg_cost: Price,
    pub last_update_ms: i64,
}

impl Position {
    pub fn new(symbol: Symbol, quantity: Qty, avg_cost: Price, last_update_ms: i64) -> Self {
        Self {
            symbol,
            quantity,
            avg_cost,
            last_update_ms,
        }
    }

    /// An empty position for a symbol never traded this session.
    pub fn flat(symbol: Symbol) -> Self {
        Self {
            symbol,
            quantity: Qty::ZERO,
            avg_cost: Price::ZERO,
            last_update_ms: 0,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.quantity.is_zero()
    }

    pub fn is_long(&self) -> bool {
        self.quantity.inner() > 0
    }

    pub fn is_short(&self) -> bool {
        self.quantity.inner() < 0
    }

    /// Market value of the position at a reference price (unsigned).
    pub fn market_value(&self, price: Price) -> Decimal {
        self.quantity.notional(price)
    }

    /// Cost basis of the open quantity (unsigned).
    pub fn cost_basis(&self) -> Decimal {
        self.quantity.notional(self.avg_cost)
    }
}

/// Account-level snapshot as last reported by the gateway.
///
/// Monotonic by replacement: every new snapshot replaces the previous
/// one wholesale, a partial update never merges into an old snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    /// Settled cash.
    pub cash: Price,
    /// Purchasing capacity including margin.
    pub buying_power: Price,
    /// Net liquidation value (cash + marked positions).
    pub net_liquidation: Price,
    pub updated_at_ms: i64,
}

impl AccountSnapshot {
    pub fn new(cash: Price, buying_power: Price, net_liquidation: Price, updated_at_ms: i64) -> Self {
        Self {
            cash,
            buying_power,
            net_liquidation,
            updated_at_ms,
        }
    }

    /// Zeroed snapshot used before the gateway has reported anything.
    pub fn empty() -> Self {
        Self {
            cash: Price::ZERO,
            buying_power: Price::ZERO,
            net_liquidation: Price::ZERO,
            updated_at_ms: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.updated_at_ms == 0
    }
}
