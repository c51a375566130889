//! Execution error types.

use rotor_core::{OrderId, Qty, Symbol};
use rotor_gateway::GatewayError;
use rotor_risk::ValidationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Gateway refused the order.
    #[error("order {order_id} rejected: {reason}")]
    Rejected { order_id: OrderId, reason: String },

    /// Another position change for this symbol is already in flight.
    #[error("position change already in progress for {symbol}")]
    InProgress { symbol: Symbol },

    /// Timed out with no terminal state and an unacknowledged cancel.
    /// The order's fate is unknown; the symbol stays locked until a
    /// resync completes.
    #[error("order {order_id} on {symbol} is in an indeterminate state")]
    Indeterminate { order_id: OrderId, symbol: Symbol },

    /// The order reached `Filled` but the reconciled position does not
    /// match the intended target. Never auto-retried.
    #[error("verification failed on {symbol}: expected {expected}, reconciled {actual}")]
    VerificationFailed {
        symbol: Symbol,
        expected: Qty,
        actual: Qty,
    },

    /// A previous indeterminate outcome locked this symbol; a resync
    /// must complete before new orders are accepted.
    #[error("resync required before trading {symbol} again")]
    ResyncRequired { symbol: Symbol },

    /// Persistent drift halted trading; an operator must acknowledge.
    #[error("trading halted: {reason}")]
    Halted { reason: String },

    /// Neither the quote cache nor a fresh quote produced a usable
    /// price, so the order could not be risk-checked.
    #[error("no reference price available for {symbol}")]
    NoReferencePrice { symbol: Symbol },

    /// Pre-trade risk check failed; the gateway was not contacted.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Transport-level failure before or during submission.
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

pub type ExecutionResult<T> = Result<T, ExecutionError>;
