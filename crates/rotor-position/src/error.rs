//! Reconciliation error types.

use rotor_core::{Qty, Symbol};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconciliationError {
    /// Expected and gateway-reported positions disagreed across two
    /// consecutive resyncs. Trading halts until an operator acknowledges.
    #[error("persistent drift on {symbol}: expected {expected}, gateway reports {reported}")]
    PersistentDrift {
        symbol: Symbol,
        expected: Qty,
        reported: Qty,
    },

    /// No resync completed within the wait window.
    #[error("resync did not complete within {waited_ms} ms")]
    ResyncTimeout { waited_ms: u64 },
}

pub type ReconciliationResult<T> = Result<T, ReconciliationError>;
