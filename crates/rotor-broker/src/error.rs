//! Broker-level errors.
//!
//! The facade flattens the layer errors it propagates: a validation
//! failure surfaces as `Validation` whether it came from the risk crate
//! directly or wrapped inside an execution error, so callers match on
//! one taxonomy.

use rotor_core::Symbol;
use rotor_executor::ExecutionError;
use rotor_gateway::GatewayError;
use rotor_position::ReconciliationError;
use rotor_risk::ValidationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Operation requires a live session and there is none.
    #[error("broker is not connected")]
    NotConnected,

    /// No price is known for the symbol.
    #[error("no market data for {symbol}")]
    NoMarketData { symbol: Symbol },

    #[error(transparent)]
    Connection(#[from] GatewayError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Execution(ExecutionError),

    #[error(transparent)]
    Reconciliation(#[from] ReconciliationError),
}

impl From<ExecutionError> for BrokerError {
    fn from(e: ExecutionError) -> Self {
        match e {
            ExecutionError::Validation(inner) => Self::Validation(inner),
            ExecutionError::Gateway(inner) => Self::Connection(inner),
            other => Self::Execution(other),
        }
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;
