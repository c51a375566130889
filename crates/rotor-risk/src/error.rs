//! Validation error types.

use rotor_core::Symbol;
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid quantity: {qty}")]
    InvalidQuantity { qty: i64 },

    #[error("position limit exceeded on {symbol}: projected ${projected} > limit ${limit}")]
    ExceedsPositionLimit {
        symbol: Symbol,
        projected: Decimal,
        limit: Decimal,
    },

    #[error("exposure limit exceeded: projected gross ${projected} > limit ${limit}")]
    ExceedsExposureLimit { projected: Decimal, limit: Decimal },

    #[error("insufficient buying power: need ${required}, usable ${available}")]
    InsufficientBuyingPower {
        required: Decimal,
        available: Decimal,
    },
}

impl ValidationError {
    /// Stable name of the failed check, for logs and counters.
    pub fn check_name(&self) -> &'static str {
        match self {
            Self::InvalidQuantity { .. } => "quantity",
            Self::ExceedsPositionLimit { .. } => "position_limit",
            Self::ExceedsExposureLimit { .. } => "exposure_limit",
            Self::InsufficientBuyingPower { .. } => "buying_power",
        }
    }
}

pub type ValidationResult<T> = Result<T, ValidationError>;
