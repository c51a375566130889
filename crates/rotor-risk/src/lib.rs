//! Pre-trade risk validation for the rotor execution layer.
//!
//! Ordered short-circuit checks (quantity, per-symbol position limit,
//! gross exposure limit, buying power) computed locally against the
//! reconciler's caches. A rejection never touches the gateway.

pub mod error;
pub mod validator;

pub use error::{ValidationError, ValidationResult};
pub use validator::{RiskConfig, RiskValidator};
