//! Core domain types for the rotor execution layer.
//!
//! This crate provides the fundamental types used throughout the system:
//! - `Symbol`, `ClientId`: instrument and client identity
//! - `Price`, `Qty`: precision-safe numeric types
//! - `Order`, `OrderState`, `TrackedOrder`: the order lifecycle
//! - `Execution`, `Position`, `AccountSnapshot`: the truth tables
//! - `GatewayEvent`: typed events off the gateway stream

pub mod account;
pub mod decimal;
pub mod error;
pub mod events;
pub mod execution;
pub mod market;
pub mod order;
pub mod signal;
pub mod symbol;
pub mod trade;

pub use account::{AccountSnapshot, Position};
pub use decimal::{Price, Qty};
pub use error::ProtocolError;
pub use events::{ConnectionEvent, EventKind, GatewayEvent, OrderStatusKind};
pub use market::{Bar, BarInterval, Quote};
pub use order::{Order, OrderId, OrderKind, OrderSide, OrderState};
pub use signal::{Signal, StrategySignal, TargetHolding};
pub use symbol::{ClientId, Symbol};
pub use trade::{EquityPoint, TradeRecord};

// Execution types
pub use execution::{Execution, OrderOutcome, TrackedOrder};
