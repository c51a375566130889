//! Order execution: single-flight position changes with verified fills.
//!
//! The executor turns "hold `target` shares of this symbol" into one
//! market order, shepherds it to a terminal state, and refuses to report
//! success until the reconciled position agrees with the intent.

pub mod error;
pub mod executor;
pub mod ids;

pub use error::{ExecutionError, ExecutionResult};
pub use executor::{run_order_events, ExecutorConfig, OrderExecutor, OrderProgress, OrderSlot};
pub use ids::OrderIdGenerator;
