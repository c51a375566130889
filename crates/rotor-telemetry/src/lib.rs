//! Prometheus metrics and structured logging for rotor.
//!
//! Provides observability for the execution layer:
//! - Prometheus metrics for connection health, order lifecycle and risk
//! - Structured JSON logging with tracing

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
pub use metrics::Metrics;
