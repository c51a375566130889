//! Broker facade for the trading stack.
//!
//! A single [`Broker`] trait fronts two interchangeable backends: the
//! gateway-backed [`LiveBroker`] and the in-memory [`SimBroker`] used
//! for dry runs and tests. Rotation logic, share sizing and the
//! performance tracker sit on top of the facade so callers never need
//! to know which backend they hold.

pub mod broker;
pub mod error;
pub mod live;
pub mod performance;
pub mod rotation;
pub mod sim;
pub mod sizing;

pub use broker::{build_broker, Broker, BrokerConfig, BrokerKind};
pub use error::{BrokerError, BrokerResult};
pub use live::LiveBroker;
pub use performance::{PerformanceReport, PerformanceTracker};
pub use rotation::{RotationConfig, RotationOutcome, Rotator};
pub use sim::SimBroker;

use chrono::Utc;

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
