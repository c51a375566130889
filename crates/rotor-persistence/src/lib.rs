//! Append-only persistence for the rotor execution layer.
//!
//! Records completed trades and the session equity curve as JSON Lines
//! files for post-analysis. Files are opened in append mode so restarts
//! extend, never truncate, the history.

pub mod error;
pub mod logs;
pub mod writer;

pub use error::{PersistenceError, PersistenceResult};
pub use logs::{EquityCurveLog, TradeHistoryLog, EQUITY_CURVE_FILE, TRADE_HISTORY_FILE};
pub use writer::JsonLinesWriter;
