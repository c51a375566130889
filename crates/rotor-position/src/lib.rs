//! Position reconciliation for the rotor execution layer.
//!
//! One authoritative position table per session, fed exclusively by
//! execution and resync events off the gateway stream. The reconciler
//! detects protocol violations (fills for unknown orders), tracks drift
//! between executor expectations and gateway truth, and halts trading
//! when drift survives two consecutive resyncs.

pub mod error;
pub mod reconciler;

pub use error::{ReconciliationError, ReconciliationResult};
pub use reconciler::{spawn_reconciler, ReconcilerHandle, ReconcilerMsg, ReconcilerTask};
