//! Strategy signal types.
//!
//! Signal engines live outside this system; they append decisions to a
//! feed this layer consumes. A signal maps to a target holding through
//! configuration, never through strategy logic here.

use crate::symbol::Symbol;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A strategy decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Hold => write!(f, "HOLD"),
        }
    }
}

/// One record from the external signal feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategySignal {
    pub timestamp_ms: i64,
    pub signal: Signal,
    /// Free-form explanation from the engine; recorded with the trade.
    #[serde(default)]
    pub rationale: String,
}

/// What the account should hold after acting on a signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "symbol")]
pub enum TargetHolding {
    /// Fully allocated to one instrument.
    Instrument(Symbol),
    /// Everything in cash.
    Cash,
}

impl TargetHolding {
    pub fn symbol(&self) -> Option<&Symbol> {
        match self {
            Self::Instrument(sym) => Some(sym),
            Self::Cash => None,
        }
    }
}

impl fmt::Display for TargetHolding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instrument(sym) => write!(f, "{sym}"),
            Self::Cash => write!(f, "CASH"),
        }
    }
}
