//! Records written to the append-only history logs.

use crate::decimal::{Price, Qty};
use crate::order::OrderSide;
use crate::symbol::Symbol;
use serde::{Deserialize, Serialize};

/// One completed order, as appended to the trade-history log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp_ms: i64,
    pub symbol: Symbol,
    pub side: OrderSide,
    pub quantity: Qty,
    pub price: Price,
    /// Strategy rationale carried through from the signal.
    #[serde(default)]
    pub rationale: String,
}

/// One point on the equity curve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp_ms: i64,
    pub portfolio_value: Price,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_trade_record_round_trip() {
        let record = TradeRecord {
            timestamp_ms: 1700000000000,
            symbol: Symbol::new("TQQQ"),
            side: OrderSide::Buy,
            quantity: Qty::new(211),
            price: Price::new(dec!(450.00)),
            rationale: "rotation into TQQQ".to_string(),
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: TradeRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
