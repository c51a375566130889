//! Wire protocol: JSON text frames exchanged with the gateway.
//!
//! Every frame is a single JSON object tagged by `type`. Outbound frames
//! are built from [`GatewayRequest`]; inbound frames parse into
//! [`RawMessage`] and are translated into typed [`GatewayEvent`]s by the
//! dispatcher. Prices travel as strings to avoid float drift.

use crate::requests::RequestOutcome;
use rotor_core::{
    AccountSnapshot, Bar, BarInterval, ClientId, Execution, GatewayEvent, Order, OrderId,
    OrderKind, OrderSide, OrderStatusKind, Position, Price, Qty, Quote, Symbol,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ============================================================================
// Outbound requests
// ============================================================================

/// Client-to-gateway request frame.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayRequest {
    /// Opens the session; the gateway answers with `hello_ack`.
    Hello { client_id: String },
    /// Application-level heartbeat.
    Ping,
    /// Submit a market order.
    PlaceOrder {
        order_id: u64,
        symbol: String,
        side: OrderSide,
        quantity: i64,
        kind: OrderKind,
    },
    /// Cancel a working order.
    CancelOrder { order_id: u64 },
    /// Request a wholesale position/account refresh.
    Resync,
    /// Subscribe to streaming quotes for the given symbols.
    SubscribeQuotes { symbols: Vec<String> },
    /// One-shot quote request, answered with a correlated `quote` frame.
    MarketData { request_id: u64, symbol: String },
    /// Historical bars request, answered with `historical_data`.
    HistoricalData {
        request_id: u64,
        symbol: String,
        days: u32,
        interval: BarInterval,
    },
}

impl GatewayRequest {
    pub fn hello(client_id: &ClientId) -> Self {
        Self::Hello {
            client_id: client_id.as_str().to_string(),
        }
    }

    pub fn ping() -> Self {
        Self::Ping
    }

    pub fn place_order(order: &Order) -> Self {
        Self::PlaceOrder {
            order_id: order.id.inner(),
            symbol: order.symbol.to_string(),
            side: order.side,
            quantity: order.quantity.inner(),
            kind: order.kind,
        }
    }

    pub fn cancel_order(order_id: OrderId) -> Self {
        Self::CancelOrder {
            order_id: order_id.inner(),
        }
    }

    pub fn resync() -> Self {
        Self::Resync
    }

    pub fn subscribe_quotes(symbols: &[Symbol]) -> Self {
        Self::SubscribeQuotes {
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn market_data(request_id: u64, symbol: &Symbol) -> Self {
        Self::MarketData {
            request_id,
            symbol: symbol.to_string(),
        }
    }

    pub fn historical_data(
        request_id: u64,
        symbol: &Symbol,
        days: u32,
        interval: BarInterval,
    ) -> Self {
        Self::HistoricalData {
            request_id,
            symbol: symbol.to_string(),
            days,
            interval,
        }
    }
}

// ============================================================================
// Inbound frames
// ============================================================================

/// One OHLCV bar as it appears on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct RawBar {
    pub timestamp_ms: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: u64,
}

impl RawBar {
    fn into_bar(self) -> Bar {
        Bar {
            timestamp_ms: self.timestamp_ms,
            open: Price::new(self.open),
            high: Price::new(self.high),
            low: Price::new(self.low),
            close: Price::new(self.close),
            volume: self.volume,
        }
    }
}

/// Gateway-to-client frame.
///
/// Unknown `type` tags parse as [`RawMessage::Unknown`] so a gateway
/// upgrade never kills the connection; unparseable frames are dropped
/// one at a time at the connection layer.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawMessage {
    /// Handshake accepted. Carries the order-id seed for the session.
    HelloAck {
        session_id: String,
        next_order_id: u64,
    },
    /// Application-level heartbeat reply.
    Pong,
    /// Order lifecycle signal (ack, cancel confirm, rejection).
    OrderStatus {
        order_id: u64,
        status: OrderStatusKind,
        #[serde(default)]
        reason: Option<String>,
    },
    /// A fill.
    Execution {
        order_id: u64,
        exec_id: String,
        symbol: String,
        side: OrderSide,
        quantity: i64,
        price: Decimal,
        timestamp_ms: i64,
    },
    /// Top-of-book quote. `request_id` is present when this answers a
    /// `market_data` request, absent for streamed quotes.
    Quote {
        #[serde(default)]
        request_id: Option<u64>,
        symbol: String,
        bid: Decimal,
        ask: Decimal,
        last: Decimal,
        timestamp_ms: i64,
    },
    /// Historical bars, strictly request-scoped.
    HistoricalData {
        request_id: u64,
        symbol: String,
        bars: Vec<RawBar>,
    },
    /// Full account snapshot.
    AccountSummary {
        cash: Decimal,
        buying_power: Decimal,
        net_liquidation: Decimal,
        timestamp_ms: i64,
    },
    /// Start of a resync burst.
    ResyncBegin,
    /// One position within a resync burst.
    ResyncPosition {
        symbol: String,
        quantity: i64,
        avg_cost: Decimal,
        timestamp_ms: i64,
    },
    /// End of a resync burst.
    ResyncEnd,
    /// Informational status code.
    Status { code: u32, message: String },
    /// Gateway error. May reference an order, a request, or neither.
    Error {
        code: u32,
        message: String,
        #[serde(default)]
        order_id: Option<u64>,
        #[serde(default)]
        request_id: Option<u64>,
    },
    /// Frame with a `type` this client does not know.
    #[serde(other)]
    Unknown,
}

// ============================================================================
// Conversions
// ============================================================================

impl RawMessage {
    /// Request id this frame answers, if it is a correlated response.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Self::Quote { request_id, .. } => *request_id,
            Self::HistoricalData { request_id, .. } => Some(*request_id),
            Self::Error { request_id, .. } => *request_id,
            _ => None,
        }
    }

    /// Convert a correlated response frame into a request outcome.
    ///
    /// Returns `None` for frames that are not request-scoped.
    pub fn into_request_outcome(self) -> Option<RequestOutcome> {
        match self {
            Self::Quote {
                request_id: Some(_),
                symbol,
                bid,
                ask,
                last,
                timestamp_ms,
            } => Some(RequestOutcome::Quote(Quote {
                symbol: Symbol::new(symbol),
                bid: Price::new(bid),
                ask: Price::new(ask),
                last: Price::new(last),
                timestamp_ms,
            })),
            Self::HistoricalData { bars, .. } => Some(RequestOutcome::Bars(
                bars.into_iter().map(RawBar::into_bar).collect(),
            )),
            Self::Error {
                request_id: Some(_),
                code,
                message,
                ..
            } => Some(RequestOutcome::Rejected { code, message }),
            _ => None,
        }
    }

    /// Translate this frame into exactly one typed event.
    ///
    /// Returns `None` for frames with no downstream meaning (`pong`,
    /// unknown types).
    pub fn into_event(self) -> Option<GatewayEvent> {
        match self {
            Self::HelloAck {
                session_id,
                next_order_id,
            } => Some(GatewayEvent::ConnectionAck {
                session_id,
                next_order_id,
            }),
            Self::Pong | Self::Unknown => None,
            Self::OrderStatus {
                order_id,
                status,
                reason,
            } => Some(GatewayEvent::OrderStatus {
                order_id: OrderId::new(order_id),
                status,
                reason,
            }),
            Self::Execution {
                order_id,
                exec_id,
                symbol,
                side,
                quantity,
                price,
                timestamp_ms,
            } => Some(GatewayEvent::Execution(Execution {
                order_id: OrderId::new(order_id),
                exec_id,
                symbol: Symbol::new(symbol),
                side,
                quantity: Qty::new(quantity),
                price: Price::new(price),
                timestamp_ms,
            })),
            Self::Quote {
                symbol,
                bid,
                ask,
                last,
                timestamp_ms,
                ..
            } => Some(GatewayEvent::Quote(Quote {
                symbol: Symbol::new(symbol),
                bid: Price::new(bid),
                ask: Price::new(ask),
                last: Price::new(last),
                timestamp_ms,
            })),
            Self::HistoricalData {
                request_id,
                symbol,
                bars,
            } => Some(GatewayEvent::HistoricalBars {
                request_id,
                symbol: Symbol::new(symbol),
                bars: bars.into_iter().map(RawBar::into_bar).collect(),
            }),
            Self::AccountSummary {
                cash,
                buying_power,
                net_liquidation,
                timestamp_ms,
            } => Some(GatewayEvent::AccountSummary(AccountSnapshot::new(
                Price::new(cash),
                Price::new(buying_power),
                Price::new(net_liquidation),
                timestamp_ms,
            ))),
            Self::ResyncBegin => Some(GatewayEvent::ResyncBegin),
            Self::ResyncPosition {
                symbol,
                quantity,
                avg_cost,
                timestamp_ms,
            } => Some(GatewayEvent::ResyncPosition(Position::new(
                Symbol::new(symbol),
                Qty::new(quantity),
                Price::new(avg_cost),
                timestamp_ms,
            ))),
            Self::ResyncEnd => Some(GatewayEvent::ResyncEnd),
            Self::Status { code, message } => Some(GatewayEvent::Status { code, message }),
            Self::Error {
                code,
                message,
                order_id,
                ..
            } => Some(GatewayEvent::Error {
                code,
                message,
                order_id: order_id.map(OrderId::new),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_hello_frame_shape() {
        let req = GatewayRequest::hello(&ClientId::from_string("rotor_abc123".to_string()));
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"type\":\"hello\""));
        assert!(json.contains("\"client_id\":\"rotor_abc123\""));
    }

    #[test]
    fn test_place_order_frame_shape() {
        let order = Order::market(
            OrderId::new(101),
            Symbol::new("TQQQ"),
            OrderSide::Buy,
            Qty::new(211),
        );
        let json = serde_json::to_string(&GatewayRequest::place_order(&order)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "place_order");
        assert_eq!(value["order_id"], 101);
        assert_eq!(value["symbol"], "TQQQ");
        assert_eq!(value["side"], "BUY");
        assert_eq!(value["quantity"], 211);
        assert_eq!(value["kind"], "market");
    }

    #[test]
    fn test_historical_data_frame_interval_code() {
        let req = GatewayRequest::historical_data(7, &Symbol::new("QQQ"), 90, BarInterval::OneDay);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"interval\":\"1d\""));
        assert!(json.contains("\"request_id\":7"));
    }

    #[test]
    fn test_parse_hello_ack() {
        let raw: RawMessage = serde_json::from_str(
            r#"{"type":"hello_ack","session_id":"s-77","next_order_id":4200}"#,
        )
        .unwrap();
        let event = raw.into_event().unwrap();
        assert_eq!(
            event,
            GatewayEvent::ConnectionAck {
                session_id: "s-77".to_string(),
                next_order_id: 4200,
            }
        );
    }

    #[test]
    fn test_parse_execution_with_string_price() {
        let raw: RawMessage = serde_json::from_str(
            r#"{"type":"execution","order_id":9,"exec_id":"e-1","symbol":"TQQQ",
                "side":"BUY","quantity":40,"price":"450.25","timestamp_ms":1700000000000}"#,
        )
        .unwrap();
        match raw.into_event().unwrap() {
            GatewayEvent::Execution(exec) => {
                assert_eq!(exec.order_id, OrderId::new(9));
                assert_eq!(exec.quantity, Qty::new(40));
                assert_eq!(exec.price, Price::new(dec!(450.25)));
            }
            other => panic!("expected execution event, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_streamed_quote_has_no_request_id() {
        let raw: RawMessage = serde_json::from_str(
            r#"{"type":"quote","symbol":"QQQ","bid":"381.10","ask":"381.12",
                "last":"381.11","timestamp_ms":1700000000000}"#,
        )
        .unwrap();
        assert_eq!(raw.request_id(), None);
        assert!(matches!(
            raw.into_event().unwrap(),
            GatewayEvent::Quote(_)
        ));
    }

    #[test]
    fn test_parse_correlated_quote() {
        let raw: RawMessage = serde_json::from_str(
            r#"{"type":"quote","request_id":12,"symbol":"QQQ","bid":"381.10",
                "ask":"381.12","last":"381.11","timestamp_ms":1700000000000}"#,
        )
        .unwrap();
        assert_eq!(raw.request_id(), Some(12));
        match raw.into_request_outcome().unwrap() {
            RequestOutcome::Quote(q) => {
                assert_eq!(q.symbol, Symbol::new("QQQ"));
                assert_eq!(q.last, Price::new(dec!(381.11)));
            }
            other => panic!("expected quote outcome, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_error_scoped_to_request() {
        let raw: RawMessage = serde_json::from_str(
            r#"{"type":"error","code":504,"message":"no data","request_id":3}"#,
        )
        .unwrap();
        assert_eq!(raw.request_id(), Some(3));
        match raw.into_request_outcome().unwrap() {
            RequestOutcome::Rejected { code, message } => {
                assert_eq!(code, 504);
                assert_eq!(message, "no data");
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_error_scoped_to_order() {
        let raw: RawMessage = serde_json::from_str(
            r#"{"type":"error","code":201,"message":"insufficient margin","order_id":55}"#,
        )
        .unwrap();
        assert_eq!(raw.request_id(), None);
        match raw.into_event().unwrap() {
            GatewayEvent::Error { code, order_id, .. } => {
                assert_eq!(code, 201);
                assert_eq!(order_id, Some(OrderId::new(55)));
            }
            other => panic!("expected error event, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_resync_burst_frames() {
        let begin: RawMessage = serde_json::from_str(r#"{"type":"resync_begin"}"#).unwrap();
        assert_eq!(begin.into_event(), Some(GatewayEvent::ResyncBegin));

        let pos: RawMessage = serde_json::from_str(
            r#"{"type":"resync_position","symbol":"tqqq","quantity":-30,
                "avg_cost":"55.50","timestamp_ms":1700000000000}"#,
        )
        .unwrap();
        match pos.into_event().unwrap() {
            GatewayEvent::ResyncPosition(p) => {
                // Wire symbols normalize to canonical uppercase.
                assert_eq!(p.symbol, Symbol::new("TQQQ"));
                assert_eq!(p.quantity, Qty::new(-30));
            }
            other => panic!("expected resync position, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_tolerated() {
        let raw: RawMessage =
            serde_json::from_str(r#"{"type":"fancy_new_frame","whatever":1}"#).unwrap();
        assert!(matches!(raw, RawMessage::Unknown));
        assert_eq!(raw.into_event(), None);
    }

    #[test]
    fn test_parse_order_status_rejection() {
        let raw: RawMessage = serde_json::from_str(
            r#"{"type":"order_status","order_id":8,"status":"rejected","reason":"margin"}"#,
        )
        .unwrap();
        match raw.into_event().unwrap() {
            GatewayEvent::OrderStatus {
                order_id,
                status,
                reason,
            } => {
                assert_eq!(order_id, OrderId::new(8));
                assert_eq!(status, OrderStatusKind::Rejected);
                assert_eq!(reason.as_deref(), Some("margin"));
            }
            other => panic!("expected order status, got {:?}", other),
        }
    }
}
