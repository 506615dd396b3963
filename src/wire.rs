//! Intake wire format (spec §6.1): one JSON object per TCP connection, at
//! most [`MAX_MESSAGE_BYTES`] bytes, dispatched by field presence the same
//! way the source's `SocketHandler` dispatches on a duck-typed dict —
//! `cancelled`, then `edited`, else a new order. A literal `STOP` byte
//! string (not JSON) is the shutdown sentinel, checked before any parse
//! attempt.

use serde_json::Value;

use crate::core_types::{Order, OrderId, OrderStatus, OrderType, Side, Timestamp, UserId};
use crate::errors::IntakeError;
use crate::money::{self, Pair};

pub const MAX_MESSAGE_BYTES: usize = 256;

/// An amendment request as it arrives on the wire: no replacement id (spec
/// §6.1's Edit message carries none — see DESIGN.md's resolution of where
/// the new id comes from).
#[derive(Debug, Clone)]
pub struct EditRequest {
    pub former_order_id: OrderId,
    pub quantity: rust_decimal::Decimal,
    pub price: rust_decimal::Decimal,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone)]
pub enum IntakeMessage {
    NewOrder(Order),
    Cancel { order_id: OrderId, timestamp: Timestamp },
    Edit(EditRequest),
    Stop,
}

/// Parses one intake message. `pair` is the engine's own pair — a message
/// naming any other pair is rejected rather than silently ignored, since a
/// mixed-pair message on this socket can only be a misconfigured client.
pub fn parse_message(bytes: &[u8], pair: Pair) -> Result<IntakeMessage, IntakeError> {
    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(IntakeError::Malformed(format!("message exceeds {MAX_MESSAGE_BYTES} bytes")));
    }
    if bytes == b"STOP" {
        return Ok(IntakeMessage::Stop);
    }

    let value: Value = serde_json::from_slice(bytes).map_err(|e| IntakeError::Malformed(e.to_string()))?;

    if value.get("cancelled").and_then(Value::as_bool).unwrap_or(false) {
        return parse_cancel(&value);
    }
    if value.get("edited").and_then(Value::as_bool).unwrap_or(false) {
        return parse_edit(&value);
    }
    parse_new_order(&value, pair)
}

fn get_str<'a>(value: &'a Value, field: &str) -> Result<&'a str, IntakeError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| IntakeError::Malformed(format!("missing or non-string field '{field}'")))
}

fn get_i64(value: &Value, field: &str) -> Result<i64, IntakeError> {
    value
        .get(field)
        .and_then(Value::as_i64)
        .ok_or_else(|| IntakeError::Malformed(format!("missing or non-integer field '{field}'")))
}

fn get_u64(value: &Value, field: &str) -> Result<u64, IntakeError> {
    value
        .get(field)
        .and_then(Value::as_u64)
        .ok_or_else(|| IntakeError::Malformed(format!("missing or non-integer field '{field}'")))
}

fn parse_cancel(value: &Value) -> Result<IntakeMessage, IntakeError> {
    let order_id = get_u64(value, "order_id")?;
    if order_id == 0 {
        return Err(IntakeError::NonPositiveOrderId);
    }
    let timestamp = get_i64(value, "timestamp")?;
    Ok(IntakeMessage::Cancel { order_id, timestamp })
}

fn parse_edit(value: &Value) -> Result<IntakeMessage, IntakeError> {
    let former_order_id = get_u64(value, "former_order_id")?;
    if former_order_id == 0 {
        return Err(IntakeError::NonPositiveOrderId);
    }
    let quantity = money::parse_amount_allow_zero(get_str(value, "quantity")?)?;
    let price = money::parse_amount_allow_zero(get_str(value, "price")?)?;
    let timestamp = get_i64(value, "timestamp")?;
    Ok(IntakeMessage::Edit(EditRequest { former_order_id, quantity, price, timestamp }))
}

fn parse_new_order(value: &Value, expected_pair: Pair) -> Result<IntakeMessage, IntakeError> {
    let pair_str = get_str(value, "pair")?;
    let pair: Pair = pair_str.parse()?;
    if pair != expected_pair {
        return Err(IntakeError::UnknownPair(pair_str.to_string()));
    }

    let order_id = get_u64(value, "order_id")?;
    if order_id == 0 {
        return Err(IntakeError::NonPositiveOrderId);
    }
    let user_id: UserId = get_u64(value, "user_id")?;

    let side = match get_str(value, "side")? {
        "bid" => Side::Bid,
        "ask" => Side::Ask,
        other => return Err(IntakeError::Malformed(format!("unknown side '{other}'"))),
    };
    let order_type = match get_str(value, "order_type")? {
        "market" => OrderType::Market,
        "limit" => OrderType::Limit,
        other => return Err(IntakeError::Malformed(format!("unknown order_type '{other}'"))),
    };

    let quantity = money::parse_amount(get_str(value, "quantity")?)?;
    let initial_quantity = money::parse_amount(get_str(value, "initial_quantity")?)?;
    let price = match order_type {
        OrderType::Market => rust_decimal::Decimal::ZERO,
        OrderType::Limit => money::parse_amount(get_str(value, "price")?)?,
    };
    let timestamp = get_i64(value, "timestamp")?;

    Ok(IntakeMessage::NewOrder(Order {
        order_id,
        user_id,
        pair,
        side,
        order_type,
        price,
        quantity,
        initial_quantity,
        timestamp,
        status: OrderStatus::Pending,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Currency;

    fn pair() -> Pair {
        Pair::new(Currency::Btc, Currency::Eth)
    }

    #[test]
    fn parses_a_new_limit_order() {
        let json = br#"{"order_id":1,"user_id":7,"pair":"BTC_ETH","side":"bid",
                         "order_type":"limit","quantity":"2.5","initial_quantity":"2.5",
                         "price":"100.00","timestamp":1000}"#;
        let message = parse_message(json, pair()).unwrap();
        match message {
            IntakeMessage::NewOrder(order) => {
                assert_eq!(order.order_id, 1);
                assert_eq!(order.side, Side::Bid);
                assert_eq!(order.order_type, OrderType::Limit);
            }
            other => panic!("expected a new order, got {other:?}"),
        }
    }

    #[test]
    fn parses_a_market_order_with_zero_price() {
        let json = br#"{"order_id":2,"user_id":7,"pair":"BTC_ETH","side":"ask",
                         "order_type":"market","quantity":"1","initial_quantity":"1",
                         "price":"0","timestamp":1000}"#;
        let message = parse_message(json, pair()).unwrap();
        match message {
            IntakeMessage::NewOrder(order) => assert_eq!(order.price, rust_decimal::Decimal::ZERO),
            other => panic!("expected a new order, got {other:?}"),
        }
    }

    #[test]
    fn parses_a_cancel() {
        let json = br#"{"order_id":5,"cancelled":true,"timestamp":2000}"#;
        match parse_message(json, pair()).unwrap() {
            IntakeMessage::Cancel { order_id, timestamp } => {
                assert_eq!(order_id, 5);
                assert_eq!(timestamp, 2000);
            }
            other => panic!("expected a cancel, got {other:?}"),
        }
    }

    #[test]
    fn parses_an_edit_without_a_new_order_id() {
        let json = br#"{"former_order_id":5,"edited":true,"quantity":"0","price":"105.0","timestamp":3000}"#;
        match parse_message(json, pair()).unwrap() {
            IntakeMessage::Edit(edit) => {
                assert_eq!(edit.former_order_id, 5);
                assert_eq!(edit.quantity, rust_decimal::Decimal::ZERO);
            }
            other => panic!("expected an edit, got {other:?}"),
        }
    }

    #[test]
    fn raw_stop_bytes_bypass_json_parsing() {
        assert!(matches!(parse_message(b"STOP", pair()), Ok(IntakeMessage::Stop)));
    }

    #[test]
    fn rejects_mismatched_pair() {
        let json = br#"{"order_id":1,"user_id":7,"pair":"BTC_XRP","side":"bid",
                         "order_type":"limit","quantity":"1","initial_quantity":"1",
                         "price":"1","timestamp":1}"#;
        assert!(matches!(parse_message(json, pair()), Err(IntakeError::UnknownPair(_))));
    }

    #[test]
    fn rejects_non_positive_order_id() {
        let json = br#"{"order_id":0,"cancelled":true,"timestamp":1}"#;
        assert!(matches!(parse_message(json, pair()), Err(IntakeError::NonPositiveOrderId)));
    }

    #[test]
    fn rejects_oversized_message() {
        let oversized = vec![b' '; MAX_MESSAGE_BYTES + 1];
        assert!(matches!(parse_message(&oversized, pair()), Err(IntakeError::Malformed(_))));
    }
}
