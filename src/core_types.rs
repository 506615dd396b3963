//! Core type definitions shared across the engine.
//!
//! These are fundamental type aliases and the `Order` record itself (spec
//! §3 DATA MODEL).

use rust_decimal::Decimal;

use crate::money::Pair;

/// User ID — globally unique, immutable after assignment.
pub type UserId = u64;

/// Order ID — unique within the system, monotonic.
pub type OrderId = u64;

/// Creation/arrival timestamp, used as the tie-breaker within a price level
/// and as the `(class_priority, timestamp)` intake ordering key.
pub type Timestamp = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Bid => Side::Ask,
            Side::Ask => Side::Bid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderStatus {
    Pending,
    Completed,
    Cancelled,
    Edited,
}

/// An order as carried through intake, the book, and persistence.
///
/// Invariants (spec §3): `0 <= quantity <= initial_quantity`;
/// `initial_quantity > 0`; once `status != Pending` the order is absent
/// from the book; limit orders always carry a positive price before
/// reaching the book.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub pair: Pair,
    pub side: Side,
    pub order_type: OrderType,
    /// Limit price, or `Decimal::ZERO` for unpriced market intake.
    pub price: Decimal,
    /// Remaining base-quantity.
    pub quantity: Decimal,
    /// Base-quantity at creation; immutable thereafter.
    pub initial_quantity: Decimal,
    pub timestamp: Timestamp,
    pub status: OrderStatus,
}

impl Order {
    pub fn was_changed(&self) -> bool {
        self.quantity != self.initial_quantity
    }
}
