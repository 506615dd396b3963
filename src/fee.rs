//! Commission calculation.
//!
//! Matches `money_manager.py`'s straight decimal multiply
//! (`bid_commission = total_quantity * DEFAULT_COMMISSION`): no fixed-point
//! scaling, no minimum-fee floor — the source has neither and nothing in
//! this crate's scope adds one.

use rust_decimal::Decimal;

/// Default taker commission rate: 0.002 (0.20%).
pub const DEFAULT_COMMISSION: Decimal = Decimal::from_parts(2, 0, 0, false, 3);

/// Commission charged on `quantity * price` at the given rate.
#[inline]
pub fn commission_amount(quantity: Decimal, price: Decimal, commission: Decimal) -> Decimal {
    quantity * price * commission
}

/// `base * (1 + commission)` — the amount actually frozen/debited once
/// commission is folded in.
#[inline]
pub fn with_commission(base: Decimal, commission: Decimal) -> Decimal {
    base * (Decimal::ONE + commission)
}
