//! Typed errors at the engine's seams (spec §7.1): intake validation and
//! persistence failure. Matching itself never needs its own error type —
//! every rejection the book can produce (insufficient funds, already
//! cancelled, can't handle an edit) is already representable as "no
//! `PwCommand`s were produced", which `orderbook.rs`'s functions return
//! directly rather than via `Result`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("malformed intake message: {0}")]
    Malformed(String),

    #[error("unknown or mismatched trading pair: {0}")]
    UnknownPair(String),

    #[error("order id must be positive")]
    NonPositiveOrderId,

    #[error(transparent)]
    Money(#[from] crate::money::MoneyError),
}

#[derive(Debug, Error)]
pub enum PwError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("dump-on-failure write error: {0}")]
    Dump(#[from] std::io::Error),
}
