//! Commands emitted by the Order Book for the Persistence Writer.
//!
//! One variant per op in the PW contract (spec §4.2): `update`, `cancel`,
//! `edit`, `freeze`, `match_transaction`, `cancel_transaction`, `stop`.
//! OB never talks to the database directly — it only ever produces a
//! `Vec<PwCommand>` per dispatched command, which `engine_runtime` forwards
//! to the PW task in emission order.

use rust_decimal::Decimal;
use serde::Serialize;

use crate::core_types::{OrderId, UserId};
use crate::money::Currency;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerCategory {
    Freeze,
    Match,
    CancelBet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TxType {
    Incoming,
    Reduction,
}

/// One row of the `ledger_transactions` table (spec §4.2.1).
#[derive(Debug, Clone, Serialize)]
pub struct LedgerRow {
    pub user_id: UserId,
    pub order_id: OrderId,
    pub category: LedgerCategory,
    pub amount: Decimal,
    pub commission_amount: Decimal,
    pub tx_type: TxType,
    pub currency: Currency,
}

/// Serialized shape doubles as the dump-on-failure entry format (spec §4.2.2):
/// `#[serde(tag = "command")]` gives each variant the same discriminator the
/// PW contract already names it by (`update`, `cancel`, ...), and every
/// `Decimal` field serializes as a string via `rust_decimal`'s `serde-str`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum PwCommand {
    /// Set the order's remaining quantity (and, for a market order that
    /// just acquired a price, its price). `quantity == 0` implies
    /// `status = completed` at the PW layer.
    Update {
        order_id: OrderId,
        quantity: Decimal,
        price: Option<Decimal>,
    },
    Cancel {
        order_id: OrderId,
    },
    Edit {
        order_id: OrderId,
    },
    Freeze {
        row: LedgerRow,
    },
    /// The four ledger rows of a single fill, written in one transaction.
    MatchTransaction {
        rows: [LedgerRow; 4],
    },
    CancelTransaction {
        row: LedgerRow,
    },
    Stop,
}
