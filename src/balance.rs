//! Per-user, per-currency balances: the Balance Ledger (BL).
//!
//! `Balance` is the enforced type — fields are private, every mutation is a
//! named, checked operation returning `Result`, never a bare increment.
//! `BalanceLedger` is the abstract interface the rest of the engine programs
//! against (so it can be driven by an in-memory fake in tests); `InMemoryLedger`
//! is the one production implementation, a `DashMap`-backed process-wide store.

use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::core_types::{OrderId, UserId};
use crate::money::Currency;
use crate::orderbook::OrderBlob;

/// Active/frozen balance for one (user, currency) pair.
///
/// Invariant: both fields are always `>= 0` (spec §8 invariant 2). Every
/// mutation is checked and returns `Result` rather than allowing a caller to
/// drive the balance negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Balance {
    active: Decimal,
    frozen: Decimal,
}

impl Balance {
    pub fn active(&self) -> Decimal {
        self.active
    }

    pub fn frozen(&self) -> Decimal {
        self.frozen
    }

    /// External deposit: increases spendable funds. Not used by matching
    /// itself (deposits are a wallet/funding concern, out of scope per
    /// spec §1) but kept as the conservation-invariant anchor that tests
    /// check active+frozen against (spec §8 invariant 1).
    pub fn deposit(&mut self, amount: Decimal) -> Result<(), &'static str> {
        if amount.is_sign_negative() {
            return Err("deposit amount must be non-negative");
        }
        self.active += amount;
        Ok(())
    }

    pub fn withdraw(&mut self, amount: Decimal) -> Result<(), &'static str> {
        if self.active < amount {
            return Err("insufficient active funds to withdraw");
        }
        self.active -= amount;
        Ok(())
    }

    /// Move funds from active to frozen (order creation freeze, spec §4.1).
    pub fn freeze(&mut self, amount: Decimal) -> Result<(), &'static str> {
        if self.active < amount {
            return Err("insufficient active funds to freeze");
        }
        self.active -= amount;
        self.frozen += amount;
        Ok(())
    }

    /// Move funds from frozen back to active (cancel/refund, spec §4.1).
    pub fn unfreeze(&mut self, amount: Decimal) -> Result<(), &'static str> {
        if self.frozen < amount {
            return Err("insufficient frozen funds to unfreeze");
        }
        self.frozen -= amount;
        self.active += amount;
        Ok(())
    }

    /// Remove funds from frozen without returning them to active (the
    /// debit leg of a fill on the side that was pre-frozen).
    pub fn spend_frozen(&mut self, amount: Decimal) -> Result<(), &'static str> {
        if self.frozen < amount {
            return Err("insufficient frozen funds to spend");
        }
        self.frozen -= amount;
        Ok(())
    }

    /// Credit active funds directly (the receiving leg of a fill).
    pub fn credit_active(&mut self, amount: Decimal) -> Result<(), &'static str> {
        if amount.is_sign_negative() {
            return Err("credit amount must be non-negative");
        }
        self.active += amount;
        Ok(())
    }

    /// Debit active funds directly (market-order taker leg: never pre-frozen).
    pub fn debit_active(&mut self, amount: Decimal) -> Result<(), &'static str> {
        if self.active < amount {
            return Err("insufficient active funds to debit");
        }
        self.active -= amount;
        Ok(())
    }
}

/// Abstract interface for the Balance Ledger (spec §9 Design Notes: model
/// behind an abstract interface so the engine can be tested against an
/// in-memory fake).
pub trait BalanceLedger: Send + Sync {
    fn get_balance(&self, user: UserId, curr: Currency) -> Balance;

    /// Applies `f` to the balance under lock and returns its result. This is
    /// the "pipeline" primitive from spec §4.1: every multi-leg adjustment
    /// for one fill runs through one or more `with_balance` calls, each
    /// atomic with respect to other readers/writers of that key.
    fn with_balance<R>(
        &self,
        user: UserId,
        curr: Currency,
        f: impl FnOnce(&mut Balance) -> Result<R, &'static str>,
    ) -> Result<R, &'static str>;

    fn put_blob(&self, order_id: OrderId, blob: OrderBlob);
    fn get_blob(&self, order_id: OrderId) -> Option<OrderBlob>;
    fn delete_blob(&self, order_id: OrderId);

    fn mark_cancelled(&self, order_id: OrderId);
    fn was_cancelled(&self, order_id: OrderId) -> bool;
    fn clear_cancelled(&self, order_id: OrderId);

    fn halted(&self) -> bool;
    fn set_halted(&self);

    /// `<pair>_running` (spec §6.3): set once OB has finished boot recovery
    /// and cleared at the start of shutdown.
    fn is_running(&self) -> bool;
    fn set_running(&self, running: bool);
}

/// Process-wide, `DashMap`-backed implementation of [`BalanceLedger`].
#[derive(Default)]
pub struct InMemoryLedger {
    balances: DashMap<(UserId, Currency), Balance>,
    blobs: DashMap<OrderId, OrderBlob>,
    cancelled: Mutex<HashSet<OrderId>>,
    halted: AtomicBool,
    running: AtomicBool,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/bootstrap helper: credit a user's active balance directly,
    /// bypassing the checked-mutation API (there is no external deposit
    /// endpoint in this crate's scope).
    pub fn seed_active(&self, user: UserId, curr: Currency, amount: Decimal) {
        self.balances
            .entry((user, curr))
            .or_default()
            .active += amount;
    }
}

impl BalanceLedger for InMemoryLedger {
    fn get_balance(&self, user: UserId, curr: Currency) -> Balance {
        self.balances.get(&(user, curr)).map(|b| *b).unwrap_or_default()
    }

    fn with_balance<R>(
        &self,
        user: UserId,
        curr: Currency,
        f: impl FnOnce(&mut Balance) -> Result<R, &'static str>,
    ) -> Result<R, &'static str> {
        let mut entry = self.balances.entry((user, curr)).or_default();
        f(&mut entry)
    }

    fn put_blob(&self, order_id: OrderId, blob: OrderBlob) {
        self.blobs.insert(order_id, blob);
    }

    fn get_blob(&self, order_id: OrderId) -> Option<OrderBlob> {
        self.blobs.get(&order_id).map(|b| b.clone())
    }

    fn delete_blob(&self, order_id: OrderId) {
        self.blobs.remove(&order_id);
    }

    fn mark_cancelled(&self, order_id: OrderId) {
        self.cancelled.lock().expect("cancelled set poisoned").insert(order_id);
    }

    fn was_cancelled(&self, order_id: OrderId) -> bool {
        self.cancelled.lock().expect("cancelled set poisoned").contains(&order_id)
    }

    fn clear_cancelled(&self, order_id: OrderId) {
        self.cancelled.lock().expect("cancelled set poisoned").remove(&order_id);
    }

    fn halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    fn set_halted(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freeze_then_unfreeze_round_trips() {
        let mut bal = Balance::default();
        bal.deposit(Decimal::new(1000, 0)).unwrap();
        bal.freeze(Decimal::new(600, 0)).unwrap();
        assert_eq!(bal.active(), Decimal::new(400, 0));
        assert_eq!(bal.frozen(), Decimal::new(600, 0));

        bal.unfreeze(Decimal::new(200, 0)).unwrap();
        assert_eq!(bal.active(), Decimal::new(600, 0));
        assert_eq!(bal.frozen(), Decimal::new(400, 0));
    }

    #[test]
    fn freeze_rejects_insufficient_active() {
        let mut bal = Balance::default();
        bal.deposit(Decimal::new(100, 0)).unwrap();
        assert!(bal.freeze(Decimal::new(200, 0)).is_err());
    }

    #[test]
    fn spend_frozen_never_goes_negative() {
        let mut bal = Balance::default();
        bal.deposit(Decimal::new(100, 0)).unwrap();
        bal.freeze(Decimal::new(50, 0)).unwrap();
        assert!(bal.spend_frozen(Decimal::new(60, 0)).is_err());
        bal.spend_frozen(Decimal::new(50, 0)).unwrap();
        assert_eq!(bal.frozen(), Decimal::ZERO);
    }

    #[test]
    fn in_memory_ledger_tracks_per_user_per_currency() {
        let ledger = InMemoryLedger::new();
        ledger.seed_active(1, Currency::Btc, Decimal::new(10, 0));
        ledger.seed_active(1, Currency::Eth, Decimal::new(20, 0));

        assert_eq!(ledger.get_balance(1, Currency::Btc).active(), Decimal::new(10, 0));
        assert_eq!(ledger.get_balance(1, Currency::Eth).active(), Decimal::new(20, 0));
        assert_eq!(ledger.get_balance(2, Currency::Btc).active(), Decimal::ZERO);
    }

    #[test]
    fn with_balance_applies_atomically() {
        let ledger = InMemoryLedger::new();
        ledger.seed_active(1, Currency::Btc, Decimal::new(100, 0));

        ledger
            .with_balance(1, Currency::Btc, |b| b.freeze(Decimal::new(40, 0)))
            .unwrap();

        let bal = ledger.get_balance(1, Currency::Btc);
        assert_eq!(bal.active(), Decimal::new(60, 0));
        assert_eq!(bal.frozen(), Decimal::new(40, 0));
    }

    #[test]
    fn blob_and_cancelled_set_roundtrip() {
        let ledger = InMemoryLedger::new();
        assert!(ledger.get_blob(1).is_none());
        assert!(!ledger.was_cancelled(1));

        ledger.mark_cancelled(1);
        assert!(ledger.was_cancelled(1));
        ledger.clear_cancelled(1);
        assert!(!ledger.was_cancelled(1));
    }

    #[test]
    fn halted_flag_is_process_wide() {
        let ledger = InMemoryLedger::new();
        assert!(!ledger.halted());
        ledger.set_halted();
        assert!(ledger.halted());
    }

    #[test]
    fn running_flag_toggles() {
        let ledger = InMemoryLedger::new();
        assert!(!ledger.is_running());
        ledger.set_running(true);
        assert!(ledger.is_running());
        ledger.set_running(false);
        assert!(!ledger.is_running());
    }
}
