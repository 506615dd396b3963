//! The Order Book (OB): price-time priority ladders and the matching loop.
//!
//! One `OrderBook` instance serves exactly one pair. Ladders are
//! `BTreeMap`-keyed for O(log n) best-price access: asks ascending on
//! `Decimal` directly, bids descending via `Reverse<Decimal>` (the teacher's
//! `u64::MAX - price` trick has no clean `Decimal` equivalent). An
//! `order_id -> (side, price)` index gives O(1) cancel/edit lookup.
//!
//! Every mutating entry point here returns the `Vec<PwCommand>` it produced;
//! OB never talks to the backend directly.

use std::cmp::Reverse;
use std::collections::{BTreeMap, VecDeque};

use rust_decimal::Decimal;
use rustc_hash::FxHashMap;

use crate::balance::BalanceLedger;
use crate::core_types::{Order, OrderId, OrderStatus, OrderType, Side, Timestamp, UserId};
use crate::fee::{commission_amount, with_commission};
use crate::money::{Currency, Pair};
use crate::pw_command::{LedgerCategory, LedgerRow, PwCommand, TxType};

/// A copy of an open order's parameters, kept in the shared store under
/// `order:<id>` (spec §3). `at_book` flips to `true` the instant the order
/// enters a ladder; the blob is deleted the instant it leaves the book or
/// queue.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBlob {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub pair: Pair,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Decimal,
    pub quantity: Decimal,
    pub initial_quantity: Decimal,
    pub timestamp: Timestamp,
    pub at_book: bool,
}

impl From<&Order> for OrderBlob {
    fn from(order: &Order) -> Self {
        OrderBlob {
            order_id: order.order_id,
            user_id: order.user_id,
            pair: order.pair,
            side: order.side,
            order_type: order.order_type,
            price: order.price,
            quantity: order.quantity,
            initial_quantity: order.initial_quantity,
            timestamp: order.timestamp,
            at_book: false,
        }
    }
}

/// Outcome of matching the incoming order against one resting order at the
/// head of a price level (spec §9 Design Note: replaces exception-for-
/// control-flow with an explicit return type).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    /// The head order was consumed (fully or partially); keep matching.
    Filled,
    /// Nothing left to trade on the incoming side.
    NoLevel,
    /// A market bid could not afford the next fill; matching stops and the
    /// residue is cancelled with no refund (nothing was frozen).
    InsufficientFunds,
}

/// An amendment request (spec §4.4 "Edit"): cancel `order_id` with status
/// `edited`, then create a fresh order carrying the amended fields.
/// `Decimal::ZERO` in `price`/`quantity` means "unchanged" (spec §6.1).
#[derive(Debug, Clone)]
pub struct Amendment {
    pub order_id: OrderId,
    pub new_order_id: OrderId,
    pub price: Decimal,
    pub quantity: Decimal,
    pub timestamp: Timestamp,
}

/// Applies the at-create freeze policy (spec §4.1) ahead of the book itself.
/// Free function (not an `OrderBook` method) because the intake acceptor
/// applies it before an order is even enqueued, let alone reaches the
/// single-writer `OrderBook`: freeze happens at the BL, between the
/// submitter and the socket hand-off, not inside the matching loop.
pub fn freeze_for_create(pair: Pair, commission: Decimal, order: &Order, ledger: &dyn BalanceLedger) -> Result<(), &'static str> {
    match (order.side, order.order_type) {
        (Side::Bid, OrderType::Market) => Ok(()),
        (Side::Bid, OrderType::Limit) => {
            let amount = with_commission(order.quantity * order.price, commission);
            ledger.with_balance(order.user_id, pair.quote, |b| b.freeze(amount))
        }
        (Side::Ask, _) => {
            let amount = with_commission(order.quantity, commission);
            ledger.with_balance(order.user_id, pair.base, |b| b.freeze(amount))
        }
    }
}

/// The `freeze` ledger row to accompany a successful [`freeze_for_create`].
pub fn freeze_ledger_row(pair: Pair, commission: Decimal, order: &Order) -> LedgerRow {
    let (currency, amount, commission) = match order.side {
        Side::Bid => (
            pair.quote,
            order.quantity * order.price,
            commission_amount(order.quantity, order.price, commission),
        ),
        Side::Ask => (pair.base, order.quantity, order.quantity * commission),
    };
    LedgerRow {
        user_id: order.user_id,
        order_id: order.order_id,
        category: LedgerCategory::Freeze,
        amount,
        commission_amount: commission,
        tx_type: TxType::Incoming,
        currency,
    }
}

/// Refunds the frozen portion of a cancelled order (spec §4.1 "Refund
/// policy"): full commission back only if quantity was never changed. Free
/// function so it can be shared between [`OrderBook::cancel_order`] and
/// [`cancel_not_yet_booked`], which runs off the intake acceptor thread
/// with no `&mut OrderBook` available.
fn refund_cancel(pair: Pair, commission: Decimal, blob: &OrderBlob, ledger: &dyn BalanceLedger) {
    let unchanged = blob.quantity == blob.initial_quantity;
    match blob.side {
        Side::Bid => {
            let base_amount = blob.quantity * blob.price;
            let amount = if unchanged { with_commission(base_amount, commission) } else { base_amount };
            let _ = ledger.with_balance(blob.user_id, pair.quote, |b| b.unfreeze(amount));
        }
        Side::Ask => {
            let amount = if unchanged { with_commission(blob.quantity, commission) } else { blob.quantity };
            let _ = ledger.with_balance(blob.user_id, pair.base, |b| b.unfreeze(amount));
        }
    }
}

/// The `cancel_bet` ledger row (spec §4.2): commission is logged as forgone
/// only for a partially-filled cancel, zero otherwise.
fn cancel_ledger_row(pair: Pair, commission: Decimal, blob: &OrderBlob) -> LedgerRow {
    let partially_filled = blob.quantity > Decimal::ZERO && blob.quantity < blob.initial_quantity;
    let (currency, amount) = match blob.side {
        Side::Bid => (pair.quote, blob.quantity * blob.price),
        Side::Ask => (pair.base, blob.quantity),
    };
    let row_commission = if partially_filled {
        match blob.side {
            Side::Bid => commission_amount(blob.quantity, blob.price, commission),
            Side::Ask => blob.quantity * commission,
        }
    } else {
        Decimal::ZERO
    };
    LedgerRow {
        user_id: blob.user_id,
        order_id: blob.order_id,
        category: LedgerCategory::CancelBet,
        amount,
        commission_amount: row_commission,
        tx_type: TxType::Incoming,
        currency,
    }
}

/// Logs a failed ledger leg during fill settlement instead of discarding it
/// (spec §7 "Ledger inconsistency ... -> logged; affected order skipped"):
/// by the time `settle_fill` runs, the book has already committed the trade,
/// so a failure here means the upstream freeze/credit bookkeeping is wrong,
/// not that this fill should be retried.
fn log_leg_failure(leg: &str, user_id: UserId, currency: Currency, result: Result<(), &'static str>) {
    if let Err(err) = result {
        tracing::error!(user_id, %currency, %err, "ledger inconsistency settling fill leg: {leg}");
    }
}

/// Cancels an order that has not yet reached the book (spec §4.3
/// "cancel-before-seen optimisation"): the creation message is still
/// sitting in the Intake Queue when the cancel arrives. Called directly
/// from the intake acceptor thread rather than routed through `OrderBook`,
/// since nothing here touches a ladder — safe because, until `at_book`
/// flips to `true`, only intake ever touches this order's blob (spec §5
/// "intake never modifying blobs after insert" — the one exception being
/// this path, which deletes it outright once the order is known dead).
///
/// Returns an empty command list both when the order was already closed
/// (spec §8 invariant 6: idempotent no-op) and when it turns out to
/// already be resting (`at_book == true`) — the latter means the caller
/// raced past the book and the normal `cancel_order` path, routed through
/// the Intake Queue, owns the cancellation instead.
pub fn cancel_not_yet_booked(
    pair: Pair,
    commission: Decimal,
    order_id: OrderId,
    ledger: &dyn BalanceLedger,
) -> Vec<PwCommand> {
    let Some(blob) = ledger.get_blob(order_id) else {
        return Vec::new();
    };
    if blob.at_book {
        return Vec::new();
    }

    ledger.mark_cancelled(order_id);

    let mut commands = Vec::new();
    let market_bid = blob.order_type == OrderType::Market && blob.side == Side::Bid;
    if !market_bid {
        refund_cancel(pair, commission, &blob, ledger);
        commands.push(PwCommand::CancelTransaction { row: cancel_ledger_row(pair, commission, &blob) });
    }
    commands.push(PwCommand::Cancel { order_id });
    ledger.delete_blob(order_id);
    commands
}

pub struct OrderBook {
    pair: Pair,
    commission: Decimal,
    default_residue_price: Decimal,
    asks: BTreeMap<Decimal, VecDeque<Order>>,
    bids: BTreeMap<Reverse<Decimal>, VecDeque<Order>>,
    index: FxHashMap<OrderId, (Side, Decimal)>,
}

impl OrderBook {
    pub fn new(pair: Pair, commission: Decimal, default_residue_price: Decimal) -> Self {
        Self {
            pair,
            commission,
            default_residue_price,
            asks: BTreeMap::new(),
            bids: BTreeMap::new(),
            index: FxHashMap::default(),
        }
    }

    pub fn pair(&self) -> Pair {
        self.pair
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.keys().next().map(|Reverse(p)| *p)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.keys().next().copied()
    }

    pub fn depth(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }

    /// A human-readable dump of both ladders (spec §4.5 shutdown: "writes
    /// a human-readable book dump to a log file").
    pub fn dump_human_readable(&self) -> String {
        use std::fmt::Write as _;
        let mut out = String::new();
        writeln!(out, "=== order book dump: {} ===", self.pair).ok();

        writeln!(out, "-- bids (best first) --").ok();
        for (Reverse(price), level) in &self.bids {
            let volume: Decimal = level.iter().map(|o| o.quantity).sum();
            writeln!(out, "price {price} volume {volume}").ok();
            for order in level {
                writeln!(out, "  #{} user={} qty={} ts={}", order.order_id, order.user_id, order.quantity, order.timestamp).ok();
            }
        }

        writeln!(out, "-- asks (best first) --").ok();
        for (price, level) in &self.asks {
            let volume: Decimal = level.iter().map(|o| o.quantity).sum();
            writeln!(out, "price {price} volume {volume}").ok();
            for order in level {
                writeln!(out, "  #{} user={} qty={} ts={}", order.order_id, order.user_id, order.quantity, order.timestamp).ok();
            }
        }

        out
    }

    /// Reloads resting orders from durable storage at boot (spec §4.4
    /// "reload resting orders... into the appropriate ladder").
    pub fn fill_book(&mut self, orders: Vec<Order>, ledger: &dyn BalanceLedger) {
        for order in orders {
            self.mark_blob_at_book(&order, ledger);
            self.insert_resting(order);
        }
    }

    fn insert_resting(&mut self, order: Order) {
        self.index.insert(order.order_id, (order.side, order.price));
        match order.side {
            Side::Bid => self.bids.entry(Reverse(order.price)).or_default().push_back(order),
            Side::Ask => self.asks.entry(order.price).or_default().push_back(order),
        }
    }

    fn remove_level_if_empty(&mut self, side: Side, price: Decimal) {
        match side {
            Side::Bid => {
                if self.bids.get(&Reverse(price)).is_some_and(VecDeque::is_empty) {
                    self.bids.remove(&Reverse(price));
                }
            }
            Side::Ask => {
                if self.asks.get(&price).is_some_and(VecDeque::is_empty) {
                    self.asks.remove(&price);
                }
            }
        }
    }

    fn remove_from_ladder(&mut self, side: Side, price: Decimal, order_id: OrderId) {
        self.index.remove(&order_id);
        let level = match side {
            Side::Bid => self.bids.get_mut(&Reverse(price)),
            Side::Ask => self.asks.get_mut(&price),
        };
        if let Some(level) = level
            && let Some(pos) = level.iter().position(|o| o.order_id == order_id)
        {
            level.remove(pos);
        }
        self.remove_level_if_empty(side, price);
    }

    fn mark_blob_at_book(&self, order: &Order, ledger: &dyn BalanceLedger) {
        let mut blob = OrderBlob::from(order);
        blob.at_book = true;
        ledger.put_blob(order.order_id, blob);
    }

    /// Applies the at-create freeze policy (spec §4.1). Market bids are
    /// exempt: their affordability check is deferred to each matching step.
    pub fn freeze_for_create(&self, order: &Order, ledger: &dyn BalanceLedger) -> Result<(), &'static str> {
        freeze_for_create(self.pair, self.commission, order, ledger)
    }

    /// The `freeze` ledger row to accompany a successful [`freeze_for_create`].
    pub fn freeze_ledger_row(&self, order: &Order) -> LedgerRow {
        freeze_ledger_row(self.pair, self.commission, order)
    }

    /// Dispatches a freshly-queued order to the matching algorithm.
    /// Discards it with no side effect if it was cancelled while still
    /// queued (spec §4.3 cancel-before-seen optimisation).
    pub fn process_new_order(&mut self, order: Order, ledger: &dyn BalanceLedger) -> Vec<PwCommand> {
        if ledger.was_cancelled(order.order_id) {
            ledger.clear_cancelled(order.order_id);
            ledger.delete_blob(order.order_id);
            return Vec::new();
        }
        match order.order_type {
            OrderType::Limit => self.process_limit_order(order, ledger),
            OrderType::Market => self.process_market_order(order, ledger),
        }
    }

    fn process_limit_order(&mut self, mut order: Order, ledger: &dyn BalanceLedger) -> Vec<PwCommand> {
        let mut commands = Vec::new();
        match order.side {
            Side::Bid => {
                while order.quantity > Decimal::ZERO {
                    let Some(best_ask) = self.best_ask() else { break };
                    if best_ask > order.price {
                        break;
                    }
                    self.match_level(Side::Ask, best_ask, &mut order, ledger, &mut commands);
                }
            }
            Side::Ask => {
                while order.quantity > Decimal::ZERO {
                    let Some(best_bid) = self.best_bid() else { break };
                    if best_bid < order.price {
                        break;
                    }
                    self.match_level(Side::Bid, best_bid, &mut order, ledger, &mut commands);
                }
            }
        }

        if order.quantity > Decimal::ZERO {
            self.mark_blob_at_book(&order, ledger);
            let (order_id, quantity, changed) = (order.order_id, order.quantity, order.was_changed());
            self.insert_resting(order);
            if changed {
                commands.push(PwCommand::Update { order_id, quantity, price: None });
            }
        } else {
            ledger.delete_blob(order.order_id);
            commands.push(PwCommand::Update {
                order_id: order.order_id,
                quantity: Decimal::ZERO,
                price: None,
            });
        }

        commands
    }

    fn process_market_order(&mut self, mut order: Order, ledger: &dyn BalanceLedger) -> Vec<PwCommand> {
        let mut commands = Vec::new();

        match order.side {
            Side::Bid => {
                while order.quantity > Decimal::ZERO {
                    let Some(best_ask) = self.best_ask() else { break };
                    if self.match_level(Side::Ask, best_ask, &mut order, ledger, &mut commands)
                        == MatchOutcome::InsufficientFunds
                    {
                        ledger.delete_blob(order.order_id);
                        commands.push(PwCommand::Cancel { order_id: order.order_id });
                        return commands;
                    }
                }
            }
            Side::Ask => {
                while order.quantity > Decimal::ZERO {
                    let Some(best_bid) = self.best_bid() else { break };
                    self.match_level(Side::Bid, best_bid, &mut order, ledger, &mut commands);
                }
            }
        }

        if order.quantity == Decimal::ZERO {
            ledger.delete_blob(order.order_id);
            commands.push(PwCommand::Update {
                order_id: order.order_id,
                quantity: Decimal::ZERO,
                price: None,
            });
            return commands;
        }

        let residue_price = match order.side {
            Side::Bid => self.best_bid().unwrap_or(self.default_residue_price),
            Side::Ask => self.best_ask().unwrap_or(self.default_residue_price),
        };
        order.price = residue_price;

        if order.side == Side::Bid {
            let required = with_commission(order.quantity * residue_price, self.commission);
            let frozen = ledger.with_balance(order.user_id, self.pair.quote, |b| b.freeze(required));
            if frozen.is_err() {
                ledger.delete_blob(order.order_id);
                commands.push(PwCommand::Cancel { order_id: order.order_id });
                return commands;
            }
            commands.push(PwCommand::Freeze {
                row: LedgerRow {
                    user_id: order.user_id,
                    order_id: order.order_id,
                    category: LedgerCategory::Freeze,
                    amount: order.quantity * residue_price,
                    commission_amount: commission_amount(order.quantity, residue_price, self.commission),
                    tx_type: TxType::Incoming,
                    currency: self.pair.quote,
                },
            });
        }
        // Asks are already frozen in full (base currency) at creation; the
        // residue only needs a price, not a new freeze.

        order.status = OrderStatus::Pending;
        self.mark_blob_at_book(&order, ledger);
        commands.push(PwCommand::Update {
            order_id: order.order_id,
            quantity: order.quantity,
            price: Some(order.price),
        });
        self.insert_resting(order);

        commands
    }

    /// Matches `incoming` against the head of the price level `price` on
    /// `resting_side`. Mutates or removes the head order and the incoming
    /// order's remaining quantity, and appends the resulting `PwCommand`s.
    fn match_level(
        &mut self,
        resting_side: Side,
        price: Decimal,
        incoming: &mut Order,
        ledger: &dyn BalanceLedger,
        commands: &mut Vec<PwCommand>,
    ) -> MatchOutcome {
        if incoming.quantity <= Decimal::ZERO {
            return MatchOutcome::NoLevel;
        }

        let head_snapshot = {
            let level = match resting_side {
                Side::Bid => self.bids.get(&Reverse(price)),
                Side::Ask => self.asks.get(&price),
            };
            let Some(head) = level.and_then(VecDeque::front) else {
                return MatchOutcome::NoLevel;
            };
            head.clone()
        };
        let (head_id, head_user, head_price, head_qty) =
            (head_snapshot.order_id, head_snapshot.user_id, head_snapshot.price, head_snapshot.quantity);

        if incoming.order_type == OrderType::Market
            && incoming.side == Side::Bid
            && !self.check_market_bid_assets(incoming.user_id, incoming.quantity.min(head_qty), head_price, ledger)
        {
            return MatchOutcome::InsufficientFunds;
        }

        let traded = incoming.quantity.min(head_qty);
        let new_book_quantity = if incoming.quantity < head_qty { head_qty - traded } else { Decimal::ZERO };

        {
            let level = match resting_side {
                Side::Bid => self.bids.get_mut(&Reverse(price)).expect("level present"),
                Side::Ask => self.asks.get_mut(&price).expect("level present"),
            };
            if new_book_quantity > Decimal::ZERO {
                level.front_mut().expect("head present").quantity = new_book_quantity;
            } else {
                level.pop_front();
                self.index.remove(&head_id);
            }
        }
        self.remove_level_if_empty(resting_side, price);

        // Keep the blob's quantity in lockstep with the ladder (spec §4.4
        // "update both sides' blob quantities in BL"; invariant 3: a blob
        // with `at_book=true` must match its ladder entry exactly, and must
        // not outlive it). A stale blob quantity here is what made a
        // partial-fill cancel refund the full original freeze later.
        if new_book_quantity > Decimal::ZERO {
            let mut resting_blob = OrderBlob::from(&head_snapshot);
            resting_blob.quantity = new_book_quantity;
            resting_blob.at_book = true;
            ledger.put_blob(head_id, resting_blob);
        } else {
            ledger.delete_blob(head_id);
        }

        incoming.quantity -= traded;
        ledger.put_blob(incoming.order_id, OrderBlob::from(&*incoming));

        self.settle_fill(incoming, head_id, head_user, head_price, traded, ledger, commands);
        commands.push(PwCommand::Update { order_id: head_id, quantity: new_book_quantity, price: None });

        MatchOutcome::Filled
    }

    fn check_market_bid_assets(
        &self,
        user: UserId,
        qty: Decimal,
        price: Decimal,
        ledger: &dyn BalanceLedger,
    ) -> bool {
        let required = with_commission(qty * price, self.commission);
        ledger.get_balance(user, self.pair.quote).active() >= required
    }

    /// Applies the four-leg balance movement of one fill (spec §4.4 "Fill
    /// balance movements") and emits the matching `MatchTransaction` row set.
    fn settle_fill(
        &self,
        incoming: &Order,
        resting_id: OrderId,
        resting_user: UserId,
        traded_price: Decimal,
        traded_qty: Decimal,
        ledger: &dyn BalanceLedger,
        commands: &mut Vec<PwCommand>,
    ) {
        let base = self.pair.base;
        let quote = self.pair.quote;
        let quote_amount = traded_price * traded_qty;

        let (buyer_user, buyer_order, seller_user, seller_order) = match incoming.side {
            Side::Bid => (incoming.user_id, incoming.order_id, resting_user, resting_id),
            Side::Ask => (resting_user, resting_id, incoming.user_id, incoming.order_id),
        };
        let incoming_is_market_bid = incoming.side == Side::Bid && incoming.order_type == OrderType::Market;

        let buyer_commission = if incoming_is_market_bid {
            commission_amount(traded_qty, traded_price, self.commission)
        } else {
            Decimal::ZERO
        };

        // Spec §7 "Ledger inconsistency ... -> logged": a failed leg here
        // means the freeze/credit bookkeeping upstream is wrong (conservation,
        // invariant 1, is already broken by the time we'd notice). Swallowing
        // the error silently would mint or destroy money with no trace, so
        // every leg is logged on failure instead of discarded.
        if incoming_is_market_bid {
            log_leg_failure(
                "buyer debit (market bid, not pre-frozen)",
                buyer_user,
                quote,
                ledger.with_balance(buyer_user, quote, |b| b.debit_active(with_commission(quote_amount, self.commission))),
            );
        } else {
            log_leg_failure(
                "buyer spend-frozen",
                buyer_user,
                quote,
                ledger.with_balance(buyer_user, quote, |b| b.spend_frozen(quote_amount)),
            );
        }
        log_leg_failure("buyer credit", buyer_user, base, ledger.with_balance(buyer_user, base, |b| b.credit_active(traded_qty)));
        log_leg_failure(
            "seller spend-frozen",
            seller_user,
            base,
            ledger.with_balance(seller_user, base, |b| b.spend_frozen(traded_qty)),
        );
        log_leg_failure(
            "seller credit",
            seller_user,
            quote,
            ledger.with_balance(seller_user, quote, |b| b.credit_active(quote_amount)),
        );

        let rows = [
            LedgerRow {
                user_id: buyer_user,
                order_id: buyer_order,
                category: LedgerCategory::Match,
                amount: quote_amount,
                commission_amount: buyer_commission,
                tx_type: TxType::Reduction,
                currency: quote,
            },
            LedgerRow {
                user_id: buyer_user,
                order_id: buyer_order,
                category: LedgerCategory::Match,
                amount: traded_qty,
                commission_amount: Decimal::ZERO,
                tx_type: TxType::Incoming,
                currency: base,
            },
            LedgerRow {
                user_id: seller_user,
                order_id: seller_order,
                category: LedgerCategory::Match,
                amount: traded_qty,
                commission_amount: Decimal::ZERO,
                tx_type: TxType::Reduction,
                currency: base,
            },
            LedgerRow {
                user_id: seller_user,
                order_id: seller_order,
                category: LedgerCategory::Match,
                amount: quote_amount,
                commission_amount: Decimal::ZERO,
                tx_type: TxType::Incoming,
                currency: quote,
            },
        ];
        commands.push(PwCommand::MatchTransaction { rows });
    }

    /// Cancels `order_id`. A missing blob means the order is already closed
    /// (spec §8 invariant 6: idempotent no-op).
    pub fn cancel_order(&mut self, order_id: OrderId, ledger: &dyn BalanceLedger) -> Vec<PwCommand> {
        let mut commands = Vec::new();
        let Some(blob) = ledger.get_blob(order_id) else {
            tracing::info!(order_id, "cancel for an already-closed or unknown order: no-op");
            return commands;
        };

        if blob.at_book {
            if let Some((side, price)) = self.index.get(&order_id).copied() {
                self.remove_from_ladder(side, price, order_id);
            }
        } else {
            ledger.mark_cancelled(order_id);
        }

        let market_bid = blob.order_type == OrderType::Market && blob.side == Side::Bid;
        if !market_bid {
            self.refund_cancel(&blob, ledger);
            commands.push(PwCommand::CancelTransaction { row: self.cancel_ledger_row(&blob) });
        }

        commands.push(PwCommand::Cancel { order_id });
        ledger.delete_blob(order_id);
        commands
    }

    /// Refunds the frozen portion of a cancelled order (spec §4.1 "Refund
    /// policy"): full commission back only if quantity was never changed.
    fn refund_cancel(&self, blob: &OrderBlob, ledger: &dyn BalanceLedger) {
        refund_cancel(self.pair, self.commission, blob, ledger)
    }

    /// The `cancel_bet` ledger row (spec §4.2): commission is logged as
    /// forgone only for a partially-filled cancel, zero otherwise.
    fn cancel_ledger_row(&self, blob: &OrderBlob) -> LedgerRow {
        cancel_ledger_row(self.pair, self.commission, blob)
    }

    /// Pre-flight check for an amendment (spec §4.4 "Edit"): does releasing
    /// the old freeze and re-freezing the new requirement still fit the
    /// user's active balance?
    fn can_handle(&self, old: &OrderBlob, new_price: Decimal, new_quantity: Decimal, ledger: &dyn BalanceLedger) -> bool {
        if old.side == Side::Bid && old.order_type == OrderType::Market {
            return true;
        }
        let (currency, old_required, new_required) = match old.side {
            Side::Bid => (
                self.pair.quote,
                with_commission(old.quantity * old.price, self.commission),
                with_commission(new_quantity * new_price, self.commission),
            ),
            Side::Ask => (
                self.pair.base,
                with_commission(old.quantity, self.commission),
                with_commission(new_quantity, self.commission),
            ),
        };
        let current_active = ledger.get_balance(old.user_id, currency).active();
        current_active + old_required >= new_required
    }

    /// Executes an amendment as cancel (status `edited`) then create (spec
    /// §4.4 "Edit"). Dropped in place if [`can_handle`] fails.
    pub fn edit_order(&mut self, amendment: Amendment, ledger: &dyn BalanceLedger) -> Vec<PwCommand> {
        let mut commands = Vec::new();
        let Some(old_blob) = ledger.get_blob(amendment.order_id) else {
            return commands;
        };

        let new_price = if amendment.price.is_zero() { old_blob.price } else { amendment.price };
        let new_quantity = if amendment.quantity.is_zero() { old_blob.quantity } else { amendment.quantity };

        if !self.can_handle(&old_blob, new_price, new_quantity, ledger) {
            return commands;
        }

        if old_blob.at_book {
            if let Some((side, price)) = self.index.get(&amendment.order_id).copied() {
                self.remove_from_ladder(side, price, amendment.order_id);
            }
        } else {
            ledger.mark_cancelled(amendment.order_id);
        }
        self.refund_cancel(&old_blob, ledger);
        ledger.delete_blob(amendment.order_id);
        commands.push(PwCommand::Edit { order_id: amendment.order_id });

        let new_order_type = if old_blob.order_type == OrderType::Market && !amendment.price.is_zero() {
            OrderType::Limit
        } else {
            old_blob.order_type
        };

        let replacement = Order {
            order_id: amendment.new_order_id,
            user_id: old_blob.user_id,
            pair: old_blob.pair,
            side: old_blob.side,
            order_type: new_order_type,
            price: new_price,
            quantity: new_quantity,
            initial_quantity: new_quantity,
            timestamp: amendment.timestamp,
            status: OrderStatus::Pending,
        };

        let needs_freeze = !(replacement.side == Side::Bid && replacement.order_type == OrderType::Market);
        if needs_freeze {
            if self.freeze_for_create(&replacement, ledger).is_err() {
                return commands;
            }
            commands.push(PwCommand::Freeze { row: self.freeze_ledger_row(&replacement) });
        }

        ledger.put_blob(replacement.order_id, OrderBlob::from(&replacement));
        commands.extend(self.process_new_order(replacement, ledger));
        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::InMemoryLedger;
    use crate::money::Currency;

    fn pair() -> Pair {
        Pair::new(Currency::Btc, Currency::Eth)
    }

    fn book() -> OrderBook {
        OrderBook::new(pair(), Decimal::new(2, 3), Decimal::new(1, 1))
    }

    fn limit_order(id: OrderId, user: UserId, side: Side, price: i64, qty: i64, ts: Timestamp) -> Order {
        Order {
            order_id: id,
            user_id: user,
            pair: pair(),
            side,
            order_type: OrderType::Limit,
            price: Decimal::new(price, 0),
            quantity: Decimal::new(qty, 0),
            initial_quantity: Decimal::new(qty, 0),
            timestamp: ts,
            status: OrderStatus::Pending,
        }
    }

    fn seed_and_freeze(ledger: &InMemoryLedger, book: &OrderBook, order: &Order) {
        match order.side {
            Side::Bid => ledger.seed_active(order.user_id, pair().quote, Decimal::new(1_000_000, 0)),
            Side::Ask => ledger.seed_active(order.user_id, pair().base, Decimal::new(1_000_000, 0)),
        }
        book.freeze_for_create(order, ledger).unwrap();
    }

    #[test]
    fn resting_limit_order_appears_at_best_price() {
        let ledger = InMemoryLedger::new();
        let mut book = book();
        let order = limit_order(1, 1, Side::Bid, 100, 10, 100);
        seed_and_freeze(&ledger, &book, &order);

        let commands = book.process_new_order(order, &ledger);
        assert!(commands.is_empty());
        assert_eq!(book.best_bid(), Some(Decimal::new(100, 0)));
        assert_eq!(book.best_ask(), None);
    }

    #[test]
    fn limit_cross_exact_fill_closes_both_sides() {
        let ledger = InMemoryLedger::new();
        let mut book = book();

        let ask = limit_order(1, 10, Side::Ask, 6500, 3, 100);
        seed_and_freeze(&ledger, &book, &ask);
        book.process_new_order(ask, &ledger);

        let bid = limit_order(2, 20, Side::Bid, 6500, 3, 200);
        seed_and_freeze(&ledger, &book, &bid);
        let commands = book.process_new_order(bid, &ledger);

        assert_eq!(book.depth(), (0, 0));
        assert!(commands.iter().any(|c| matches!(c, PwCommand::MatchTransaction { .. })));

        assert_eq!(ledger.get_balance(10, Currency::Eth).active(), Decimal::new(1_000_000 + 3 * 6500, 0));
        assert_eq!(ledger.get_balance(20, Currency::Btc).active(), Decimal::new(1_000_000 + 3, 0));
    }

    #[test]
    fn limit_partial_fill_preserves_head_timestamp() {
        let ledger = InMemoryLedger::new();
        let mut book = book();

        let ask = limit_order(1, 10, Side::Ask, 100, 5, 100);
        seed_and_freeze(&ledger, &book, &ask);
        book.process_new_order(ask, &ledger);

        let bid = limit_order(2, 20, Side::Bid, 100, 2, 200);
        seed_and_freeze(&ledger, &book, &bid);
        book.process_new_order(bid, &ledger);

        let level = book.asks.get(&Decimal::new(100, 0)).unwrap();
        assert_eq!(level.len(), 1);
        let head = level.front().unwrap();
        assert_eq!(head.order_id, 1);
        assert_eq!(head.quantity, Decimal::new(3, 0));
        assert_eq!(head.timestamp, 100);
    }

    #[test]
    fn price_time_priority_is_fifo_within_a_level() {
        let ledger = InMemoryLedger::new();
        let mut book = book();

        let ask1 = limit_order(1, 10, Side::Ask, 100, 2, 100);
        seed_and_freeze(&ledger, &book, &ask1);
        book.process_new_order(ask1, &ledger);

        let ask2 = limit_order(2, 11, Side::Ask, 100, 2, 101);
        seed_and_freeze(&ledger, &book, &ask2);
        book.process_new_order(ask2, &ledger);

        let bid = limit_order(3, 20, Side::Bid, 100, 2, 200);
        seed_and_freeze(&ledger, &book, &bid);
        book.process_new_order(bid, &ledger);

        let level = book.asks.get(&Decimal::new(100, 0)).unwrap();
        assert_eq!(level.len(), 1);
        assert_eq!(level.front().unwrap().order_id, 2);
    }

    #[test]
    fn cancel_resting_order_refunds_and_empties_level() {
        let ledger = InMemoryLedger::new();
        let mut book = book();

        let bid = limit_order(1, 10, Side::Bid, 100, 4, 100);
        seed_and_freeze(&ledger, &book, &bid);
        book.process_new_order(bid, &ledger);

        let before = ledger.get_balance(10, Currency::Eth).active();
        let commands = book.cancel_order(1, &ledger);

        assert!(commands.iter().any(|c| matches!(c, PwCommand::Cancel { order_id: 1 })));
        assert_eq!(book.best_bid(), None);
        assert!(ledger.get_balance(10, Currency::Eth).active() > before);
    }

    #[test]
    fn partial_fill_updates_blob_quantity_so_cancel_refunds_only_the_remainder() {
        let ledger = InMemoryLedger::new();
        let mut book = book();

        let ask = limit_order(1, 10, Side::Ask, 100, 5, 100);
        seed_and_freeze(&ledger, &book, &ask);
        book.process_new_order(ask, &ledger);

        let bid = limit_order(2, 20, Side::Bid, 100, 2, 200);
        seed_and_freeze(&ledger, &book, &bid);
        book.process_new_order(bid, &ledger);

        // The resting ask kept 3 of its original 5 units; its blob must
        // reflect that, not the stale initial quantity.
        let blob = ledger.get_blob(1).expect("partially filled order keeps its blob");
        assert_eq!(blob.quantity, Decimal::new(3, 0));

        let before = ledger.get_balance(10, Currency::Btc).active();
        let commands = book.cancel_order(1, &ledger);
        assert!(commands.iter().any(|c| matches!(c, PwCommand::Cancel { order_id: 1 })));

        // Only the remaining 3 units are refunded from frozen BTC, not the
        // full 5 the order started with.
        let after = ledger.get_balance(10, Currency::Btc).active();
        assert_eq!(after - before, Decimal::new(3, 0));
    }

    #[test]
    fn cancel_is_idempotent_for_already_closed_order() {
        let ledger = InMemoryLedger::new();
        let mut book = book();
        assert!(book.cancel_order(999, &ledger).is_empty());
    }

    #[test]
    fn market_bid_stops_matching_on_insufficient_funds() {
        let ledger = InMemoryLedger::new();
        let mut book = book();

        let ask1 = limit_order(1, 10, Side::Ask, 10, 2, 100);
        seed_and_freeze(&ledger, &book, &ask1);
        book.process_new_order(ask1, &ledger);

        let ask2 = limit_order(2, 11, Side::Ask, 20, 2, 101);
        seed_and_freeze(&ledger, &book, &ask2);
        book.process_new_order(ask2, &ledger);

        let buyer = 20;
        ledger.seed_active(buyer, Currency::Eth, Decimal::new(25, 0));
        let market_bid = Order {
            order_id: 3,
            user_id: buyer,
            pair: pair(),
            side: Side::Bid,
            order_type: OrderType::Market,
            price: Decimal::ZERO,
            quantity: Decimal::new(4, 0),
            initial_quantity: Decimal::new(4, 0),
            timestamp: 200,
            status: OrderStatus::Pending,
        };

        let commands = book.process_new_order(market_bid, &ledger);

        assert!(commands.iter().any(|c| matches!(c, PwCommand::Cancel { order_id: 3 })));
        assert_eq!(book.depth(), (0, 1));
        assert!(ledger.get_blob(3).is_none());
    }

    #[test]
    fn edit_order_replaces_price_and_refreezes() {
        let ledger = InMemoryLedger::new();
        let mut book = book();

        let bid = limit_order(1, 10, Side::Bid, 10, 4, 100);
        seed_and_freeze(&ledger, &book, &bid);
        book.process_new_order(bid, &ledger);

        let amendment = Amendment { order_id: 1, new_order_id: 2, price: Decimal::new(12, 0), quantity: Decimal::ZERO, timestamp: 300 };
        let commands = book.edit_order(amendment, &ledger);

        assert!(commands.iter().any(|c| matches!(c, PwCommand::Edit { order_id: 1 })));
        assert!(book.index.get(&1).is_none());
        assert_eq!(book.best_bid(), Some(Decimal::new(12, 0)));
        assert!(ledger.get_blob(2).is_some());
        assert!(ledger.get_blob(1).is_none());
    }

    #[test]
    fn cancel_not_yet_booked_marks_cancelled_and_refunds_without_touching_ladder() {
        let ledger = InMemoryLedger::new();
        let book = book();

        let bid = limit_order(1, 10, Side::Bid, 100, 4, 100);
        ledger.seed_active(10, pair().quote, Decimal::new(1_000_000, 0));
        book.freeze_for_create(&bid, &ledger).unwrap();
        ledger.put_blob(1, OrderBlob::from(&bid));

        let before = ledger.get_balance(10, Currency::Eth).active();
        let commands = cancel_not_yet_booked(pair(), book.commission, 1, &ledger);

        assert!(ledger.was_cancelled(1));
        assert!(ledger.get_blob(1).is_none());
        assert!(ledger.get_balance(10, Currency::Eth).active() > before);
        assert!(commands.iter().any(|c| matches!(c, PwCommand::Cancel { order_id: 1 })));
        assert!(commands.iter().any(|c| matches!(c, PwCommand::CancelTransaction { .. })));

        // OB later pops the still-queued creation message, sees the mark, discards silently.
        let mut book = book;
        let popped = book.process_new_order(bid, &ledger);
        assert!(popped.is_empty());
        assert!(!ledger.was_cancelled(1));
    }

    #[test]
    fn cancel_not_yet_booked_defers_to_normal_path_once_resting() {
        let ledger = InMemoryLedger::new();
        let mut book = book();

        let bid = limit_order(1, 10, Side::Bid, 100, 4, 100);
        seed_and_freeze(&ledger, &book, &bid);
        book.process_new_order(bid, &ledger);

        assert!(cancel_not_yet_booked(pair(), book.commission, 1, &ledger).is_empty());
        assert!(book.index.contains_key(&1));
    }

    #[test]
    fn human_readable_dump_lists_resting_orders() {
        let ledger = InMemoryLedger::new();
        let mut book = book();
        let bid = limit_order(1, 10, Side::Bid, 100, 4, 100);
        seed_and_freeze(&ledger, &book, &bid);
        book.process_new_order(bid, &ledger);

        let dump = book.dump_human_readable();
        assert!(dump.contains("BTC_ETH"));
        assert!(dump.contains("#1"));
        assert!(dump.contains("price 100"));
    }
}
