//! The Intake Queue (IQ): a thread-safe priority min-heap sitting between
//! the socket acceptor and the Order Book (spec §4.3).
//!
//! Grounded on `original_source/heapq_with_removal.py`'s `HeapQueue`: a
//! stdlib `heapq` behind a `Lock` plus a `not_empty` condition, blocking
//! `get()` and non-blocking `put()`. Reimplemented with
//! `std::sync::{Mutex, Condvar}` and `BinaryHeap<Reverse<QueueItem>>`
//! (a max-heap inverted into a min-heap via `Reverse`, same trick the
//! Python source gets from negating priorities).
//!
//! `HeapQueue.delete()` (arbitrary mid-heap removal) is not ported: it is
//! dead code in the source, and the one case it existed for — discarding
//! an order that gets cancelled before the book ever sees it — is already
//! handled by the BL cancelled-set check in `orderbook::process_new_order`.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex};

use crate::core_types::{Order, OrderId, OrderType, Timestamp};
use crate::orderbook::Amendment;

/// STOP sentinel: always popped first, regardless of what else is queued.
pub const CLASS_STOP: u8 = 0;
/// Cancellations jump ahead of any order still waiting to be matched.
pub const CLASS_CANCEL: u8 = 1;
/// Edits are cancel-then-create; the cancel half needs the same priority.
pub const CLASS_EDIT: u8 = 2;
pub const CLASS_MARKET: u8 = 3;
pub const CLASS_LIMIT: u8 = 4;

/// One unit of work the Order Book dispatches (spec §4.3: "class 0=STOP,
/// 1=cancel, 2=edit, 3=market, 4=limit").
#[derive(Debug, Clone)]
pub enum IntakeCommand {
    NewOrder(Order),
    Cancel { order_id: OrderId },
    Edit(Amendment),
    Stop,
}

impl IntakeCommand {
    fn class_priority(&self) -> u8 {
        match self {
            IntakeCommand::Stop => CLASS_STOP,
            IntakeCommand::Cancel { .. } => CLASS_CANCEL,
            IntakeCommand::Edit(_) => CLASS_EDIT,
            IntakeCommand::NewOrder(order) if order.order_type == OrderType::Market => CLASS_MARKET,
            IntakeCommand::NewOrder(_) => CLASS_LIMIT,
        }
    }
}

#[derive(Debug, Clone)]
struct QueueItem {
    class: u8,
    timestamp: Timestamp,
    command: IntakeCommand,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        (self.class, self.timestamp) == (other.class, other.timestamp)
    }
}

impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.class, self.timestamp).cmp(&(other.class, other.timestamp))
    }
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<Reverse<QueueItem>>,
}

pub struct IntakeQueue {
    inner: Mutex<Inner>,
    not_empty: Condvar,
}

impl Default for IntakeQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl IntakeQueue {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()), not_empty: Condvar::new() }
    }

    /// Enqueues `command` at `timestamp`. STOP always forces its timestamp
    /// to the maximum value — with exactly one STOP outstanding at a time
    /// this only matters as documentation of intent, matching the source's
    /// `timestamp = 2000000000` convention.
    pub fn put(&self, timestamp: Timestamp, command: IntakeCommand) {
        let class = command.class_priority();
        let timestamp = if class == CLASS_STOP { Timestamp::MAX } else { timestamp };
        let mut inner = self.inner.lock().expect("intake queue poisoned");
        inner.heap.push(Reverse(QueueItem { class, timestamp, command }));
        self.not_empty.notify_one();
    }

    /// Blocks until a command is available, then returns the
    /// highest-priority, earliest one queued.
    pub fn get(&self) -> IntakeCommand {
        let mut inner = self.inner.lock().expect("intake queue poisoned");
        loop {
            if let Some(Reverse(item)) = inner.heap.pop() {
                return item.command;
            }
            inner = self.not_empty.wait(inner).expect("intake queue poisoned");
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("intake queue poisoned").heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::{OrderStatus, Side};
    use crate::money::{Currency, Pair};
    use rust_decimal::Decimal;

    fn pair() -> Pair {
        Pair::new(Currency::Btc, Currency::Eth)
    }

    fn limit_order(id: OrderId, ts: Timestamp) -> Order {
        Order {
            order_id: id,
            user_id: 1,
            pair: pair(),
            side: Side::Bid,
            order_type: OrderType::Limit,
            price: Decimal::new(100, 0),
            quantity: Decimal::new(1, 0),
            initial_quantity: Decimal::new(1, 0),
            timestamp: ts,
            status: OrderStatus::Pending,
        }
    }

    #[test]
    fn higher_priority_class_beats_earlier_timestamp() {
        let queue = IntakeQueue::new();
        queue.put(100, IntakeCommand::NewOrder(limit_order(1, 100)));
        queue.put(200, IntakeCommand::Cancel { order_id: 1 });

        match queue.get() {
            IntakeCommand::Cancel { order_id } => assert_eq!(order_id, 1),
            other => panic!("expected cancel first, got {other:?}"),
        }
    }

    #[test]
    fn same_class_is_fifo_by_timestamp() {
        let queue = IntakeQueue::new();
        queue.put(200, IntakeCommand::NewOrder(limit_order(2, 200)));
        queue.put(100, IntakeCommand::NewOrder(limit_order(1, 100)));

        match queue.get() {
            IntakeCommand::NewOrder(order) => assert_eq!(order.order_id, 1),
            other => panic!("expected order 1 first, got {other:?}"),
        }
    }

    #[test]
    fn stop_always_pops_first() {
        let queue = IntakeQueue::new();
        queue.put(1, IntakeCommand::NewOrder(limit_order(1, 1)));
        queue.put(2, IntakeCommand::Cancel { order_id: 9 });
        queue.put(0, IntakeCommand::Stop);

        assert!(matches!(queue.get(), IntakeCommand::Stop));
    }

    #[test]
    fn get_blocks_until_put_wakes_it() {
        use std::sync::Arc;
        use std::time::Duration;

        let queue = Arc::new(IntakeQueue::new());
        let reader = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.get())
        };

        std::thread::sleep(Duration::from_millis(50));
        queue.put(1, IntakeCommand::Cancel { order_id: 42 });

        let command = reader.join().expect("reader thread panicked");
        assert!(matches!(command, IntakeCommand::Cancel { order_id: 42 }));
    }
}
