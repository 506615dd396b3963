//! Wires the four subsystems into one running per-pair process (spec §2
//! "System Overview", §5 "Concurrency & Resource Model").
//!
//! Grounded on the teacher's `main.rs` boot-sequence shape (numbered
//! stages, load -> construct -> run) generalized from a one-shot CSV batch
//! replay into a long-running socket server, and on
//! `original_source/order_book.py`'s `OrderBook.run`/
//! `run_helper_processes` for the actor wiring itself: one thread owns the
//! ladders and drives matching (OB), a second thread accepts one
//! stream-socket connection at a time and feeds the Intake Queue, and a
//! `tokio` task plays the role of the Persistence Writer's separate
//! process — see `persistence::writer` for why a task stands in for a
//! literal second OS process here.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedSender};

use crate::balance::{BalanceLedger, InMemoryLedger};
use crate::config::EngineConfig;
use crate::core_types::{Order, OrderId, OrderType, Side, Timestamp};
use crate::intake_queue::{IntakeCommand, IntakeQueue};
use crate::money::Pair;
use crate::orderbook::{self, Amendment, OrderBlob, OrderBook};
use crate::persistence::{self, PersistenceWriter};
use crate::db;
use crate::pw_command::PwCommand;
use crate::wire::{self, IntakeMessage};

/// Runs one engine instance to completion: boots, serves intake until
/// shutdown, and returns once the Order Book thread has torn itself down.
/// Caller owns logging setup (`main.rs` does this before calling in).
pub async fn run(config: EngineConfig) -> anyhow::Result<()> {
    tracing::info!(pair = %config.pair, port = config.socket_port, "booting engine instance");

    let pool = persistence::connect(&config.database_url).await?;
    db::health_check(&pool).await?;

    let ledger: Arc<dyn BalanceLedger> = Arc::new(InMemoryLedger::new());

    let resting = db::load_resting_orders(&pool, config.pair).await?;
    let mut book = OrderBook::new(config.pair, config.commission, config.default_residue_price);
    book.fill_book(resting, ledger.as_ref());

    let (pw_tx, pw_rx) = mpsc::unbounded_channel::<PwCommand>();
    let writer = PersistenceWriter::new(pool, config.pair, config.dump_dir.clone(), Arc::clone(&ledger));
    let pw_handle = tokio::spawn(writer.run(pw_rx));

    let queue = Arc::new(IntakeQueue::new());
    let shutting_down = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let next_edit_id = Arc::new(AtomicU64::new(config.edit_id_floor));

    let listener = TcpListener::bind(("127.0.0.1", config.socket_port))?;
    let acceptor_ctx = AcceptorCtx {
        pair: config.pair,
        commission: config.commission,
        ledger: Arc::clone(&ledger),
        queue: Arc::clone(&queue),
        pw_tx: pw_tx.clone(),
        next_edit_id,
    };
    let acceptor_shutting_down = Arc::clone(&shutting_down);
    let acceptor_handle = std::thread::spawn(move || run_acceptor(listener, acceptor_ctx, acceptor_shutting_down));

    let ob_ledger = Arc::clone(&ledger);
    let ob_queue = Arc::clone(&queue);
    let ob_dump_dir = config.dump_dir.clone();
    let ob_port = config.socket_port;
    let ob_shutting_down = Arc::clone(&shutting_down);
    let ob_handle = std::thread::spawn(move || {
        run_order_book_loop(book, ob_ledger, ob_queue, pw_tx, ob_port, ob_dump_dir, ob_shutting_down)
    });

    tokio::task::spawn_blocking(move || ob_handle.join().expect("order book thread panicked")).await?;
    tokio::task::spawn_blocking(move || acceptor_handle.join().expect("acceptor thread panicked")).await?;

    match pw_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(%err, "persistence writer exited with an error"),
        Err(join_err) => tracing::error!(%join_err, "persistence writer task panicked"),
    }

    tracing::info!(pair = %config.pair, "engine instance stopped");
    Ok(())
}

struct AcceptorCtx {
    pair: Pair,
    commission: rust_decimal::Decimal,
    ledger: Arc<dyn BalanceLedger>,
    queue: Arc<IntakeQueue>,
    pw_tx: UnboundedSender<PwCommand>,
    next_edit_id: Arc<AtomicU64>,
}

/// The intake acceptor (spec §4.3, §5.1): one connection at a time, one
/// JSON message per connection. Blocks on `accept()` between connections,
/// the only suspension point besides the Intake Queue's own `put`.
fn run_acceptor(listener: TcpListener, ctx: AcceptorCtx, shutting_down: Arc<std::sync::atomic::AtomicBool>) {
    loop {
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(err) => {
                tracing::warn!(%err, "intake accept() failed");
                if shutting_down.load(Ordering::SeqCst) {
                    return;
                }
                continue;
            }
        };

        if shutting_down.load(Ordering::SeqCst) {
            return;
        }

        match read_one_message(stream) {
            Ok(bytes) => match wire::parse_message(&bytes, ctx.pair) {
                Ok(message) => {
                    let is_stop = matches!(message, IntakeMessage::Stop);
                    dispatch(message, &ctx);
                    if is_stop {
                        return;
                    }
                }
                Err(err) => tracing::warn!(%err, "rejected malformed intake message"),
            },
            Err(err) => tracing::warn!(%err, "intake socket read failed"),
        }
    }
}

fn read_one_message(mut stream: TcpStream) -> std::io::Result<Vec<u8>> {
    let mut buf = [0u8; wire::MAX_MESSAGE_BYTES];
    let n = stream.read(&mut buf)?;
    Ok(buf[..n].to_vec())
}

/// Turns a parsed wire message into Intake Queue traffic — or, for a
/// cancel that beats its order's creation message into the queue,
/// resolves it immediately against the Balance Ledger with no Intake
/// Queue round trip at all (spec §4.3 "cancel-before-seen optimisation").
fn dispatch(message: IntakeMessage, ctx: &AcceptorCtx) {
    match message {
        IntakeMessage::Stop => ctx.queue.put(Timestamp::MAX, IntakeCommand::Stop),
        IntakeMessage::NewOrder(order) => dispatch_new_order(order, ctx),
        IntakeMessage::Cancel { order_id, timestamp } => match ctx.ledger.get_blob(order_id) {
            Some(blob) if blob.at_book => {
                ctx.queue.put(timestamp, IntakeCommand::Cancel { order_id });
            }
            Some(_) => {
                let commands = orderbook::cancel_not_yet_booked(ctx.pair, ctx.commission, order_id, ctx.ledger.as_ref());
                for command in commands {
                    let _ = ctx.pw_tx.send(command);
                }
            }
            None => {
                tracing::info!(order_id, "cancel for an already-closed or unknown order: no-op");
            }
        },
        IntakeMessage::Edit(edit) => {
            let new_order_id: OrderId = ctx.next_edit_id.fetch_add(1, Ordering::SeqCst);
            let amendment = Amendment {
                order_id: edit.former_order_id,
                new_order_id,
                price: edit.price,
                quantity: edit.quantity,
                timestamp: edit.timestamp,
            };
            ctx.queue.put(edit.timestamp, IntakeCommand::Edit(amendment));
        }
    }
}

/// Applies the at-create freeze policy (spec §4.1) and writes the order's
/// blob before it is even enqueued, then hands it to the Intake Queue —
/// this is the "submitter -> BL -> socket -> IQ" leg of the data flow in
/// spec §2: freeze happens between intake and the book, never inside
/// `OrderBook` itself. A market bid is exempt from freezing (its
/// affordability check is deferred to each matching step) but still gets a
/// blob, since [`orderbook::cancel_not_yet_booked`] and the cancelled-set
/// check in `OrderBook::process_new_order` both key off the blob's
/// existence. Insufficient funds at create (spec §7 "Validation...
/// rejected at intake; never reaches OB") drops the order with no side
/// effect and no Intake Queue entry.
fn dispatch_new_order(order: Order, ctx: &AcceptorCtx) {
    if let Err(err) = orderbook::freeze_for_create(ctx.pair, ctx.commission, &order, ctx.ledger.as_ref()) {
        tracing::info!(order_id = order.order_id, %err, "rejected new order: insufficient funds");
        return;
    }

    let mut blob = OrderBlob::from(&order);
    blob.at_book = false;
    ctx.ledger.put_blob(order.order_id, blob);

    let market_bid = order.side == Side::Bid && order.order_type == OrderType::Market;
    if !market_bid {
        let row = orderbook::freeze_ledger_row(ctx.pair, ctx.commission, &order);
        let _ = ctx.pw_tx.send(PwCommand::Freeze { row });
    }

    let timestamp = order.timestamp;
    ctx.queue.put(timestamp, IntakeCommand::NewOrder(order));
}

/// The Order Book's single-threaded main loop (spec §4.4 "Main loop").
fn run_order_book_loop(
    mut book: OrderBook,
    ledger: Arc<dyn BalanceLedger>,
    queue: Arc<IntakeQueue>,
    pw_tx: UnboundedSender<PwCommand>,
    socket_port: u16,
    dump_dir: PathBuf,
    shutting_down: Arc<std::sync::atomic::AtomicBool>,
) {
    ledger.set_running(true);

    loop {
        let commands = match queue.get() {
            IntakeCommand::Stop => {
                shutdown(&book, &ledger, &pw_tx, socket_port, &dump_dir, &shutting_down);
                return;
            }
            IntakeCommand::NewOrder(order) => book.process_new_order(order, ledger.as_ref()),
            IntakeCommand::Cancel { order_id } => book.cancel_order(order_id, ledger.as_ref()),
            IntakeCommand::Edit(amendment) => book.edit_order(amendment, ledger.as_ref()),
        };

        for command in commands {
            if pw_tx.send(command).is_err() {
                tracing::error!("persistence writer channel closed unexpectedly; halting");
                ledger.set_halted();
            }
        }

        if ledger.halted() {
            shutdown(&book, &ledger, &pw_tx, socket_port, &dump_dir, &shutting_down);
            return;
        }
    }
}

/// Orderly teardown (spec §4.5): forward `stop` to PW, clear the running
/// flag, write the human-readable book dump, and unblock the acceptor's
/// `accept()` — needed whether or not an external STOP message is what
/// triggered this (a PW-originated halt has no STOP in flight yet).
fn shutdown(
    book: &OrderBook,
    ledger: &Arc<dyn BalanceLedger>,
    pw_tx: &UnboundedSender<PwCommand>,
    socket_port: u16,
    dump_dir: &Path,
    shutting_down: &Arc<std::sync::atomic::AtomicBool>,
) {
    tracing::info!(pair = %book.pair(), "order book shutting down");
    shutting_down.store(true, Ordering::SeqCst);
    let _ = pw_tx.send(PwCommand::Stop);
    ledger.set_running(false);

    if let Err(err) = write_book_dump(book, dump_dir) {
        tracing::error!(%err, "failed to write book dump on shutdown");
    }

    unblock_acceptor(socket_port);
}

fn write_book_dump(book: &OrderBook, dump_dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dump_dir)?;
    let path = dump_dir.join(format!("{}_book_dump.log", book.pair()));
    std::fs::write(path, book.dump_human_readable())
}

fn unblock_acceptor(socket_port: u16) {
    if let Ok(mut stream) = TcpStream::connect(("127.0.0.1", socket_port)) {
        let _ = stream.write_all(b"STOP");
    }
}
