//! A continuous double-auction order-matching engine for a single
//! trading pair: priority intake queue, price-time order book, balance
//! ledger, and asynchronous persistence writer.
//!
//! # Modules
//!
//! - [`core_types`] - `Order`, ids, `Side`/`OrderType`/`OrderStatus`
//! - [`money`] - `Currency`, `Pair`, strict decimal parsing
//! - [`config`] - per-pair process configuration
//! - [`errors`] - intake and persistence error types
//! - [`fee`] - commission calculation
//! - [`balance`] - the Balance Ledger (BL): active/frozen funds, blobs, cancelled-set
//! - [`orderbook`] - the Order Book (OB): ladders and the matching algorithm
//! - [`intake_queue`] - the Intake Queue (IQ): class/timestamp priority heap
//! - [`pw_command`] - commands emitted by OB for the Persistence Writer
//! - [`wire`] - the intake socket's JSON wire format
//! - [`db`] - boot-time recovery loader
//! - [`persistence`] - the Persistence Writer (PW) and dump-on-failure
//! - [`logging`] - `tracing` setup
//! - [`engine_runtime`] - wires the above into one running process

pub mod core_types;
pub mod money;

pub mod config;
pub mod errors;

pub mod balance;
pub mod fee;
pub mod intake_queue;
pub mod orderbook;
pub mod pw_command;
pub mod wire;

pub mod db;
pub mod persistence;

pub mod logging;

pub mod engine_runtime;

pub use balance::{Balance, BalanceLedger, InMemoryLedger};
pub use config::EngineConfig;
pub use core_types::{Order, OrderId, OrderStatus, OrderType, Side, Timestamp, UserId};
pub use money::{Currency, Pair};
pub use orderbook::OrderBook;
pub use pw_command::PwCommand;
