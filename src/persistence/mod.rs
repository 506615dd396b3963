//! The Persistence Writer (PW) subsystem: single-writer command consumer,
//! relational order/ledger-row store, and dump-on-failure (spec §4.2).

pub mod dump;
pub mod writer;

pub use dump::{dump_queue, DumpEntry};
pub use writer::PersistenceWriter;

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// Opens the Postgres pool the Persistence Writer and boot-recovery loader
/// share. A thin wrapper over `PgPoolOptions` — there is exactly one
/// connection concern in this crate (no read replicas, no sharding), so a
/// dedicated `Database` type earns its keep only as the recovery-loader's
/// home in `db::mod`, not here.
pub async fn connect(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}
