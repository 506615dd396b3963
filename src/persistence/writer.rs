//! The Persistence Writer (PW): single-writer consumer of `PwCommand`s,
//! applying each as one transaction against Postgres (spec §4.2).
//!
//! Modeled as a dedicated tokio task rather than a literal second OS
//! process (spec §5.1): PW's whole job is waiting on database I/O, which a
//! task already expresses without inventing an IPC transport this crate
//! has no other use for.
//!
//! Queries use `sqlx::query` (runtime-checked) rather than the
//! `query!`/`query_as!` macros `account/repository.rs` uses — those macros
//! need either a live database or a committed `sqlx-data.json` at build
//! time, neither of which this exercise can produce. `db/mod.rs`'s
//! `health_check`/`load_user_vip_levels` already show the runtime-checked
//! style as a load-bearing precedent in this codebase, not a deviation
//! from it.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::balance::BalanceLedger;
use crate::core_types::OrderId;
use crate::errors::PwError;
use crate::money::Pair;
use crate::persistence::dump::{dump_queue, DumpEntry};
use crate::pw_command::{LedgerCategory, LedgerRow, PwCommand, TxType};

pub struct PersistenceWriter {
    pool: PgPool,
    pair: Pair,
    dump_dir: PathBuf,
    ledger: Arc<dyn BalanceLedger>,
}

impl PersistenceWriter {
    pub fn new(pool: PgPool, pair: Pair, dump_dir: PathBuf, ledger: Arc<dyn BalanceLedger>) -> Self {
        Self { pool, pair, dump_dir, ledger }
    }

    /// Drains `rx` until a clean `Stop` or until the backend fails. On
    /// failure, halts the shared ledger and dumps the failed command plus
    /// everything still queued behind it (spec §4.2 "dump on failure").
    pub async fn run(self, mut rx: UnboundedReceiver<PwCommand>) -> anyhow::Result<()> {
        while let Some(command) = rx.recv().await {
            if matches!(command, PwCommand::Stop) {
                tracing::info!(pair = %self.pair, "persistence writer received stop");
                return Ok(());
            }

            if let Err(err) = self.apply(&command).await {
                tracing::error!(pair = %self.pair, %err, "persistence writer halting: backend failure");
                self.ledger.set_halted();
                self.drain_and_dump(command, rx).await?;
                return Err(err.into());
            }
        }
        Ok(())
    }

    async fn drain_and_dump(&self, failed: PwCommand, mut rx: UnboundedReceiver<PwCommand>) -> Result<(), PwError> {
        let mut entries = vec![DumpEntry { command: failed, fallen: true }];
        while let Ok(command) = rx.try_recv() {
            if matches!(command, PwCommand::Stop) {
                break;
            }
            entries.push(DumpEntry { command, fallen: false });
        }
        let count = entries.len();
        dump_queue(&self.dump_dir, self.pair, &entries)?;
        tracing::warn!(pair = %self.pair, count, "dumped unprocessed commands to disk");
        Ok(())
    }

    async fn apply(&self, command: &PwCommand) -> Result<(), PwError> {
        let mut tx = self.pool.begin().await?;
        match command {
            PwCommand::Update { order_id, quantity, price } => {
                Self::apply_update(&mut tx, *order_id, *quantity, *price).await?
            }
            PwCommand::Cancel { order_id } => Self::apply_close(&mut tx, *order_id, "cancelled").await?,
            PwCommand::Edit { order_id } => Self::apply_close(&mut tx, *order_id, "edited").await?,
            PwCommand::Freeze { row } => Self::insert_ledger_row(&mut tx, row).await?,
            PwCommand::CancelTransaction { row } => Self::insert_ledger_row(&mut tx, row).await?,
            PwCommand::MatchTransaction { rows } => {
                for row in rows {
                    Self::insert_ledger_row(&mut tx, row).await?;
                }
            }
            PwCommand::Stop => unreachable!("Stop is handled by the caller before reaching apply()"),
        }
        tx.commit().await?;
        Ok(())
    }

    async fn apply_update(
        tx: &mut Transaction<'_, Postgres>,
        order_id: OrderId,
        quantity: Decimal,
        price: Option<Decimal>,
    ) -> Result<(), sqlx::Error> {
        let order_id = order_id as i64;
        let now = Utc::now();
        if quantity.is_zero() {
            sqlx::query(
                "UPDATE orders SET status = 'completed', quantity = 0, \
                 price = COALESCE($2, price), closed_at = $3 WHERE id = $1",
            )
            .bind(order_id)
            .bind(price)
            .bind(now)
            .execute(&mut **tx)
            .await?;
        } else {
            sqlx::query("UPDATE orders SET quantity = $2, price = COALESCE($3, price) WHERE id = $1")
                .bind(order_id)
                .bind(quantity)
                .bind(price)
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }

    async fn apply_close(tx: &mut Transaction<'_, Postgres>, order_id: OrderId, status: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE orders SET status = $2, closed_at = $3 WHERE id = $1")
            .bind(order_id as i64)
            .bind(status)
            .bind(Utc::now())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn insert_ledger_row(tx: &mut Transaction<'_, Postgres>, row: &LedgerRow) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO ledger_transactions \
             (user_id, order_id, category, amount, commission_amount, tx_type, currency, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(row.user_id as i64)
        .bind(row.order_id as i64)
        .bind(category_str(row.category))
        .bind(row.amount)
        .bind(row.commission_amount)
        .bind(tx_type_str(row.tx_type))
        .bind(row.currency.to_string())
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

fn category_str(category: LedgerCategory) -> &'static str {
    match category {
        LedgerCategory::Freeze => "freeze",
        LedgerCategory::Match => "match",
        LedgerCategory::CancelBet => "cancel_bet",
    }
}

fn tx_type_str(tx_type: TxType) -> &'static str {
    match tx_type {
        TxType::Incoming => "incoming",
        TxType::Reduction => "reduction",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Exercises PW against a real Postgres instance; opt-in via
    /// `DATABASE_URL` since CI has no database available by default.
    #[ignore]
    #[tokio::test]
    async fn applies_a_match_transaction_against_a_live_database() {
        let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for this test");
        let pool = crate::persistence::connect(&database_url).await.unwrap();
        let ledger: Arc<dyn BalanceLedger> = Arc::new(crate::balance::InMemoryLedger::new());
        let pair = Pair::new(crate::money::Currency::Btc, crate::money::Currency::Eth);
        let writer = PersistenceWriter::new(pool, pair, PathBuf::from("/tmp"), ledger);

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tx.send(PwCommand::Cancel { order_id: 1 }).unwrap();
        tx.send(PwCommand::Stop).unwrap();
        drop(tx);

        writer.run(rx).await.unwrap();
    }
}
