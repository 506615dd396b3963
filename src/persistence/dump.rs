//! Dump-on-failure: serializes the Persistence Writer's unprocessed commands
//! to a JSON file when the backend fails (spec §4.2, §6 "Dump files").
//!
//! Grounded on `wal.rs`'s `BufWriter<File>` + `create_dir_all(parent)`
//! idiom, adapted from an append-only log to a one-shot array write, and on
//! `original_source/db_writer.py`'s `dump_queue` — fallen entry first,
//! then every command still in the queue, each decimal a string.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use serde::Serialize;

use crate::money::Pair;
use crate::pw_command::PwCommand;

#[derive(Debug, Clone, Serialize)]
pub struct DumpEntry {
    #[serde(flatten)]
    pub command: PwCommand,
    /// `true` for the one command that was in flight when the backend
    /// failed; `false` for everything drained from behind it.
    pub fallen: bool,
}

/// Writes `entries` as a JSON array to `<dump_dir>/<pair>_dmp_q.json`,
/// creating `dump_dir` if needed.
pub fn dump_queue(dump_dir: &Path, pair: Pair, entries: &[DumpEntry]) -> std::io::Result<()> {
    std::fs::create_dir_all(dump_dir)?;
    let path = dump_dir.join(format!("{pair}_dmp_q.json"));
    let file = File::create(path)?;
    let writer = BufWriter::new(file);
    serde_json::to_writer(writer, entries)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Currency;
    use rust_decimal::Decimal;
    use tempfile::tempdir;

    #[test]
    fn dump_writes_fallen_entry_first() {
        let dir = tempdir().unwrap();
        let pair = Pair::new(Currency::Btc, Currency::Eth);

        let entries = vec![
            DumpEntry { command: PwCommand::Cancel { order_id: 1 }, fallen: true },
            DumpEntry { command: PwCommand::Update { order_id: 2, quantity: Decimal::ZERO, price: None }, fallen: false },
        ];
        dump_queue(dir.path(), pair, &entries).unwrap();

        let path = dir.path().join("BTC_ETH_dmp_q.json");
        let raw = std::fs::read_to_string(path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed[0]["fallen"], serde_json::json!(true));
        assert_eq!(parsed[0]["command"], serde_json::json!("cancel"));
        assert_eq!(parsed[1]["fallen"], serde_json::json!(false));
    }
}
