//! Engine process entry point: one instance per trading pair (spec §6.3
//! "CLI / process surface").
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌──────────┐    ┌──────────┐
//! │  Config  │───▶│ Recovery │───▶│  Intake  │───▶│  Order   │
//! │  (YAML)  │    │   (PG)   │    │  Socket  │    │   Book   │
//! └──────────┘    └──────────┘    └──────────┘    └──────────┘
//! ```

use zero_x_infinity::config::EngineConfig;
use zero_x_infinity::{engine_runtime, logging};

fn config_path() -> String {
    std::env::args().nth(1).unwrap_or_else(|| "config.yaml".to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::load(config_path())?;
    let _log_guard = logging::init_logging(&config);
    engine_runtime::run(config).await
}
