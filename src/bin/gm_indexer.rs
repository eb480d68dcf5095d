//! GM Indexer - keeps the local event store in sync with the greeting contract
//!
//! Usage:
//!   cargo run --release --bin gm_indexer            # poll until CTRL+C
//!   cargo run --release --bin gm_indexer -- --once  # one catch-up pass, then exit
//!
//! Configuration is read from the environment (and `.env`), see
//! `GmflowConfig::from_env`.

use dotenv::dotenv;
use gmflow::chain::JsonRpcLogSource;
use gmflow::config::GmflowConfig;
use gmflow::indexer::Indexer;
use gmflow::scheduler::run_indexer_loop;
use gmflow::store::SqliteEventStore;
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let once = std::env::args().skip(1).any(|arg| arg == "--once");
    let config = GmflowConfig::from_env()?;

    info!("🚀 GM Indexer");
    info!("   ├─ Contract: {}", config.indexer.contract_address);
    info!("   ├─ Event: {}", config.indexer.event_signature);
    info!("   ├─ Start block: {}", config.indexer.start_block);
    info!("   ├─ Window size: {} blocks", config.indexer.window_size);
    info!("   ├─ Database: {}", config.db_path);
    info!("   └─ Mode: {}", if once { "single pass" } else { "polling" });

    info!("🔧 Opening event store...");
    let store = Arc::new(SqliteEventStore::open(&config.db_path)?);
    info!("✅ Event store ready");

    let source = Arc::new(JsonRpcLogSource::new(
        &config.rpc_url,
        &config.indexer.contract_address,
        &config.indexer.last_seen_function,
        Duration::from_millis(config.indexer.retry.timeout_ms),
    )?);

    let indexer = Arc::new(Indexer::new(source, store, config.indexer.clone()));
    info!("✅ Indexer created (owner {})", indexer.owner_id());

    if once {
        let report = indexer.sync().await?;
        info!(
            "✅ Sync complete: {} window(s), {} logs, {} new events, cursor at {} (head {})",
            report.windows_committed,
            report.logs_fetched,
            report.events_inserted,
            report.cursor,
            report.target_height
        );
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let loop_handle = tokio::spawn(run_indexer_loop(
        indexer.clone(),
        config.poll_interval_ms,
        cancel.clone(),
    ));

    info!("🔄 Press CTRL+C to shutdown gracefully");
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("⚠️  Received CTRL+C, finishing current window..."),
        Err(err) => error!("❌ Failed to listen for CTRL+C: {}", err),
    }
    cancel.cancel();

    match loop_handle.await {
        Ok(stats) => info!("✅ Indexer stopped after {} sync(s)", stats.ticks),
        Err(e) => error!("❌ Indexer loop panicked: {}", e),
    }
    Ok(())
}
