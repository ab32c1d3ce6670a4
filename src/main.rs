// proxy-audit: a per-node audit pipeline for a proxy server's text log
// files. Tails the access and error logs, parses each line, filters
// noise, batches events into SQLite, and publishes realtime aggregates
// to Redis. The read-side query API, auth, the AI summary worker and
// GeoIP enrichment are external collaborators out of scope for this
// binary.

mod cli;

use clap::Parser;
use cli::Cli;
use proxy_audit::collector::Collector;
use proxy_audit::config::Settings;
use proxy_audit::storage::StateStore;
use proxy_audit::{logging, startup};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli::handle_cli(cli).is_some() {
        return Ok(());
    }

    logging::init();
    Settings::ensure_config_exists();
    let settings = Settings::from_env();

    startup::print_startup(&settings);

    let store = StateStore::open(&settings.db_path)?;
    let mut collector = Collector::new(settings, store).await?;
    let stop = collector.stop_signal();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested, draining in-flight batch");
            stop.stop();
        }
    });

    collector.run().await?;
    tracing::info!("shutdown complete");
    Ok(())
}
