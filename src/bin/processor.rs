//! Derived-record processor. Runs independently of the ingest binary and
//! shares only the database with it.

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use live_ingest::config::Config;
use live_ingest::db::Store;
use live_ingest::error::Result;
use live_ingest::processor::DerivedProcessor;
use live_ingest::scorer::{GameEventScorer, Scorer};

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    let store = Store::connect(&cfg.db_path).await?;
    info!("Database ready at {}", cfg.db_path);

    let scorer: Arc<dyn Scorer> = Arc::new(GameEventScorer::new());
    info!(
        model_version = scorer.model_version(),
        interval_secs = cfg.processor.interval.as_secs(),
        batch_size = cfg.processor.batch_size,
        reprocess = cfg.processor.reprocess,
        "[PROCESSOR] starting"
    );

    let processor = DerivedProcessor::new(store, scorer, cfg.processor.clone());
    tokio::select! {
        _ = processor.run() => {}
        _ = tokio::signal::ctrl_c() => info!("Shutdown requested, stopping processor"),
    }

    Ok(())
}
