use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use live_ingest::api::health::HealthState;
use live_ingest::api::latency::LatencyStats;
use live_ingest::api::routes::{router, ApiState};
use live_ingest::config::Config;
use live_ingest::db::Store;
use live_ingest::driver::PipelineDriver;
use live_ingest::error::Result;
use live_ingest::fetch::{CircuitBreaker, HttpSource, ResilientClient};
use live_ingest::proxy::{identity_source_from_config, ProxyPool};

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
    // --- Database setup ---
    let store = Store::connect(&cfg.db_path).await?;
    info!("Database ready at {}", cfg.db_path);

    // --- Egress identities ---
    if cfg.proxy.proxy_list.is_empty() && cfg.proxy.proxy_file.is_none() {
        warn!("PROXY_LIST and PROXY_FILE not set, all requests go out on the direct connection");
    }
    let source = identity_source_from_config(&cfg.proxy);
    let pool = ProxyPool::init(cfg.proxy.clone(), source).await?;

    // --- Fetch stack ---
    let breaker = Arc::new(CircuitBreaker::new(cfg.breaker.clone()));
    let latency = Arc::new(LatencyStats::new());
    let http = Arc::new(HttpSource::new(cfg.api_base_url.clone(), cfg.fetch.timeout));
    let client = Arc::new(ResilientClient::new(
        cfg.fetch.clone(),
        Arc::clone(&pool),
        Arc::clone(&breaker),
        http.clone(),
        http,
        Arc::clone(&latency),
    ));
    let health = Arc::new(HealthState::new());

    // --- Pipeline driver ---
    let driver = PipelineDriver::new(
        cfg.driver.clone(),
        cfg.cadence.clone(),
        client,
        store.clone(),
        Arc::clone(&health),
    );
    tokio::spawn(async move { driver.run().await });

    // --- HTTP API server ---
    let api_state = ApiState {
        store,
        health,
        latency,
        breaker,
        pool,
    };
    let app = router(api_state);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    tokio::select! {
        served = axum::serve(listener, app) => served?,
        _ = tokio::signal::ctrl_c() => info!("Shutdown requested, stopping ingest"),
    }

    Ok(())
}
