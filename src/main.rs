use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use p2p_relay::api::{router, ApiState, HealthState, LatencyStats};
use p2p_relay::broker::{AllowList, Broker};
use p2p_relay::cdp::CdpManager;
use p2p_relay::config::{Config, CHANNEL_CAPACITY, NORMALIZER_WINDOW_SECS};
use p2p_relay::db::{self, CredentialStore};
use p2p_relay::error::Result;
use p2p_relay::intercept::{ObservationTap, ReqwestTransport};
use p2p_relay::pipeline::{Normalizer, PageRelay};
use p2p_relay::state::OperationWindow;

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
    let pool = db::connect(&cfg.db_path).await?;
    info!("Database ready at {}", cfg.db_path);

    // --- Shared state ---
    let health = Arc::new(HealthState::new());
    let latency = Arc::new(LatencyStats::new());
    let window = OperationWindow::new(Duration::from_secs(NORMALIZER_WINDOW_SECS));

    // --- Channels ---
    let (obs_tx, obs_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (broker_tx, broker_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let tap = ObservationTap::new(obs_tx);

    // --- Spawn tasks ---

    // Broker: sole owner of the credential and the tab registry
    let allow_list = AllowList::new(&cfg.consumer_allowed_hosts);
    info!("[BROKER] consumer hosts: {}", allow_list.hosts().join(", "));
    let broker = Broker::new(
        broker_rx,
        CredentialStore::new(pool.clone()),
        allow_list.clone(),
        Arc::clone(&health),
        Arc::clone(&latency),
    )
    .await;
    tokio::spawn(async move { broker.run().await });

    // Page relay: token tracker + normalizer in front of the broker
    let relay = PageRelay::new(
        obs_rx,
        broker_tx.clone(),
        Normalizer::new(Arc::clone(&window)),
        Arc::clone(&health),
    );
    tokio::spawn(async move { relay.run().await });

    // DevTools attachment to the trading page
    match cfg.cdp_url.clone() {
        Some(cdp_url) => {
            let http = ReqwestTransport::new(Duration::from_secs(10))?;
            let manager = CdpManager::new(&cfg, cdp_url, http, tap.clone(), Arc::clone(&health));
            tokio::spawn(async move { manager.run().await });
        }
        None => {
            warn!("CDP_URL not set, page observation disabled. Only POST /ingest feeds the relay");
        }
    }

    // HTTP API server
    let api_state = ApiState {
        broker_tx,
        tap,
        window,
        health,
        latency,
        allow_list,
        next_tab: Arc::new(AtomicU64::new(1)),
    };
    let app = router(api_state);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
