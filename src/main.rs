// =============================================================================
// Aurora Arb Nexus — Main Entry Point
// =============================================================================
//
// Cross-exchange arbitrage execution engine. Pairs start in Paused; the
// operator connects venues and starts pairs through the control surface.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod config;
mod engine;
mod error;
mod gateway;
mod hub;
mod math;
mod metrics;
mod orchestrator;
mod rate_limit;
mod retry;
mod state_machine;
mod stats;
mod storage;
mod types;
mod vault;

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::ApiState;
use crate::config::AppConfig;
use crate::gateway::bybit::BybitAdapter;
use crate::gateway::VenueAdapter;
use crate::hub::{Hub, OriginPolicy};
use crate::metrics::Metrics;
use crate::orchestrator::Orchestrator;
use crate::stats::StatsAggregate;
use crate::storage::MemoryStore;
use crate::vault::Vault;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Aurora Arb Nexus — Starting Up                   ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // A bad vault key is fatal: nothing works without readable credentials.
    let config = AppConfig::from_env()?;
    let vault = Arc::new(Vault::new(&config.encryption_key)?);

    // ── 2. Build shared subsystems ───────────────────────────────────────
    let metrics = Arc::new(Metrics::new());
    let stats = Arc::new(StatsAggregate::new());
    // Standalone runs use the in-process store; the service deployment
    // injects its SQL-backed implementation here.
    let store = Arc::new(MemoryStore::new());

    let hub = Hub::new(metrics.clone());
    let hub_worker = hub.start();

    // ── 3. Orchestrator with the supported venue adapters ────────────────
    let orchestrator = Orchestrator::new(
        store,
        hub.clone(),
        vault,
        metrics,
        stats,
        Box::new(|name| match name {
            "bybit" => Some(Arc::new(BybitAdapter::new()) as Arc<dyn VenueAdapter>),
            _ => None,
        }),
    );
    orchestrator.start().await;

    // ── 4. API / WebSocket server ────────────────────────────────────────
    let api_state = Arc::new(ApiState {
        hub: hub.clone(),
        origins: OriginPolicy::from_config(&config.allowed_origins),
    });
    let app = api::router(api_state, &config.allowed_origins);
    let bind_addr = config.bind_addr.clone();
    let server = tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                warn!(addr = %bind_addr, error = %e, "failed to bind API server");
                return;
            }
        };
        info!(addr = %bind_addr, "API server listening");
        if let Err(e) = axum::serve(listener, app).await {
            warn!(error = %e, "API server stopped");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    orchestrator.shutdown().await;
    server.abort();
    hub_worker.abort();

    info!("Aurora Arb Nexus shut down complete.");
    Ok(())
}
