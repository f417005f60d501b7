use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

mod app;
mod collab_http;
mod error;
mod http;
mod state;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conduit_gateway=info,tower_http=debug".into()),
        )
        .init();

    // load config: explicit path > CONDUIT_CONFIG env > ~/.conduit/conduit.toml
    let config_path = std::env::var("CONDUIT_CONFIG").ok();
    let config = conduit_core::config::Config::load(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("config load failed ({e}), using defaults");
        conduit_core::config::Config::default()
    });

    let bind = config.server.bind.clone();
    let port = config.server.port;
    let shutdown_grace = Duration::from_secs(config.server.shutdown_grace_secs);

    let state = Arc::new(state::AppState::new(config)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let maintenance_config: conduit_scheduler::MaintenanceConfig = (&state.config.scheduler).into();
    let maintenance_handles = state.runtime_handles();
    let maintenance_jobs = conduit_scheduler::maintenance::spawn(
        maintenance_handles,
        maintenance_config,
        Arc::new(conduit_scheduler::NoopHooks),
        Arc::new(conduit_scheduler::NoopHooks),
        shutdown_rx,
    );

    let router = app::build_router(state.clone());

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!("conduit gateway listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(wait_for_ctrl_c())
        .await?;

    info!("shutdown signal received, draining in-flight streams");
    let _ = shutdown_tx.send(true);
    for job in maintenance_jobs {
        let _ = tokio::time::timeout(shutdown_grace, job).await;
    }
    conduit_runtime::background::wait_for_drain(&state.background, shutdown_grace).await;

    Ok(())
}

async fn wait_for_ctrl_c() {
    let _ = tokio::signal::ctrl_c().await;
}
