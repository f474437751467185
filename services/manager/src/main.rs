//! infravisor lifecycle manager
//!
//! Serves the control API and supervises one maintenance worker per managed
//! infrastructure. On Ctrl+C the HTTP server stops first, then every worker
//! is detached; provisioned infrastructures are left running.

use std::sync::Arc;

use anyhow::Result;
use infravisor_manager::{
    api, config,
    default_info_router,
    lifecycle::{LifecycleManager, ManagerContext},
    state::AppState,
};
use infravisor_reconcile::SimulatedProcessorFactory;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to INFRAVISOR_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting infravisor lifecycle manager");
    info!(
        listen_addr = %config.listen_addr,
        reconcile_interval_secs = config.reconcile_interval.as_secs(),
        detach_timeout_secs = config.detach_timeout.as_secs(),
        strategy = %config.process_strategy,
        "Configuration loaded"
    );

    let ctx = ManagerContext::in_memory(Arc::new(SimulatedProcessorFactory::default()));
    let info_router = default_info_router(&ctx);
    let manager = Arc::new(LifecycleManager::new(ctx, config.worker_settings()));

    let state = AppState::new(Arc::clone(&manager), Arc::new(info_router));
    let app = api::create_router(state);

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    // Spawn the server with graceful shutdown
    let mut server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
                info!("HTTP server shutting down");
            })
            .await
    });

    // Wait for shutdown signal (Ctrl+C)
    let server_finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            false
        }
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
            true
        }
    };

    // Stop accepting requests before stopping workers
    let _ = shutdown_tx.send(true);
    if !server_finished {
        if let Err(e) = tokio::time::timeout(config.shutdown_timeout, server_handle).await {
            warn!(error = %e, "HTTP server did not shut down in time");
        }
    }

    info!("Detaching all maintenance workers...");
    let reports = manager.shutdown(config.shutdown_timeout).await;
    let escalated = reports.iter().filter(|r| r.escalated()).count();
    if escalated > 0 {
        warn!(escalated, "Some maintenance workers had to be killed");
    }

    info!(detached = reports.len(), "Lifecycle manager shutdown complete");
    Ok(())
}
