//! Dispersal Relayer - multi-chain native gas dispersal from a pre-funded treasury
//!
//! Verified deposits become intents whose per-chain legs are paid out
//! concurrently from treasury contracts on every destination chain.

use anyhow::Result;
use dispersal_relayer::api;
use dispersal_relayer::config::Settings;
use dispersal_relayer::metrics::MetricsServer;
use dispersal_relayer::service::DispersalService;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting Dispersal Relayer v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;
    info!(
        instance = %settings.service.instance_id,
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    let service = Arc::new(DispersalService::build(&settings).await?);
    info!("Service graph assembled");

    if let Err(e) = service.check_connectivity().await {
        warn!("Starting degraded: {}", e);
    }

    let health_handle = service.rpc.clone().spawn_health_monitor();

    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let service = service.clone();
        async move {
            if let Err(e) = api::run_server(config, service).await {
                error!("API server error: {}", e);
            }
        }
    });

    info!("Dispersal Relayer is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Dispersal Relayer stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,dispersal_relayer=debug,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
