//! Treasury Relayer - keeps treasury transfers moving until they are mined
//!
//! This relayer sends transfers from a set of managed accounts on multiple
//! chains, bumps fees of stuck transactions and cancels the ones that never
//! make it.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

mod api;
mod chain;
mod config;
mod error;
mod events;
mod lifecycle;
mod metrics;
mod state;
mod tx;

use chain::ChainManager;
use config::Settings;
use metrics::MetricsServer;
use state::{PgRequestRepository, RequestMediator};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Treasury Relayer v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    // Load signing keys
    let raw_keys = std::env::var(&settings.wallet.private_keys_env).with_context(|| {
        format!(
            "Private keys not set, expected them in {}",
            settings.wallet.private_keys_env
        )
    })?;
    let wallets = chain::provider::parse_private_keys(&raw_keys)?;
    if wallets.is_empty() {
        anyhow::bail!("No private keys in {}", settings.wallet.private_keys_env);
    }
    info!("Managing {} wallets", wallets.len());

    // Initialize database connection
    let repository = Arc::new(PgRequestRepository::new(&settings.database).await?);
    info!("Database connection established");

    // Run migrations
    repository.run_migrations().await?;

    // Initialize metrics server
    let metrics_server = if settings.metrics.enabled {
        Some(MetricsServer::new(settings.metrics.port))
    } else {
        None
    };

    // Initialize chain manager (handles all chain connections)
    let chain_manager = Arc::new(ChainManager::new(&settings, &wallets).await?);
    info!("Chain connections initialized");

    let mediator = Arc::new(RequestMediator::new(
        chain_manager.managers(),
        repository.clone(),
    ));

    // Start API server
    let api_handle = tokio::spawn({
        let api_config = settings.api.clone();
        let mediator = mediator.clone();
        async move {
            if let Err(e) = api::run_server(api_config, mediator).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = metrics_server.map(|server| {
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        })
    });

    // Start block watchers
    let watcher_handle = tokio::spawn({
        let chain_manager = chain_manager.clone();
        async move {
            if let Err(e) = chain_manager.start_watchers().await {
                error!("Block watcher error: {}", e);
            }
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let chain_manager = chain_manager.clone();
        let repository = repository.clone();
        let interval = settings.relayer.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                let health = chain_manager.health_check().await;
                let chains_ok = health.iter().all(|(_, healthy)| *healthy);
                for (chain_id, healthy) in health {
                    if !healthy {
                        warn!("Chain {} health check failed", chain_id);
                    }
                }

                let database_ok = match repository.health_check().await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Database health check failed: {}", e);
                        false
                    }
                };

                if chains_ok && database_ok {
                    metrics::record_health_check();
                } else {
                    metrics::record_health_check_failure();
                }
            }
        }
    });

    info!("Treasury Relayer is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    chain_manager.stop().await;
    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }
    if let Err(e) = watcher_handle.await {
        error!("Block watchers did not stop cleanly: {}", e);
    }

    info!("Treasury Relayer stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,treasury_relayer=debug,sqlx=warn,hyper=warn")
    });

    let json = std::env::var("RELAYER_LOG_FORMAT").is_ok_and(|format| format == "json");
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
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
            Ok(mut stream) => {
                stream.recv().await;
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
