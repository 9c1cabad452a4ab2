//! ProxyWhirl daemon - Entry Point
//!
//! Loads the proxy pool, keeps it health-checked and persisted, and shuts
//! down gracefully on Ctrl+C or SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use proxywhirl::config::LogConfig;
use proxywhirl::proxy::health::{HealthChecker, HealthCheckerHandle};
use proxywhirl::proxy::transport::{ConnectTransport, Transport};
use proxywhirl::repository::{JsonFileRepository, ProxyRepository};
use proxywhirl::services::{MaintenanceHandle, MaintenanceService};
use proxywhirl::{Config, ProxyWhirl};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;
    init_tracing(&config.log);

    info!("Starting ProxyWhirl");
    info!("Using rotation strategy: {}", config.rotation.strategy.as_str());

    let transport: Arc<dyn Transport> = Arc::new(ConnectTransport::new(Duration::from_secs(
        config.healthcheck.timeout_secs,
    )));
    let engine = ProxyWhirl::new(&config, transport.clone());

    // Load stored proxies, then seed any configured ones
    let repository: Arc<dyn ProxyRepository> =
        Arc::new(JsonFileRepository::new(config.storage.path.clone()));
    match engine.load_from(repository.as_ref()).await {
        Ok(count) => info!("Loaded {} proxies from {}", count, config.storage.path.display()),
        Err(e) => error!("Failed to load stored proxies: {}", e),
    }
    for url in &config.pool.seed {
        if let Err(e) = engine.add_url(url) {
            warn!("Skipping seed proxy {}: {}", url, e);
        }
    }
    info!("Pool ready with {} proxies", engine.pool().len());

    // Start health checker
    let (health_handle, health_shutdown) = HealthCheckerHandle::new();
    let health_checker = HealthChecker::new(
        engine.pool().clone(),
        transport,
        config.health_checker_config(),
    );
    let health_task = tokio::spawn(async move {
        health_checker.run(health_shutdown).await;
    });

    // Start maintenance service
    let (maintenance_handle, maintenance_shutdown) = MaintenanceHandle::new();
    let maintenance = MaintenanceService::new(
        engine.pool().clone(),
        engine.sessions().clone(),
        engine.metrics().clone(),
        engine.breakers().clone(),
        repository,
        config.maintenance_config(),
    );
    let maintenance_task = tokio::spawn(async move {
        maintenance.run(maintenance_shutdown).await;
    });

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    health_handle.shutdown();
    maintenance_handle.shutdown();

    let (health_result, maintenance_result) = tokio::join!(health_task, maintenance_task);
    if let Err(e) = health_result {
        error!("Health checker task failed: {}", e);
    }
    if let Err(e) = maintenance_result {
        error!("Maintenance task failed: {}", e);
    }

    info!("ProxyWhirl stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("proxywhirl={}", log.level).into());
    let registry = tracing_subscriber::registry().with(filter);

    if log.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().pretty()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
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
