//! Maintenance service
//!
//! Periodically drops expired proxies and sessions, prunes metrics past their
//! retention window, forgets breakers of proxies that left the pool and saves
//! the pool through the repository.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, instrument};

use crate::error::Result;
use crate::proxy::circuit_breaker::CircuitBreakerRegistry;
use crate::proxy::pool::ProxyPool;
use crate::proxy::retry::RetryMetrics;
use crate::proxy::session::SessionManager;
use crate::repository::ProxyRepository;

/// Maintenance service configuration
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// How often expired state is swept
    pub sweep_interval: Duration,
    /// How often the pool is persisted
    pub save_interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            save_interval: Duration::from_secs(300),
        }
    }
}

/// What one sweep removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired_proxies: usize,
    pub expired_sessions: usize,
    pub pruned_metrics: usize,
    pub orphaned_breakers: usize,
}

/// Maintenance service
pub struct MaintenanceService {
    pool: Arc<ProxyPool>,
    sessions: Arc<SessionManager>,
    metrics: Arc<RetryMetrics>,
    breakers: Arc<CircuitBreakerRegistry>,
    repository: Arc<dyn ProxyRepository>,
    config: MaintenanceConfig,
}

impl MaintenanceService {
    pub fn new(
        pool: Arc<ProxyPool>,
        sessions: Arc<SessionManager>,
        metrics: Arc<RetryMetrics>,
        breakers: Arc<CircuitBreakerRegistry>,
        repository: Arc<dyn ProxyRepository>,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            pool,
            sessions,
            metrics,
            breakers,
            repository,
            config,
        }
    }

    /// Run the maintenance service; saves once more on shutdown
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting maintenance service (sweep: {}s, save: {}s)",
            self.config.sweep_interval.as_secs(),
            self.config.save_interval.as_secs()
        );

        let mut sweep_ticker = interval(self.config.sweep_interval);
        let mut save_ticker = interval(self.config.save_interval);
        sweep_ticker.tick().await; // Skip immediate tick
        save_ticker.tick().await;

        loop {
            tokio::select! {
                _ = sweep_ticker.tick() => {
                    self.sweep();
                }
                _ = save_ticker.tick() => {
                    if let Err(e) = self.save().await {
                        error!("Periodic save failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Maintenance service shutting down");
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.save().await {
            error!("Final save failed: {}", e);
        }
    }

    /// Remove expired and orphaned state
    pub fn sweep(&self) -> MaintenanceReport {
        let expired_proxies = self.pool.clear_expired();
        let expired_sessions = self.sessions.cleanup_expired();
        let pruned_metrics = self.metrics.prune();

        let mut orphaned_breakers = 0;
        for state in self.breakers.states() {
            if !self.pool.contains(&state.proxy_id) && self.breakers.remove(&state.proxy_id) {
                orphaned_breakers += 1;
            }
        }

        let report = MaintenanceReport {
            expired_proxies,
            expired_sessions,
            pruned_metrics,
            orphaned_breakers,
        };
        if report == MaintenanceReport::default() {
            debug!("Maintenance sweep found nothing to remove");
        } else {
            info!(
                expired_proxies,
                expired_sessions, pruned_metrics, orphaned_breakers, "Maintenance sweep complete"
            );
        }
        report
    }

    /// Persist the current pool; returns the number of proxies saved
    pub async fn save(&self) -> Result<usize> {
        let proxies = self.pool.all();
        self.repository.save(&proxies).await?;
        debug!("Saved {} proxies", proxies.len());
        Ok(proxies.len())
    }
}

/// Handle for managing the maintenance service
pub struct MaintenanceHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl MaintenanceHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
