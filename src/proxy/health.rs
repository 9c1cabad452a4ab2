//! Health checking for upstream proxies
//!
//! Periodically checks proxy availability and updates health status.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};

use crate::error::Result;
use crate::models::{HealthStatus, Proxy};
use crate::proxy::pool::ProxyPool;
use crate::proxy::transport::{ProxyRequest, Transport};

/// Health checker configuration
#[derive(Debug, Clone)]
pub struct HealthCheckerConfig {
    /// Interval between health checks
    pub check_interval: Duration,
    /// Timeout for each health check
    pub check_timeout: Duration,
    /// URL to use for health checks
    pub check_url: String,
    /// Proxies checked concurrently
    pub workers: usize,
}

impl Default for HealthCheckerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            check_timeout: Duration::from_secs(10),
            check_url: "http://www.google.com".to_string(),
            workers: 20,
        }
    }
}

/// Counts from one health check round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub checked: usize,
    pub healthy: usize,
    pub unhealthy: usize,
}

/// Health checker for upstream proxies
pub struct HealthChecker {
    pool: Arc<ProxyPool>,
    transport: Arc<dyn Transport>,
    config: HealthCheckerConfig,
}

impl HealthChecker {
    /// Create a new health checker
    pub fn new(
        pool: Arc<ProxyPool>,
        transport: Arc<dyn Transport>,
        config: HealthCheckerConfig,
    ) -> Self {
        Self {
            pool,
            transport,
            config,
        }
    }

    /// Run the health checker (call in a spawned task)
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting health checker with {}s interval",
            self.config.check_interval.as_secs()
        );

        let mut check_interval = interval(self.config.check_interval);

        loop {
            tokio::select! {
                _ = check_interval.tick() => {
                    if let Err(e) = self.check_all_proxies().await {
                        error!("Health check round failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Health checker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Check every proxy in the pool once and record the outcomes
    pub async fn check_all_proxies(&self) -> Result<HealthReport> {
        // Include unhealthy proxies so they can recover when they become reachable again
        let proxies = self.pool.all();
        if proxies.is_empty() {
            debug!("No proxies to check");
            return Ok(HealthReport::default());
        }

        let request = ProxyRequest::get(&self.config.check_url)?;
        info!("Checking health of {} proxies", proxies.len());

        let worker_count = self.config.workers.max(1);
        let results = futures::stream::iter(proxies)
            .map(|proxy| {
                let request = &request;
                async move {
                    let (is_healthy, error_msg) = self.check_proxy(&proxy, request).await;
                    let recorded = if is_healthy {
                        Ok(HealthStatus::Healthy)
                    } else {
                        self.pool.record_failure(proxy.id(), error_msg.as_deref())
                    };
                    if let Err(e) = recorded {
                        // Removed while the check was running
                        debug!(proxy_id = %proxy.id(), "Health result not recorded: {}", e);
                    }
                    is_healthy
                }
            })
            .buffer_unordered(worker_count)
            .collect::<Vec<bool>>()
            .await;

        let healthy = results.iter().filter(|&&v| v).count();
        let report = HealthReport {
            checked: results.len(),
            healthy,
            unhealthy: results.len().saturating_sub(healthy),
        };

        info!(
            "Health check complete: {} healthy, {} unhealthy",
            report.healthy, report.unhealthy
        );

        Ok(report)
    }

    /// Check a single proxy's health
    /// Returns (is_healthy, optional_error_message)
    #[instrument(skip(self, request), fields(proxy_id = %proxy.id(), proxy_address = %proxy.address()))]
    async fn check_proxy(&self, proxy: &Proxy, request: &ProxyRequest) -> (bool, Option<String>) {
        let result =
            tokio::time::timeout(self.config.check_timeout, self.transport.send(proxy, request))
                .await;

        match result {
            Ok(Ok(response)) if response.status < 500 => {
                debug!(
                    "Proxy {} is healthy (status {} in {:.0}ms)",
                    proxy.address(),
                    response.status,
                    response.latency_ms
                );
                if let Err(e) = self.pool.record_success(proxy.id(), response.latency_ms) {
                    debug!(proxy_id = %proxy.id(), "Health result not recorded: {}", e);
                }
                (true, None)
            }
            Ok(Ok(response)) => {
                let msg = format!("health check returned HTTP {}", response.status);
                warn!("Proxy {} is unhealthy: {}", proxy.address(), msg);
                (false, Some(msg))
            }
            Ok(Err(e)) => {
                let msg = e.to_string();
                warn!("Proxy {} is unhealthy: {}", proxy.address(), msg);
                (false, Some(msg))
            }
            Err(_) => {
                let msg = "health check timed out".to_string();
                warn!("Proxy {} is unhealthy: {}", proxy.address(), msg);
                (false, Some(msg))
            }
        }
    }
}

/// Guard for managing health checker lifecycle
pub struct HealthCheckerHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl HealthCheckerHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
