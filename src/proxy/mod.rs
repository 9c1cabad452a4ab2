//! Proxy rotation engine
//!
//! This module provides the engine functionality including:
//! - The concurrent proxy pool
//! - Multiple proxy rotation strategies
//! - Per-proxy circuit breakers
//! - Session affinity
//! - Retry coordination across proxies
//! - Transport and health checking

pub mod circuit_breaker;
pub mod health;
pub mod pool;
pub mod retry;
pub mod rotation;
pub mod session;
pub mod transport;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerEvent, CircuitBreakerRegistry,
    CircuitState,
};
pub use health::{HealthChecker, HealthCheckerConfig, HealthCheckerHandle};
pub use pool::{PoolStats, ProxyPool};
pub use retry::{
    BackoffStrategy, ExecuteOutcome, MetricsConfig, RetryCoordinator, RetryMetrics, RetryPolicy,
};
pub use rotation::{
    create_selector, PerformanceTier, ProxySelector, RotationStrategy, SelectionContext, Selector,
};
pub use session::{SessionConfig, SessionManager};
pub use transport::{ConnectTransport, ProxyRequest, Transport, TransportError, TransportResponse};

/// Convert a std duration for timestamp arithmetic, saturating at a century
pub(crate) fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
