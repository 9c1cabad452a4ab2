//! The engine instance
//!
//! `ProxyWhirl` owns every shared component and is passed explicitly to the
//! hosting layer. The active rotation strategy sits behind an `ArcSwap` so it
//! can be replaced while requests are in flight: a request keeps the strategy
//! it started with, later requests see the new one.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::error::Result;
use crate::models::{NewProxy, Proxy};
use crate::proxy::circuit_breaker::{CircuitBreakerRegistry, CircuitBreakerSnapshot};
use crate::proxy::pool::{PoolStats, ProxyPool};
use crate::proxy::retry::{
    ExecuteOutcome, MetricsSnapshot, RetryCoordinator, RetryMetrics, RetryPolicy,
};
use crate::proxy::rotation::{
    create_selector, ProxySelector, RotationStrategy, SelectionContext, Selector,
};
use crate::proxy::session::SessionManager;
use crate::proxy::transport::{ProxyRequest, Transport};
use crate::repository::ProxyRepository;

/// Proxy rotation engine
pub struct ProxyWhirl {
    pool: Arc<ProxyPool>,
    breakers: Arc<CircuitBreakerRegistry>,
    sessions: Arc<SessionManager>,
    metrics: Arc<RetryMetrics>,
    selector: ArcSwap<Selector>,
    coordinator: RetryCoordinator,
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    allow_local: bool,
}

impl ProxyWhirl {
    /// Build an engine from configuration with `transport` for outbound requests
    pub fn new(config: &Config, transport: Arc<dyn Transport>) -> Self {
        let pool = Arc::new(match config.max_pool_size() {
            Some(max) => ProxyPool::with_max_size(max),
            None => ProxyPool::new(),
        });
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker_config()));
        let sessions = Arc::new(SessionManager::new(config.session_config()));
        let metrics = Arc::new(RetryMetrics::new(config.metrics_config()));

        let engine = Self::from_parts(
            pool,
            breakers,
            sessions,
            metrics,
            config.rotation.strategy,
            transport,
            config.retry_policy(),
        );
        Self {
            allow_local: config.pool.allow_local,
            ..engine
        }
    }

    /// Assemble an engine from existing components
    pub fn from_parts(
        pool: Arc<ProxyPool>,
        breakers: Arc<CircuitBreakerRegistry>,
        sessions: Arc<SessionManager>,
        metrics: Arc<RetryMetrics>,
        strategy: RotationStrategy,
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
    ) -> Self {
        let selector = ArcSwap::from_pointee(create_selector(strategy, sessions.clone()));
        let coordinator = RetryCoordinator::new(pool.clone(), breakers.clone(), metrics.clone());
        Self {
            pool,
            breakers,
            sessions,
            metrics,
            selector,
            coordinator,
            transport,
            policy,
            allow_local: false,
        }
    }

    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn metrics(&self) -> &Arc<RetryMetrics> {
        &self.metrics
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Policy used when a caller does not supply one
    pub fn default_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn strategy(&self) -> RotationStrategy {
        self.selector.load().kind()
    }

    /// Replace the rotation strategy; in-flight requests finish on the old one
    pub fn set_strategy(&self, strategy: RotationStrategy) {
        let previous = self.strategy();
        self.selector
            .store(Arc::new(create_selector(strategy, self.sessions.clone())));
        info!(
            from = previous.as_str(),
            to = strategy.as_str(),
            "Rotation strategy changed"
        );
    }

    /// Validate and add a proxy, returning its id
    pub fn add_proxy(&self, mut request: NewProxy) -> Result<String> {
        request.allow_local |= self.allow_local;
        let proxy = Proxy::new(request)?;
        let id = proxy.id().to_string();
        self.pool.add(proxy)?;
        Ok(id)
    }

    pub fn add_url(&self, url: &str) -> Result<String> {
        self.add_proxy(NewProxy::from_url(url))
    }

    /// Remove a proxy along with its breaker
    pub fn remove_proxy(&self, id: &str) -> bool {
        self.breakers.remove(id);
        self.pool.remove(id)
    }

    /// Pick a proxy with the active strategy without sending anything
    pub fn select(&self, context: &SelectionContext) -> Result<Proxy> {
        self.selector.load().select(&self.pool, context)
    }

    /// Run a logical request through the engine's transport
    pub async fn execute(
        &self,
        request: &ProxyRequest,
        policy: &RetryPolicy,
        context: SelectionContext,
        cancel: &CancellationToken,
    ) -> Result<ExecuteOutcome> {
        self.execute_via(self.transport.as_ref(), request, policy, context, cancel)
            .await
    }

    /// Run a logical request through a caller-supplied transport
    pub async fn execute_via(
        &self,
        transport: &dyn Transport,
        request: &ProxyRequest,
        policy: &RetryPolicy,
        context: SelectionContext,
        cancel: &CancellationToken,
    ) -> Result<ExecuteOutcome> {
        let selector = self.selector.load_full();
        let result = self
            .coordinator
            .execute(selector.as_ref(), transport, request, policy, context, cancel)
            .await;
        if let Err(e) = &result {
            if e.is_terminal() {
                warn!(attempts = e.attempts().unwrap_or(0), url = %request.url, "Request failed: {}", e);
            }
        }
        result
    }

    /// Force a proxy's breaker closed
    pub fn reset_breaker(&self, proxy_id: &str) -> bool {
        self.breakers.reset(proxy_id)
    }

    pub fn clear_unhealthy(&self) -> usize {
        let removed = self.pool.clear_unhealthy();
        self.forget_orphaned_breakers();
        removed
    }

    pub fn clear_expired(&self) -> usize {
        let removed = self.pool.clear_expired();
        self.forget_orphaned_breakers();
        removed
    }

    pub fn remove_session(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id)
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn breaker_states(&self) -> Vec<CircuitBreakerSnapshot> {
        self.breakers.states()
    }

    /// Seed the pool from a repository, returning how many proxies were added
    #[instrument(skip_all)]
    pub async fn load_from(&self, repository: &dyn ProxyRepository) -> Result<usize> {
        let proxies = repository.load().await?;
        let total = proxies.len();
        let added = self.pool.extend(proxies);
        info!("Loaded {} of {} stored proxies", added, total);
        Ok(added)
    }

    /// Persist the current pool, returning how many proxies were saved
    #[instrument(skip_all)]
    pub async fn save_to(&self, repository: &dyn ProxyRepository) -> Result<usize> {
        let proxies = self.pool.all();
        repository.save(&proxies).await?;
        Ok(proxies.len())
    }

    fn forget_orphaned_breakers(&self) {
        for state in self.breakers.states() {
            if !self.pool.contains(&state.proxy_id) {
                self.breakers.remove(&state.proxy_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio_test::{assert_err, assert_ok};

    use crate::error::ProxyWhirlError;
    use crate::proxy::circuit_breaker::CircuitState;
    use crate::proxy::transport::{TransportError, TransportResponse};
    use crate::repository::MemoryRepository;

    /// Answers 200 through every proxy except ids starting with "bad"
    struct StaticTransport;

    #[async_trait]
    impl Transport for StaticTransport {
        async fn send(
            &self,
            proxy: &Proxy,
            _request: &ProxyRequest,
        ) -> std::result::Result<TransportResponse, TransportError> {
            if proxy.id().starts_with("bad") {
                Err(TransportError::Connect("connection refused".to_string()))
            } else {
                Ok(TransportResponse {
                    status: 200,
                    latency_ms: 30.0,
                })
            }
        }
    }

    fn create_engine(config: &Config) -> ProxyWhirl {
        ProxyWhirl::new(config, Arc::new(StaticTransport))
    }

    fn create_test_proxy(id: &str, last_octet: u8) -> NewProxy {
        NewProxy {
            url: format!("http://203.0.113.{}:8080", last_octet),
            id: Some(id.to_string()),
            ..Default::default()
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(1),
            max_backoff_delay: Duration::from_millis(5),
            ..RetryPolicy::default()
        }
    }

    #[tokio::test]
    async fn test_execute_fails_over_bad_proxy() {
        let engine = create_engine(&Config::default());
        engine.add_proxy(create_test_proxy("bad-1", 1)).unwrap();
        engine.add_proxy(create_test_proxy("good-1", 2)).unwrap();

        let outcome = engine
            .execute(
                &ProxyRequest::get("http://example.com/").unwrap(),
                &fast_policy(),
                SelectionContext::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.proxy_id, "good-1");
        assert_eq!(outcome.attempts, 2);

        let stats = engine.stats();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.healthy_count, 1);
        assert_eq!(stats.total_requests, 2);
        assert_eq!(engine.metrics_snapshot().successful_requests, 1);
    }

    #[test]
    fn test_set_strategy_swaps_selector() {
        let engine = create_engine(&Config::default());
        assert_eq!(engine.strategy(), RotationStrategy::RoundRobin);

        engine.set_strategy(RotationStrategy::LeastUsed);
        assert_eq!(engine.strategy(), RotationStrategy::LeastUsed);

        engine.add_proxy(create_test_proxy("a", 1)).unwrap();
        engine.add_proxy(create_test_proxy("b", 2)).unwrap();
        engine.pool().record_success("a", 10.0).unwrap();
        assert_eq!(engine.select(&SelectionContext::new()).unwrap().id(), "b");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_strategy_swap_during_selection() {
        let engine = Arc::new(create_engine(&Config::default()));
        for i in 0..5u8 {
            engine
                .add_proxy(create_test_proxy(&format!("p{}", i), i + 1))
                .unwrap();
        }

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let engine = engine.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..200 {
                    assert!(engine.select(&SelectionContext::new()).is_ok());
                }
            }));
        }
        let swapper = {
            let engine = engine.clone();
            tokio::spawn(async move {
                for i in 0..50 {
                    let strategy = if i % 2 == 0 {
                        RotationStrategy::Random
                    } else {
                        RotationStrategy::PerformanceBased
                    };
                    engine.set_strategy(strategy);
                    tokio::task::yield_now().await;
                }
            })
        };

        for task in tasks {
            task.await.unwrap();
        }
        swapper.await.unwrap();
        assert_eq!(engine.strategy(), RotationStrategy::PerformanceBased);
    }

    #[test]
    fn test_add_proxy_honors_pool_config() {
        let mut config = Config::default();
        config.pool.max_size = 1;
        let engine = create_engine(&config);

        assert!(matches!(
            engine.add_url("http://127.0.0.1:8080"),
            Err(ProxyWhirlError::Validation(_))
        ));
        assert_ok!(engine.add_url("http://203.0.113.1:8080"));
        assert!(matches!(
            engine.add_url("http://203.0.113.2:8080"),
            Err(ProxyWhirlError::PoolFull { max_size: 1 })
        ));

        config.pool.allow_local = true;
        config.pool.max_size = 0;
        let local = create_engine(&config);
        assert_ok!(local.add_url("http://127.0.0.1:8080"));
        assert_ok!(local.add_proxy(create_test_proxy("dup", 9)));
        assert_err!(local.add_proxy(create_test_proxy("dup", 9)));
    }

    #[test]
    fn test_admin_operations() {
        let engine = create_engine(&Config::default());
        engine.add_proxy(create_test_proxy("a", 1)).unwrap();
        engine.add_proxy(create_test_proxy("b", 2)).unwrap();
        engine.pool().record_success("a", 10.0).unwrap();

        for _ in 0..5 {
            engine.breakers().record_failure("b");
        }
        assert_eq!(engine.breaker_states()[0].state, CircuitState::Open);
        assert!(engine.reset_breaker("b"));
        assert_eq!(engine.breaker_states()[0].state, CircuitState::Closed);

        let proxy = engine.pool().get_by_id("a").unwrap();
        engine
            .sessions()
            .create("s1", &proxy, Duration::from_secs(60));
        assert!(engine.remove_session("s1"));
        assert!(!engine.remove_session("s1"));

        // "b" was never measured, so it is not strictly healthy
        assert_eq!(engine.clear_unhealthy(), 1);
        assert!(engine.breakers().get("b").is_none());
        assert_eq!(engine.pool().len(), 1);
    }

    #[tokio::test]
    async fn test_load_and_save() {
        let engine = create_engine(&Config::default());
        engine.add_proxy(create_test_proxy("a", 1)).unwrap();
        engine.add_proxy(create_test_proxy("b", 2)).unwrap();

        let repository = MemoryRepository::new();
        assert_eq!(engine.save_to(&repository).await.unwrap(), 2);

        let restored = create_engine(&Config::default());
        assert_eq!(restored.load_from(&repository).await.unwrap(), 2);
        assert!(restored.pool().contains("a"));
        assert!(restored.pool().contains("b"));

        // Loading again skips duplicates
        assert_eq!(restored.load_from(&repository).await.unwrap(), 0);
    }
}
