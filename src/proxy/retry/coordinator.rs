//! Retry coordination across proxies
//!
//! One logical request runs as a loop of attempts. Each attempt selects a
//! proxy, checks its circuit breaker, dispatches through the transport and
//! records the outcome on the proxy, its breaker and the metrics. Per-attempt
//! failures stay inside the loop; only the terminal outcome is returned.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::metrics::{AttemptOutcome, RequestRecord, RetryAttempt, RetryMetrics};
use super::policy::RetryPolicy;
use crate::error::{ProxyWhirlError, Result};
use crate::models::Proxy;
use crate::proxy::circuit_breaker::{CircuitBreakerEvent, CircuitBreakerRegistry};
use crate::proxy::pool::ProxyPool;
use crate::proxy::rotation::{ProxySelector, SelectionContext};
use crate::proxy::transport::{ProxyRequest, Transport, TransportError, TransportResponse};

/// Successful end of a logical request
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteOutcome {
    pub proxy_id: String,
    /// Attempts counted against the policy, including the successful one
    pub attempts: u32,
    pub status: u16,
    pub latency_ms: f64,
    pub history: Vec<RetryAttempt>,
}

/// Result of one dispatched attempt
enum Dispatch {
    Succeeded(TransportResponse),
    Failed {
        error: String,
        status: Option<u16>,
        latency_ms: Option<f64>,
        retryable: bool,
    },
}

/// Sequences attempts of a logical request across proxies
pub struct RetryCoordinator {
    pool: Arc<ProxyPool>,
    breakers: Arc<CircuitBreakerRegistry>,
    metrics: Arc<RetryMetrics>,
}

impl RetryCoordinator {
    pub fn new(
        pool: Arc<ProxyPool>,
        breakers: Arc<CircuitBreakerRegistry>,
        metrics: Arc<RetryMetrics>,
    ) -> Self {
        Self {
            pool,
            breakers,
            metrics,
        }
    }

    /// Run `request` until it succeeds or the policy gives up
    ///
    /// Errors are terminal: `PoolEmpty` when nothing could be selected before
    /// any attempt, `RetryExhausted`, `NonRetryable` or `Cancelled`.
    #[instrument(
        skip_all,
        fields(method = %request.method, url = %request.url, strategy = selector.strategy_name())
    )]
    pub async fn execute<S>(
        &self,
        selector: &S,
        transport: &dyn Transport,
        request: &ProxyRequest,
        policy: &RetryPolicy,
        context: SelectionContext,
        cancel: &CancellationToken,
    ) -> Result<ExecuteOutcome>
    where
        S: ProxySelector + ?Sized,
    {
        policy.validate()?;

        let mut context = context;
        let mut attempts: u32 = 0;
        let mut history: Vec<RetryAttempt> = Vec::new();
        let mut last_proxy_id: Option<String> = None;
        let mut last_error = String::from("no attempt made");

        loop {
            if cancel.is_cancelled() {
                return Err(self.cancelled(attempts, last_proxy_id, last_error));
            }
            if attempts >= policy.max_attempts {
                return Err(self.exhausted(attempts, last_proxy_id, last_error, history));
            }

            let attempt_number = attempts + 1;
            context.attempt_number = attempt_number;

            let proxy = match selector.select(&self.pool, &context) {
                Ok(proxy) => proxy,
                Err(ProxyWhirlError::PoolEmpty) if history.is_empty() => {
                    self.finish_request(attempts, false);
                    return Err(ProxyWhirlError::PoolEmpty);
                }
                Err(ProxyWhirlError::PoolEmpty) => {
                    debug!(attempt = attempt_number, "No untried proxy left");
                    return Err(self.exhausted(attempts, last_proxy_id, last_error, history));
                }
                Err(e) => return Err(e),
            };
            let proxy_id = proxy.id().to_string();

            let admission = self.breakers.admit_at(&proxy_id, Utc::now());
            self.note_breaker_event(admission.event);
            if !admission.allowed {
                debug!(proxy_id = %proxy_id, attempt = attempt_number, "Circuit open, skipping proxy");
                let error = ProxyWhirlError::CircuitOpen {
                    proxy_id: proxy_id.clone(),
                }
                .to_string();
                self.push_attempt(
                    &mut history,
                    RetryAttempt {
                        proxy_id: proxy_id.clone(),
                        attempt_number,
                        timestamp: Utc::now(),
                        outcome: AttemptOutcome::CircuitOpen,
                        latency_ms: None,
                        status: None,
                        error: Some(error.clone()),
                    },
                );
                context.mark_failed(&proxy_id);
                last_proxy_id = Some(proxy_id);
                last_error = error;
                if policy.circuit_open_consumes_attempt {
                    attempts += 1;
                }
                continue;
            }

            attempts += 1;
            let dispatch = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // Outcome unknown; leave proxy and breaker untouched
                    return Err(self.cancelled(
                        attempts,
                        Some(proxy_id),
                        format!("cancelled during attempt {}", attempts),
                    ));
                }
                result = transport.send(&proxy, request) => classify(result, policy),
            };

            match dispatch {
                Dispatch::Succeeded(response) => {
                    self.record_success(&proxy, &response);
                    self.push_attempt(
                        &mut history,
                        RetryAttempt {
                            proxy_id: proxy_id.clone(),
                            attempt_number,
                            timestamp: Utc::now(),
                            outcome: AttemptOutcome::Success,
                            latency_ms: Some(response.latency_ms),
                            status: Some(response.status),
                            error: None,
                        },
                    );
                    self.finish_request(attempts, true);
                    debug!(proxy_id = %proxy_id, attempt = attempts, status = response.status, "Request succeeded");
                    return Ok(ExecuteOutcome {
                        proxy_id,
                        attempts,
                        status: response.status,
                        latency_ms: response.latency_ms,
                        history,
                    });
                }
                Dispatch::Failed {
                    error,
                    status,
                    latency_ms,
                    retryable,
                } => {
                    self.record_failure(&proxy, &error);
                    self.push_attempt(
                        &mut history,
                        RetryAttempt {
                            proxy_id: proxy_id.clone(),
                            attempt_number,
                            timestamp: Utc::now(),
                            outcome: AttemptOutcome::Failure,
                            latency_ms,
                            status,
                            error: Some(error.clone()),
                        },
                    );
                    context.mark_failed(&proxy_id);
                    warn!(proxy_id = %proxy_id, attempt = attempts, error = %error, "Attempt failed");

                    if !retryable || !policy.permits_retry_for(&request.method) {
                        self.finish_request(attempts, false);
                        return Err(ProxyWhirlError::NonRetryable {
                            attempts,
                            proxy_id,
                            error,
                        });
                    }

                    last_proxy_id = Some(proxy_id);
                    last_error = error;
                    if attempts >= policy.max_attempts {
                        continue;
                    }

                    let delay = policy.delay_for(attempts);
                    debug!(attempt = attempts, delay_ms = delay.as_millis() as u64, "Backing off");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            return Err(self.cancelled(attempts, last_proxy_id, last_error));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn record_success(&self, proxy: &Proxy, response: &TransportResponse) {
        if let Err(e) = self.pool.record_success(proxy.id(), response.latency_ms) {
            debug!(proxy_id = %proxy.id(), "Success not recorded on pool: {}", e);
        }
        let event = self.breakers.record_success(proxy.id());
        self.note_breaker_event(event);
    }

    fn record_failure(&self, proxy: &Proxy, error: &str) {
        if let Err(e) = self.pool.record_failure(proxy.id(), Some(error)) {
            debug!(proxy_id = %proxy.id(), "Failure not recorded on pool: {}", e);
        }
        let event = self.breakers.record_failure(proxy.id());
        self.note_breaker_event(event);
    }

    fn note_breaker_event(&self, event: Option<CircuitBreakerEvent>) {
        if let Some(event) = event {
            self.metrics.record_breaker_event(event);
        }
    }

    fn push_attempt(&self, history: &mut Vec<RetryAttempt>, attempt: RetryAttempt) {
        self.metrics.record_attempt(attempt.clone());
        history.push(attempt);
    }

    fn finish_request(&self, attempts: u32, succeeded: bool) {
        self.metrics.record_request(RequestRecord {
            timestamp: Utc::now(),
            attempts,
            succeeded,
        });
    }

    fn exhausted(
        &self,
        attempts: u32,
        last_proxy_id: Option<String>,
        last_error: String,
        history: Vec<RetryAttempt>,
    ) -> ProxyWhirlError {
        self.finish_request(attempts, false);
        info!(attempts, last_proxy = ?last_proxy_id, "Retries exhausted");
        ProxyWhirlError::RetryExhausted {
            attempts,
            last_proxy_id,
            last_error,
            history,
        }
    }

    fn cancelled(
        &self,
        attempts: u32,
        last_proxy_id: Option<String>,
        last_error: String,
    ) -> ProxyWhirlError {
        debug!(attempts, last_proxy = ?last_proxy_id, "Request cancelled");
        ProxyWhirlError::Cancelled {
            attempts,
            last_proxy_id,
            last_error,
        }
    }
}

/// Map a transport result onto success or a classified failure
///
/// Any 5xx or configured retry status is a proxy failure; only the
/// configured statuses are retried.
fn classify(
    result: std::result::Result<TransportResponse, TransportError>,
    policy: &RetryPolicy,
) -> Dispatch {
    match result {
        Ok(response) => {
            let retry_status = policy.is_retry_status(response.status);
            if retry_status || response.status >= 500 {
                Dispatch::Failed {
                    error: format!("upstream returned HTTP {}", response.status),
                    status: Some(response.status),
                    latency_ms: Some(response.latency_ms),
                    retryable: retry_status,
                }
            } else {
                Dispatch::Succeeded(response)
            }
        }
        Err(e) => {
            let error = e.to_string();
            Dispatch::Failed {
                retryable: ProxyWhirlError::from(e).is_retryable(),
                error,
                status: None,
                latency_ms: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;

    use async_trait::async_trait;
    use http::Method;
    use parking_lot::Mutex;

    use crate::models::NewProxy;
    use crate::proxy::circuit_breaker::CircuitBreakerConfig;
    use crate::proxy::rotation::RoundRobinSelector;

    type Reply = std::result::Result<TransportResponse, TransportError>;

    /// Replays scripted replies in order, then refuses every connection
    struct ScriptedTransport {
        script: Mutex<VecDeque<Reply>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Reply>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, proxy: &Proxy, _request: &ProxyRequest) -> Reply {
            self.calls.lock().push(proxy.id().to_string());
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Connect("connection refused".to_string())))
        }
    }

    /// Never completes
    struct HangingTransport;

    #[async_trait]
    impl Transport for HangingTransport {
        async fn send(&self, _proxy: &Proxy, _request: &ProxyRequest) -> Reply {
            futures::future::pending().await
        }
    }

    fn ok(status: u16) -> Reply {
        Ok(TransportResponse {
            status,
            latency_ms: 25.0,
        })
    }

    fn create_test_proxy(id: &str, last_octet: u8) -> Proxy {
        Proxy::new(NewProxy {
            url: format!("http://203.0.113.{}:8080", last_octet),
            id: Some(id.to_string()),
            ..Default::default()
        })
        .unwrap()
    }

    fn create_coordinator(ids: &[&str], breaker: CircuitBreakerConfig) -> RetryCoordinator {
        let pool = Arc::new(ProxyPool::new());
        for (i, id) in ids.iter().enumerate() {
            pool.add(create_test_proxy(id, i as u8 + 1)).unwrap();
        }
        RetryCoordinator::new(
            pool,
            Arc::new(CircuitBreakerRegistry::new(breaker)),
            Arc::new(RetryMetrics::default()),
        )
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(1),
            max_backoff_delay: Duration::from_millis(5),
            ..RetryPolicy::default()
        }
    }

    fn get() -> ProxyRequest {
        ProxyRequest::get("http://example.com/").unwrap()
    }

    #[tokio::test]
    async fn test_always_failing_transport_exhausts_after_max_attempts() {
        let coordinator =
            create_coordinator(&["a", "b", "c", "d"], CircuitBreakerConfig::default());
        let transport = ScriptedTransport::new(vec![]);
        let selector = RoundRobinSelector::new();

        let err = coordinator
            .execute(
                &selector,
                &transport,
                &get(),
                &fast_policy(),
                SelectionContext::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            ProxyWhirlError::RetryExhausted {
                attempts,
                last_proxy_id,
                history,
                ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(history.len(), 3);
                assert_eq!(last_proxy_id.as_deref(), Some("b"));
            }
            other => panic!("unexpected error: {}", other),
        }
        // The cursor keeps advancing over the shrinking candidate list
        assert_eq!(transport.calls(), vec!["a", "c", "b"]);

        let snapshot = coordinator.metrics.snapshot();
        assert_eq!(snapshot.total_attempts, 3);
        assert_eq!(snapshot.failed_requests, 1);
        for id in ["a", "b", "c"] {
            let proxy = coordinator.pool.get_by_id(id).unwrap();
            assert_eq!(proxy.total_failures(), 1);
        }
        assert_eq!(coordinator.pool.get_by_id("d").unwrap().total_requests(), 0);
    }

    #[tokio::test]
    async fn test_fails_over_to_another_proxy() {
        let coordinator = create_coordinator(&["a", "b"], CircuitBreakerConfig::default());
        let transport = ScriptedTransport::new(vec![ok(503), ok(200)]);
        let selector = RoundRobinSelector::new();

        let outcome = coordinator
            .execute(
                &selector,
                &transport,
                &get(),
                &fast_policy(),
                SelectionContext::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.proxy_id, "b");
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.history[0].status, Some(503));
        assert_eq!(outcome.history[0].outcome, AttemptOutcome::Failure);

        let b = coordinator.pool.get_by_id("b").unwrap();
        assert!(b.is_healthy());
        assert_eq!(b.average_response_time_ms(), Some(25.0));

        let snapshot = coordinator.metrics.snapshot();
        assert_eq!(snapshot.success_by_attempt.get(&2), Some(&1));
    }

    #[tokio::test]
    async fn test_single_proxy_exhausts_candidates() {
        let coordinator = create_coordinator(&["a"], CircuitBreakerConfig::default());
        let transport = ScriptedTransport::new(vec![]);

        let err = coordinator
            .execute(
                &RoundRobinSelector::new(),
                &transport,
                &get(),
                &fast_policy(),
                SelectionContext::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ProxyWhirlError::RetryExhausted { attempts: 1, .. }));
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_pool() {
        let coordinator = create_coordinator(&[], CircuitBreakerConfig::default());
        let transport = ScriptedTransport::new(vec![]);

        let err = coordinator
            .execute(
                &RoundRobinSelector::new(),
                &transport,
                &get(),
                &fast_policy(),
                SelectionContext::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ProxyWhirlError::PoolEmpty));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_non_idempotent_request_is_not_retried() {
        let coordinator = create_coordinator(&["a", "b"], CircuitBreakerConfig::default());
        let transport = ScriptedTransport::new(vec![]);
        let request = ProxyRequest::new(Method::POST, "http://example.com/submit").unwrap();

        let err = coordinator
            .execute(
                &RoundRobinSelector::new(),
                &transport,
                &request,
                &fast_policy(),
                SelectionContext::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ProxyWhirlError::NonRetryable { attempts: 1, ref proxy_id, .. } if proxy_id == "a"
        ));
        assert_eq!(transport.calls().len(), 1);

        let lenient = RetryPolicy {
            retry_non_idempotent: true,
            ..fast_policy()
        };
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Connect("reset".into())),
            ok(201),
        ]);
        let outcome = coordinator
            .execute(
                &RoundRobinSelector::new(),
                &transport,
                &request,
                &lenient,
                SelectionContext::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test]
    async fn test_status_classification() {
        let coordinator = create_coordinator(&["a", "b"], CircuitBreakerConfig::default());

        // 404 is the target's answer, not a proxy failure
        let transport = ScriptedTransport::new(vec![ok(404)]);
        let outcome = coordinator
            .execute(
                &RoundRobinSelector::new(),
                &transport,
                &get(),
                &fast_policy(),
                SelectionContext::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.status, 404);
        assert_eq!(outcome.attempts, 1);

        // 500 is a proxy failure but not in the retry list
        let transport = ScriptedTransport::new(vec![ok(500)]);
        let err = coordinator
            .execute(
                &RoundRobinSelector::new(),
                &transport,
                &get(),
                &fast_policy(),
                SelectionContext::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyWhirlError::NonRetryable { attempts: 1, .. }));
        assert_eq!(coordinator.pool.get_by_id("a").unwrap().total_failures(), 1);
    }

    #[tokio::test]
    async fn test_open_circuit_is_skipped_without_consuming_attempt() {
        let breaker = CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        };
        let coordinator = create_coordinator(&["a", "b"], breaker);
        coordinator.breakers.record_failure("a");

        let policy = RetryPolicy {
            max_attempts: 1,
            ..fast_policy()
        };
        let transport = ScriptedTransport::new(vec![ok(200)]);
        let outcome = coordinator
            .execute(
                &RoundRobinSelector::new(),
                &transport,
                &get(),
                &policy,
                SelectionContext::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.proxy_id, "b");
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.history.len(), 2);
        assert_eq!(outcome.history[0].outcome, AttemptOutcome::CircuitOpen);
        assert_eq!(transport.calls(), vec!["b"]);

        let snapshot = coordinator.metrics.snapshot();
        assert_eq!(snapshot.total_attempts, u64::from(outcome.attempts));
        assert_eq!(snapshot.circuit_open_skips, 1);
        let a = &snapshot.per_proxy["a"];
        assert_eq!((a.attempts, a.circuit_open_skips), (0, 1));
    }

    #[tokio::test]
    async fn test_open_circuit_consumes_attempt_when_configured() {
        let breaker = CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        };
        let coordinator = create_coordinator(&["a", "b"], breaker);
        coordinator.breakers.record_failure("a");

        let policy = RetryPolicy {
            max_attempts: 1,
            circuit_open_consumes_attempt: true,
            ..fast_policy()
        };
        let transport = ScriptedTransport::new(vec![ok(200)]);
        let err = coordinator
            .execute(
                &RoundRobinSelector::new(),
                &transport,
                &get(),
                &policy,
                SelectionContext::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ProxyWhirlError::RetryExhausted { attempts: 1, ref last_proxy_id, .. }
                if last_proxy_id.as_deref() == Some("a")
        ));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_all_circuits_open() {
        let breaker = CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        };
        let coordinator = create_coordinator(&["a", "b"], breaker);
        coordinator.breakers.record_failure("a");
        coordinator.breakers.record_failure("b");

        let transport = ScriptedTransport::new(vec![]);
        let err = coordinator
            .execute(
                &RoundRobinSelector::new(),
                &transport,
                &get(),
                &fast_policy(),
                SelectionContext::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ProxyWhirlError::RetryExhausted { attempts: 0, .. }));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_breaker_opens_and_event_is_counted() {
        let breaker = CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        };
        let coordinator = create_coordinator(&["a", "b"], breaker);
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Connect("refused".into())),
            ok(200),
        ]);

        coordinator
            .execute(
                &RoundRobinSelector::new(),
                &transport,
                &get(),
                &fast_policy(),
                SelectionContext::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(coordinator.breakers.open_proxy_ids(), vec!["a".to_string()]);
        assert_eq!(coordinator.metrics.snapshot().circuit_breaker_events, 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let coordinator = create_coordinator(&["a"], CircuitBreakerConfig::default());
        let transport = ScriptedTransport::new(vec![ok(200)]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = coordinator
            .execute(
                &RoundRobinSelector::new(),
                &transport,
                &get(),
                &fast_policy(),
                SelectionContext::new(),
                &cancel,
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ProxyWhirlError::Cancelled { attempts: 0, last_proxy_id: None, .. }
        ));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let coordinator = create_coordinator(&["a", "b"], CircuitBreakerConfig::default());
        let transport = ScriptedTransport::new(vec![]);
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(30),
            max_backoff_delay: Duration::from_secs(60),
            ..RetryPolicy::default()
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            coordinator.execute(
                &RoundRobinSelector::new(),
                &transport,
                &get(),
                &policy,
                SelectionContext::new(),
                &cancel,
            ),
        )
        .await
        .expect("backoff sleep should observe cancellation");

        match result {
            Err(ProxyWhirlError::Cancelled {
                attempts,
                last_proxy_id,
                last_error,
            }) => {
                assert_eq!(attempts, 1);
                assert_eq!(last_proxy_id.as_deref(), Some("a"));
                assert_eq!(last_error, "connect failed: connection refused");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(transport.calls(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_cancel_in_flight_leaves_state_untouched() {
        let coordinator = create_coordinator(&["a"], CircuitBreakerConfig::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = coordinator
            .execute(
                &RoundRobinSelector::new(),
                &HangingTransport,
                &get(),
                &fast_policy(),
                SelectionContext::new(),
                &cancel,
            )
            .await
            .unwrap_err();

        // The interrupted dispatch counts as an attempt
        match err {
            ProxyWhirlError::Cancelled {
                attempts,
                last_proxy_id,
                ..
            } => {
                assert_eq!(attempts, 1);
                assert_eq!(last_proxy_id.as_deref(), Some("a"));
            }
            other => panic!("unexpected error: {}", other),
        }
        let proxy = coordinator.pool.get_by_id("a").unwrap();
        assert_eq!(proxy.total_requests(), 0);
        assert!(coordinator.breakers.get("a").is_none());
    }

    #[tokio::test]
    async fn test_invalid_policy_rejected() {
        let coordinator = create_coordinator(&["a"], CircuitBreakerConfig::default());
        let policy = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        let err = coordinator
            .execute(
                &RoundRobinSelector::new(),
                &ScriptedTransport::new(vec![]),
                &get(),
                &policy,
                SelectionContext::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyWhirlError::InvalidConfig(_)));
    }
}
