//! Per-proxy circuit breaking
//!
//! ```text
//! Closed   -> Open      failure_count >= failure_threshold within window_duration
//! Open     -> HalfOpen  now >= next_test_time
//! HalfOpen -> Closed    trial call succeeds
//! HalfOpen -> Open      trial call fails, or trial calls run out without a clean success
//! ```
//!
//! Breakers are created lazily the first time a proxy fails. A proxy without a
//! breaker is treated as closed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::to_chrono;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures within `window_duration` that open the circuit
    pub failure_threshold: u32,
    /// Rolling window for counting failures
    pub window_duration: Duration,
    /// How long the circuit stays open before admitting a trial call
    pub timeout_duration: Duration,
    /// Trial calls admitted per half-open episode
    pub half_open_max_calls: u32,
    /// Transition events retained per breaker
    pub max_events: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_duration: Duration::from_secs(60),
            timeout_duration: Duration::from_secs(30),
            half_open_max_calls: 1,
            max_events: 100,
        }
    }
}

/// A recorded state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerEvent {
    pub proxy_id: String,
    pub from_state: CircuitState,
    pub to_state: CircuitState,
    pub timestamp: DateTime<Utc>,
    pub failure_count: u32,
}

/// Result of asking a breaker for permission to send
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub allowed: bool,
    /// Transition caused by the admission check, if any
    pub event: Option<CircuitBreakerEvent>,
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub proxy_id: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub half_open_calls: u32,
    pub last_state_change: DateTime<Utc>,
    pub next_test_time: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: VecDeque<DateTime<Utc>>,
    half_open_calls: u32,
    last_state_change: DateTime<Utc>,
    next_test_time: Option<DateTime<Utc>>,
    events: VecDeque<CircuitBreakerEvent>,
}

impl BreakerState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            half_open_calls: 0,
            last_state_change: now,
            next_test_time: None,
            events: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: DateTime<Utc>, window: chrono::Duration) {
        while let Some(oldest) = self.failures.front() {
            if now - *oldest >= window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn failure_count(&self) -> u32 {
        self.failures.len() as u32
    }
}

/// Circuit breaker for a single proxy
#[derive(Debug)]
pub struct CircuitBreaker {
    proxy_id: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(proxy_id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            proxy_id: proxy_id.into(),
            config,
            inner: Mutex::new(BreakerState::new(Utc::now())),
        }
    }

    pub fn proxy_id(&self) -> &str {
        &self.proxy_id
    }

    /// Whether a request may be sent through this proxy now
    pub fn allow(&self) -> bool {
        self.admit_at(Utc::now()).allowed
    }

    pub fn allow_at(&self, now: DateTime<Utc>) -> bool {
        self.admit_at(now).allowed
    }

    /// Admission check that also reports any transition it caused
    ///
    /// In `HalfOpen` every admitted call counts as a trial call.
    pub fn admit_at(&self, now: DateTime<Utc>) -> Admission {
        let timeout = to_chrono(self.config.timeout_duration);
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => Admission {
                allowed: true,
                event: None,
            },
            CircuitState::Open => {
                let due = inner.next_test_time.map(|t| now >= t).unwrap_or(true);
                if !due {
                    return Admission {
                        allowed: false,
                        event: None,
                    };
                }
                let event = self.transition(&mut inner, CircuitState::HalfOpen, now);
                let allowed = self.config.half_open_max_calls > 0;
                if allowed {
                    inner.half_open_calls = 1;
                }
                Admission {
                    allowed,
                    event: Some(event),
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_calls < self.config.half_open_max_calls {
                    inner.half_open_calls += 1;
                    return Admission {
                        allowed: true,
                        event: None,
                    };
                }

                // Trial calls are used up. If none reported back within a full
                // timeout the episode is abandoned and the circuit reopens.
                if now - inner.last_state_change >= timeout {
                    let event = self.transition(&mut inner, CircuitState::Open, now);
                    inner.next_test_time = Some(now + timeout);
                    return Admission {
                        allowed: false,
                        event: Some(event),
                    };
                }

                Admission {
                    allowed: false,
                    event: None,
                }
            }
        }
    }

    pub fn record_success(&self) -> Option<CircuitBreakerEvent> {
        self.record_success_at(Utc::now())
    }

    /// Record a successful request; closes a half-open circuit
    pub fn record_success_at(&self, now: DateTime<Utc>) -> Option<CircuitBreakerEvent> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.failures.clear();
                let event = self.transition(&mut inner, CircuitState::Closed, now);
                info!(proxy_id = %self.proxy_id, "Circuit closed after successful trial call");
                Some(event)
            }
            CircuitState::Closed | CircuitState::Open => None,
        }
    }

    pub fn record_failure(&self) -> Option<CircuitBreakerEvent> {
        self.record_failure_at(Utc::now())
    }

    /// Record a failed request; may open the circuit
    pub fn record_failure_at(&self, now: DateTime<Utc>) -> Option<CircuitBreakerEvent> {
        let window = to_chrono(self.config.window_duration);
        let timeout = to_chrono(self.config.timeout_duration);
        let mut inner = self.inner.lock();

        inner.prune(now, window);
        inner.failures.push_back(now);

        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count() >= self.config.failure_threshold {
                    let event = self.transition(&mut inner, CircuitState::Open, now);
                    inner.next_test_time = Some(now + timeout);
                    warn!(
                        proxy_id = %self.proxy_id,
                        failure_count = event.failure_count,
                        "Circuit opened"
                    );
                    Some(event)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                let event = self.transition(&mut inner, CircuitState::Open, now);
                inner.next_test_time = Some(now + timeout);
                warn!(proxy_id = %self.proxy_id, "Trial call failed, circuit reopened");
                Some(event)
            }
            CircuitState::Open => None,
        }
    }

    /// Force the circuit closed and forget all failures
    pub fn reset(&self) -> Option<CircuitBreakerEvent> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        inner.failures.clear();
        inner.next_test_time = None;
        inner.half_open_calls = 0;
        if inner.state == CircuitState::Closed {
            return None;
        }
        let event = self.transition(&mut inner, CircuitState::Closed, now);
        info!(proxy_id = %self.proxy_id, "Circuit manually reset");
        Some(event)
    }

    /// Stored state; an elapsed open timeout is applied on the next admission check
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Failures inside the rolling window as of the last recorded failure
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count()
    }

    pub fn next_test_time(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().next_test_time
    }

    pub fn events(&self) -> Vec<CircuitBreakerEvent> {
        self.inner.lock().events.iter().cloned().collect()
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.lock();
        CircuitBreakerSnapshot {
            proxy_id: self.proxy_id.clone(),
            state: inner.state,
            failure_count: inner.failure_count(),
            half_open_calls: inner.half_open_calls,
            last_state_change: inner.last_state_change,
            next_test_time: inner.next_test_time,
        }
    }

    fn transition(
        &self,
        inner: &mut BreakerState,
        to: CircuitState,
        now: DateTime<Utc>,
    ) -> CircuitBreakerEvent {
        let event = CircuitBreakerEvent {
            proxy_id: self.proxy_id.clone(),
            from_state: inner.state,
            to_state: to,
            timestamp: now,
            failure_count: inner.failure_count(),
        };

        inner.state = to;
        inner.last_state_change = now;
        inner.half_open_calls = 0;
        if to == CircuitState::Closed {
            inner.next_test_time = None;
        }

        if self.config.max_events > 0 {
            if inner.events.len() >= self.config.max_events {
                inner.events.pop_front();
            }
            inner.events.push_back(event.clone());
        }
        event
    }
}

/// Breakers for every proxy that has failed at least once
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn get(&self, proxy_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(proxy_id).map(|b| b.value().clone())
    }

    pub fn get_or_create(&self, proxy_id: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.get(proxy_id) {
            return breaker;
        }
        self.breakers
            .entry(proxy_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(proxy_id, self.config.clone())))
            .value()
            .clone()
    }

    pub fn allow(&self, proxy_id: &str) -> bool {
        self.admit_at(proxy_id, Utc::now()).allowed
    }

    pub fn admit_at(&self, proxy_id: &str, now: DateTime<Utc>) -> Admission {
        match self.get(proxy_id) {
            Some(breaker) => breaker.admit_at(now),
            None => Admission {
                allowed: true,
                event: None,
            },
        }
    }

    pub fn record_success(&self, proxy_id: &str) -> Option<CircuitBreakerEvent> {
        self.get(proxy_id).and_then(|b| b.record_success())
    }

    pub fn record_failure(&self, proxy_id: &str) -> Option<CircuitBreakerEvent> {
        self.get_or_create(proxy_id).record_failure()
    }

    /// Operator reset; returns false when the proxy has no breaker
    pub fn reset(&self, proxy_id: &str) -> bool {
        match self.get(proxy_id) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|b| b.value().clone()).collect();
        for breaker in breakers {
            breaker.reset();
        }
    }

    /// Drop the breaker of a proxy that left the pool
    pub fn remove(&self, proxy_id: &str) -> bool {
        self.breakers.remove(proxy_id).is_some()
    }

    /// State of every breaker, sorted by proxy id
    pub fn states(&self) -> Vec<CircuitBreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|b| b.value().clone()).collect();
        let mut states: Vec<CircuitBreakerSnapshot> =
            breakers.iter().map(|b| b.snapshot()).collect();
        states.sort_by(|a, b| a.proxy_id.cmp(&b.proxy_id));
        states
    }

    /// Ids of proxies whose circuit is not closed
    pub fn open_proxy_ids(&self) -> Vec<String> {
        self.states()
            .into_iter()
            .filter(|s| s.state != CircuitState::Closed)
            .map(|s| s.proxy_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
