//! Retry metrics
//!
//! Append-only logs of attempts, finished requests and circuit breaker events.
//! Every log is bounded by a retention window and an entry cap. Aggregates are
//! computed from what is retained, so they age out together with the entries.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::proxy::circuit_breaker::CircuitBreakerEvent;
use crate::proxy::to_chrono;

/// Outcome of a single attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
    /// Proxy skipped because its circuit was open
    CircuitOpen,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Failure => "failure",
            AttemptOutcome::CircuitOpen => "circuit_open",
        }
    }
}

/// One attempt of a logical request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub proxy_id: String,
    /// 1-based
    pub attempt_number: u32,
    pub timestamp: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub latency_ms: Option<f64>,
    pub status: Option<u16>,
    pub error: Option<String>,
}

/// Completion record for a logical request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub timestamp: DateTime<Utc>,
    pub attempts: u32,
    pub succeeded: bool,
}

/// Retention settings
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub retention: Duration,
    /// Per-log entry cap; oldest entries are dropped first
    pub max_entries: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(24 * 3600),
            max_entries: 10_000,
        }
    }
}

/// Per-proxy attempt statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProxyAttemptStats {
    /// Attempts dispatched through the proxy
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    /// Times the proxy was passed over because its circuit was open
    pub circuit_open_skips: u64,
    pub avg_latency_ms: Option<f64>,
}

/// Point-in-time export for monitoring
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Dispatched attempts; circuit-open skips are counted separately
    pub total_attempts: u64,
    pub circuit_open_skips: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Attempt number on which successful requests finished
    pub success_by_attempt: BTreeMap<u32, u64>,
    pub circuit_breaker_events: u64,
    pub per_proxy: BTreeMap<String, ProxyAttemptStats>,
}

#[derive(Debug, Default)]
struct MetricsState {
    attempts: VecDeque<RetryAttempt>,
    requests: VecDeque<RequestRecord>,
    breaker_events: VecDeque<CircuitBreakerEvent>,
}

/// Retry and circuit breaker metrics store
#[derive(Debug)]
pub struct RetryMetrics {
    config: MetricsConfig,
    state: Mutex<MetricsState>,
}

fn push_bounded<T>(log: &mut VecDeque<T>, item: T, max: usize) {
    log.push_back(item);
    while log.len() > max {
        log.pop_front();
    }
}

fn prune_log<T>(
    log: &mut VecDeque<T>,
    cutoff: DateTime<Utc>,
    timestamp: impl Fn(&T) -> DateTime<Utc>,
) -> usize {
    let before = log.len();
    while log.front().map(|e| timestamp(e) < cutoff).unwrap_or(false) {
        log.pop_front();
    }
    before - log.len()
}

impl RetryMetrics {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MetricsState::default()),
        }
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    pub fn record_attempt(&self, attempt: RetryAttempt) {
        let mut state = self.state.lock();
        push_bounded(&mut state.attempts, attempt, self.config.max_entries);
    }

    pub fn record_request(&self, record: RequestRecord) {
        let mut state = self.state.lock();
        push_bounded(&mut state.requests, record, self.config.max_entries);
    }

    pub fn record_breaker_event(&self, event: CircuitBreakerEvent) {
        let mut state = self.state.lock();
        push_bounded(&mut state.breaker_events, event, self.config.max_entries);
    }

    /// Drop entries older than the retention window
    pub fn prune(&self) -> usize {
        self.prune_at(Utc::now())
    }

    pub fn prune_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - to_chrono(self.config.retention);
        let mut state = self.state.lock();
        prune_log(&mut state.attempts, cutoff, |a| a.timestamp)
            + prune_log(&mut state.requests, cutoff, |r| r.timestamp)
            + prune_log(&mut state.breaker_events, cutoff, |e| e.timestamp)
    }

    /// Most recent attempts, newest last
    pub fn recent_attempts(&self, limit: usize) -> Vec<RetryAttempt> {
        let state = self.state.lock();
        let skip = state.attempts.len().saturating_sub(limit);
        state.attempts.iter().skip(skip).cloned().collect()
    }

    pub fn breaker_events(&self) -> Vec<CircuitBreakerEvent> {
        self.state.lock().breaker_events.iter().cloned().collect()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot_at(Utc::now())
    }

    /// Aggregate the entries still inside the retention window at `now`
    pub fn snapshot_at(&self, now: DateTime<Utc>) -> MetricsSnapshot {
        self.prune_at(now);
        let state = self.state.lock();

        let mut snapshot = MetricsSnapshot {
            total_requests: state.requests.len() as u64,
            circuit_breaker_events: state.breaker_events.len() as u64,
            ..Default::default()
        };

        for request in &state.requests {
            if request.succeeded {
                snapshot.successful_requests += 1;
                *snapshot
                    .success_by_attempt
                    .entry(request.attempts)
                    .or_insert(0) += 1;
            } else {
                snapshot.failed_requests += 1;
            }
        }

        let mut latency_totals: BTreeMap<&str, (f64, u64)> = BTreeMap::new();
        for attempt in &state.attempts {
            let stats = snapshot
                .per_proxy
                .entry(attempt.proxy_id.clone())
                .or_default();
            match attempt.outcome {
                AttemptOutcome::Success => stats.successes += 1,
                AttemptOutcome::Failure => stats.failures += 1,
                AttemptOutcome::CircuitOpen => {
                    stats.circuit_open_skips += 1;
                    snapshot.circuit_open_skips += 1;
                    continue;
                }
            }
            stats.attempts += 1;
            snapshot.total_attempts += 1;
            if let Some(latency) = attempt.latency_ms {
                let total = latency_totals.entry(attempt.proxy_id.as_str()).or_insert((0.0, 0));
                total.0 += latency;
                total.1 += 1;
            }
        }
        for (proxy_id, (sum, count)) in latency_totals {
            if let Some(stats) = snapshot.per_proxy.get_mut(proxy_id) {
                stats.avg_latency_ms = Some(sum / count as f64);
            }
        }

        snapshot
    }

    pub fn clear(&self) {
        *self.state.lock() = MetricsState::default();
    }
}

impl Default for RetryMetrics {
    fn default() -> Self {
        Self::new(MetricsConfig::default())
    }
}
