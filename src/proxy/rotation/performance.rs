//! Performance-based proxy selection strategy

use std::cmp::Ordering;

use super::{ProxySelector, SelectionContext};
use crate::models::Proxy;

/// Selects the proxy with the lowest average response time
///
/// Proxies without a latency sample rank last. Equal latencies are broken by
/// the higher success rate.
pub struct PerformanceSelector;

impl PerformanceSelector {
    pub fn new() -> Self {
        Self
    }

    fn rank(a: &Proxy, b: &Proxy) -> Ordering {
        let latency = |p: &Proxy| p.average_response_time_ms().unwrap_or(f64::INFINITY);
        latency(a)
            .total_cmp(&latency(b))
            .then_with(|| b.success_rate().total_cmp(&a.success_rate()))
    }
}

impl Default for PerformanceSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxySelector for PerformanceSelector {
    fn choose(&self, candidates: &[Proxy], _context: &SelectionContext) -> Option<Proxy> {
        candidates.iter().min_by(|a, b| Self::rank(a, b)).cloned()
    }

    fn strategy_name(&self) -> &'static str {
        "performance_based"
    }
}
