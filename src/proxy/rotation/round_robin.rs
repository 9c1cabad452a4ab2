//! Round-robin proxy selection strategy

use std::sync::atomic::{AtomicUsize, Ordering};

use super::{ProxySelector, SelectionContext};
use crate::models::Proxy;

/// Selects proxies in round-robin order
///
/// Uses atomic operations for lock-free index tracking. The cursor persists
/// across calls and is applied to whatever candidate list the call sees.
pub struct RoundRobinSelector {
    index: AtomicUsize,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self {
            index: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxySelector for RoundRobinSelector {
    fn choose(&self, candidates: &[Proxy], _context: &SelectionContext) -> Option<Proxy> {
        if candidates.is_empty() {
            return None;
        }

        // Atomically increment and get the previous value, then wrap around
        let idx = self.index.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates.get(idx).cloned()
    }

    fn strategy_name(&self) -> &'static str {
        "round_robin"
    }
}
