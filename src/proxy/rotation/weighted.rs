//! Weighted random proxy selection strategy

use std::collections::HashMap;

use parking_lot::RwLock;
use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;

use super::{ProxySelector, SelectionContext};
use crate::models::Proxy;

/// Floor for weights derived from success rate, so a failing proxy can still recover
const MIN_WEIGHT: f64 = 0.01;

/// Picks proxies at random, proportionally to their weight
///
/// Weight resolution order: an explicit override set on the selector, the
/// proxy's own configured weight, then its success rate. Unmeasured proxies
/// weigh 1.0. Declared weights are used as-is, so a weight of 0 is never
/// picked unless every candidate weighs 0.
pub struct WeightedSelector {
    overrides: RwLock<HashMap<String, f64>>,
}

impl WeightedSelector {
    pub fn new() -> Self {
        Self {
            overrides: RwLock::new(HashMap::new()),
        }
    }

    /// Pin the weight of one proxy, ignoring its statistics
    pub fn set_weight(&self, proxy_id: &str, weight: f64) {
        if weight.is_finite() && weight >= 0.0 {
            self.overrides.write().insert(proxy_id.to_string(), weight);
        }
    }

    pub fn clear_weight(&self, proxy_id: &str) {
        self.overrides.write().remove(proxy_id);
    }

    pub fn weight_of(&self, proxy: &Proxy) -> f64 {
        if let Some(w) = self.overrides.read().get(proxy.id()) {
            *w
        } else if let Some(w) = proxy.weight() {
            w
        } else if proxy.total_requests() == 0 {
            1.0
        } else {
            proxy.success_rate().max(MIN_WEIGHT)
        }
    }
}

impl Default for WeightedSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxySelector for WeightedSelector {
    fn choose(&self, candidates: &[Proxy], _context: &SelectionContext) -> Option<Proxy> {
        if candidates.is_empty() {
            return None;
        }

        let weights: Vec<f64> = candidates.iter().map(|p| self.weight_of(p)).collect();
        let mut rng = rand::thread_rng();
        match WeightedIndex::new(&weights) {
            Ok(dist) => candidates.get(dist.sample(&mut rng)).cloned(),
            // All weights zero, fall back to uniform
            Err(_) => candidates.choose(&mut rng).cloned(),
        }
    }

    fn strategy_name(&self) -> &'static str {
        "weighted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewProxy;
    use crate::proxy::pool::ProxyPool;

    fn create_test_proxy(id: &str, last_octet: u8, weight: Option<f64>) -> Proxy {
        Proxy::new(NewProxy {
            url: format!("http://203.0.113.{}:8080", last_octet),
            id: Some(id.to_string()),
            weight,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_weight_resolution() {
        let selector = WeightedSelector::new();
        let mut measured = create_test_proxy("measured", 1, None);
        measured.record_success(100.0);
        measured.record_failure(Some("timeout"));
        let configured = create_test_proxy("configured", 2, Some(3.0));
        let fresh = create_test_proxy("fresh", 3, None);

        assert!((selector.weight_of(&measured) - 0.5).abs() < f64::EPSILON);
        assert_eq!(selector.weight_of(&configured), 3.0);
        assert_eq!(selector.weight_of(&fresh), 1.0);

        selector.set_weight("configured", 0.0);
        assert_eq!(selector.weight_of(&configured), 0.0);
        selector.clear_weight("configured");
        assert_eq!(selector.weight_of(&configured), 3.0);
    }

    #[test]
    fn test_weighted_prefers_heavier_proxy() {
        let selector = WeightedSelector::new();
        let pool = ProxyPool::new();
        pool.add(create_test_proxy("heavy", 1, Some(100.0))).unwrap();
        pool.add(create_test_proxy("light", 2, Some(1.0))).unwrap();

        let ctx = SelectionContext::new();
        let heavy = (0..1000)
            .filter(|_| selector.select(&pool, &ctx).unwrap().id() == "heavy")
            .count();
        assert!(heavy > 900, "heavy picked {} times", heavy);
    }

    #[test]
    fn test_declared_zero_weight_is_never_picked() {
        let selector = WeightedSelector::new();
        let pool = ProxyPool::new();
        pool.add(create_test_proxy("off", 1, Some(0.0))).unwrap();
        pool.add(create_test_proxy("on", 2, Some(1.0))).unwrap();

        let ctx = SelectionContext::new();
        for _ in 0..2000 {
            assert_eq!(selector.select(&pool, &ctx).unwrap().id(), "on");
        }

        // With nothing else left, a zero-weight proxy is still usable
        let only = create_test_proxy("off", 1, Some(0.0));
        let picked = selector.choose(std::slice::from_ref(&only), &ctx);
        assert_eq!(picked.unwrap().id(), "off");
    }

    #[test]
    fn test_weighted_zero_success_rate_still_selectable() {
        let selector = WeightedSelector::new();
        let mut proxy = create_test_proxy("bad", 1, None);
        proxy.record_failure(None);
        let picked = selector.choose(std::slice::from_ref(&proxy), &SelectionContext::new());
        assert_eq!(picked.unwrap().id(), "bad");
    }
}
