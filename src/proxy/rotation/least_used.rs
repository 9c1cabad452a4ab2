//! Least-used proxy selection strategy

use super::{ProxySelector, SelectionContext};
use crate::models::Proxy;

/// Selects the proxy that has served the fewest requests
///
/// Ties go to the proxy that was added to the pool first.
pub struct LeastUsedSelector;

impl LeastUsedSelector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LeastUsedSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxySelector for LeastUsedSelector {
    fn choose(&self, candidates: &[Proxy], _context: &SelectionContext) -> Option<Proxy> {
        candidates
            .iter()
            .min_by_key(|p| p.total_requests())
            .cloned()
    }

    fn strategy_name(&self) -> &'static str {
        "least_used"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::pool::ProxyPool;
    use crate::models::NewProxy;

    fn create_test_proxy(id: &str, last_octet: u8) -> Proxy {
        Proxy::new(NewProxy {
            url: format!("http://203.0.113.{}:8080", last_octet),
            id: Some(id.to_string()),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_least_used_picks_fewest_requests() {
        let selector = LeastUsedSelector::new();
        let pool = ProxyPool::new();
        pool.add(create_test_proxy("a", 1)).unwrap();
        pool.add(create_test_proxy("b", 2)).unwrap();
        pool.add(create_test_proxy("c", 3)).unwrap();

        for _ in 0..3 {
            pool.record_success("a", 10.0).unwrap();
        }
        pool.record_success("b", 10.0).unwrap();
        pool.record_success("c", 10.0).unwrap();
        pool.record_success("c", 10.0).unwrap();

        let ctx = SelectionContext::new();
        assert_eq!(selector.select(&pool, &ctx).unwrap().id(), "b");
    }

    #[test]
    fn test_least_used_balances_over_time() {
        let selector = LeastUsedSelector::new();
        let pool = ProxyPool::new();
        pool.add(create_test_proxy("a", 1)).unwrap();
        pool.add(create_test_proxy("b", 2)).unwrap();

        let ctx = SelectionContext::new();
        let mut picks = Vec::new();
        for _ in 0..4 {
            let proxy = selector.select(&pool, &ctx).unwrap();
            pool.record_success(proxy.id(), 10.0).unwrap();
            picks.push(proxy.id().to_string());
        }
        assert_eq!(picks, vec!["a", "b", "a", "b"]);
    }
}
