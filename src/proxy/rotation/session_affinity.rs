//! Session-persistent proxy selection strategy

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::{ProxySelector, SelectionContext, Selector};
use crate::models::Proxy;
use crate::proxy::session::SessionManager;

/// Keeps a session on the same proxy while that proxy stays eligible
///
/// Requests without a session id go straight to the fallback strategy. When
/// the bound proxy is no longer among the candidates (unhealthy, expired,
/// removed or failed earlier in this request) a new proxy is picked and the
/// session is rebound to it.
pub struct SessionPersistenceSelector {
    sessions: Arc<SessionManager>,
    fallback: Box<Selector>,
    timeout: Duration,
}

impl SessionPersistenceSelector {
    pub fn new(sessions: Arc<SessionManager>, fallback: Selector, timeout: Duration) -> Self {
        Self {
            sessions,
            fallback: Box::new(fallback),
            timeout,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }
}

impl ProxySelector for SessionPersistenceSelector {
    fn choose(&self, candidates: &[Proxy], context: &SelectionContext) -> Option<Proxy> {
        let session_id = match context.session_id.as_deref() {
            Some(id) => id,
            None => return self.fallback.choose(candidates, context),
        };

        if let Some(session) = self.sessions.get_and_touch(session_id) {
            if let Some(bound) = candidates.iter().find(|p| p.id() == session.proxy_id) {
                return Some(bound.clone());
            }
            debug!(
                session_id = %session_id,
                proxy_id = %session.proxy_id,
                "Bound proxy unavailable, rebinding session"
            );
        }

        let proxy = self.fallback.choose(candidates, context)?;
        self.sessions.bind_for_request(session_id, &proxy, self.timeout);
        Some(proxy)
    }

    fn strategy_name(&self) -> &'static str {
        "session_persistence"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewProxy;
    use crate::proxy::pool::ProxyPool;
    use crate::proxy::rotation::RoundRobinSelector;
    use crate::proxy::session::SessionConfig;

    fn create_test_proxy(id: &str, last_octet: u8) -> Proxy {
        Proxy::new(NewProxy {
            url: format!("http://203.0.113.{}:8080", last_octet),
            id: Some(id.to_string()),
            ..Default::default()
        })
        .unwrap()
    }

    fn create_selector() -> SessionPersistenceSelector {
        SessionPersistenceSelector::new(
            Arc::new(SessionManager::new(SessionConfig::default())),
            Selector::RoundRobin(RoundRobinSelector::new()),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn test_session_sticks_to_proxy() {
        let selector = create_selector();
        let pool = ProxyPool::new();
        pool.add(create_test_proxy("a", 1)).unwrap();
        pool.add(create_test_proxy("b", 2)).unwrap();

        let ctx = SelectionContext::new().with_session("user-1");
        let first = selector.select(&pool, &ctx).unwrap();
        for _ in 0..5 {
            assert_eq!(selector.select(&pool, &ctx).unwrap().id(), first.id());
        }

        let session = selector.sessions().get("user-1").unwrap();
        assert_eq!(session.proxy_id, first.id());
        assert_eq!(session.request_count, 6);
    }

    #[test]
    fn test_session_rebinds_when_proxy_unhealthy() {
        let selector = create_selector();
        let pool = ProxyPool::new();
        pool.add(create_test_proxy("a", 1)).unwrap();
        pool.add(create_test_proxy("b", 2)).unwrap();

        let ctx = SelectionContext::new().with_session("user-1");
        let first = selector.select(&pool, &ctx).unwrap();
        for _ in 0..3 {
            pool.record_failure(first.id(), Some("refused")).unwrap();
        }

        let second = selector.select(&pool, &ctx).unwrap();
        assert_ne!(second.id(), first.id());
        let session = selector.sessions().get("user-1").unwrap();
        assert_eq!(session.proxy_id, second.id());
        assert_eq!(session.request_count, 1);
    }

    #[test]
    fn test_session_rebinds_when_proxy_failed_in_request() {
        let selector = create_selector();
        let pool = ProxyPool::new();
        pool.add(create_test_proxy("a", 1)).unwrap();
        pool.add(create_test_proxy("b", 2)).unwrap();

        let mut ctx = SelectionContext::new().with_session("user-1");
        let first = selector.select(&pool, &ctx).unwrap();
        ctx.mark_failed(first.id());
        let second = selector.select(&pool, &ctx).unwrap();
        assert_ne!(second.id(), first.id());
    }

    #[test]
    fn test_no_session_uses_fallback() {
        let selector = create_selector();
        let pool = ProxyPool::new();
        pool.add(create_test_proxy("a", 1)).unwrap();
        pool.add(create_test_proxy("b", 2)).unwrap();

        let ctx = SelectionContext::new();
        assert_eq!(selector.select(&pool, &ctx).unwrap().id(), "a");
        assert_eq!(selector.select(&pool, &ctx).unwrap().id(), "b");
        assert!(selector.sessions().is_empty());
    }
}
