//! Concurrent proxy registry
//!
//! The pool owns the authoritative proxy list together with an id index. Both
//! are only touched while holding the pool lock, so they can never disagree.
//! Each entry carries its own lock so outcome recording on one proxy does not
//! serialize against structural changes or other proxies.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{ProxyWhirlError, Result};
use crate::models::{HealthStatus, Proxy, ProxySource};

/// A pool entry shared between the pool and in-flight callers
pub type SharedProxy = Arc<RwLock<Proxy>>;

#[derive(Default)]
struct PoolInner {
    proxies: Vec<SharedProxy>,
    index: HashMap<String, SharedProxy>,
}

/// Aggregate pool statistics, computed from one consistent snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub healthy_count: usize,
    pub unhealthy_count: usize,
    pub total_requests: u64,
    pub overall_success_rate: f64,
}

/// Concurrent registry of proxies
pub struct ProxyPool {
    inner: RwLock<PoolInner>,
    max_size: Option<usize>,
}

impl ProxyPool {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(PoolInner::default()),
            max_size: None,
        }
    }

    /// Pool that rejects additions once `max_size` proxies are registered
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            inner: RwLock::new(PoolInner::default()),
            max_size: Some(max_size),
        }
    }

    pub fn max_size(&self) -> Option<usize> {
        self.max_size
    }

    /// Register a proxy
    ///
    /// Fails with `DuplicateProxy` when the id is taken and with `PoolFull`
    /// when the pool is at capacity. Existing entries are never evicted.
    pub fn add(&self, proxy: Proxy) -> Result<()> {
        let mut inner = self.inner.write();

        if inner.index.contains_key(proxy.id()) {
            return Err(ProxyWhirlError::DuplicateProxy {
                id: proxy.id().to_string(),
            });
        }

        if let Some(max_size) = self.max_size {
            if inner.proxies.len() >= max_size {
                return Err(ProxyWhirlError::PoolFull { max_size });
            }
        }

        let id = proxy.id().to_string();
        debug!(proxy_id = %id, url = %proxy.url(), "Adding proxy to pool");

        let shared = Arc::new(RwLock::new(proxy));
        inner.proxies.push(shared.clone());
        inner.index.insert(id, shared);
        Ok(())
    }

    /// Register many proxies, skipping ones that are rejected
    ///
    /// Returns the number added.
    pub fn extend(&self, proxies: impl IntoIterator<Item = Proxy>) -> usize {
        let mut added = 0;
        for proxy in proxies {
            let id = proxy.id().to_string();
            match self.add(proxy) {
                Ok(()) => added += 1,
                Err(e) => warn!(proxy_id = %id, "Skipping proxy: {}", e),
            }
        }
        added
    }

    /// Remove a proxy by id, returning whether it was present
    pub fn remove(&self, id: &str) -> bool {
        let mut inner = self.inner.write();
        if inner.index.remove(id).is_none() {
            return false;
        }
        inner.proxies.retain(|p| p.read().id() != id);
        debug!(proxy_id = %id, "Removed proxy from pool");
        true
    }

    /// Snapshot of a single proxy
    pub fn get_by_id(&self, id: &str) -> Option<Proxy> {
        self.shared(id).map(|p| p.read().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().proxies.is_empty()
    }

    /// Snapshot of every proxy, in insertion order
    pub fn all(&self) -> Vec<Proxy> {
        self.snapshot_where(|_| true)
    }

    /// Snapshot of proxies whose status is `Healthy`
    pub fn healthy(&self) -> Vec<Proxy> {
        self.snapshot_where(Proxy::is_healthy)
    }

    /// Snapshot of proxies rotation may hand out at `now` that also pass `keep`
    ///
    /// Filtering happens under the read lock; only matches are cloned.
    pub fn selectable_where(
        &self,
        now: DateTime<Utc>,
        keep: impl Fn(&Proxy) -> bool,
    ) -> Vec<Proxy> {
        self.snapshot_where(|p| p.is_selectable_at(now) && keep(p))
    }

    /// Snapshot of proxies carrying every tag in `tags`
    pub fn filter_by_tags(&self, tags: &BTreeSet<String>) -> Vec<Proxy> {
        self.snapshot_where(|p| p.has_tags(tags))
    }

    pub fn filter_by_source(&self, source: ProxySource) -> Vec<Proxy> {
        self.snapshot_where(|p| p.source() == source)
    }

    /// Remove every proxy that is not `Healthy`, returning how many were removed
    pub fn clear_unhealthy(&self) -> usize {
        let removed = self.remove_where(|p| !p.is_healthy());
        if removed > 0 {
            info!(removed, "Cleared unhealthy proxies");
        }
        removed
    }

    /// Remove expired proxies, returning how many were removed
    pub fn clear_expired(&self) -> usize {
        self.clear_expired_at(Utc::now())
    }

    /// Remove proxies expired at `now`; one reference time is used for the whole sweep
    pub fn clear_expired_at(&self, now: DateTime<Utc>) -> usize {
        let removed = self.remove_where(|p| p.is_expired_at(now));
        if removed > 0 {
            info!(removed, "Cleared expired proxies");
        }
        removed
    }

    /// Aggregate statistics over one snapshot
    pub fn stats(&self) -> PoolStats {
        let snapshot = self.all();
        let size = snapshot.len();
        let healthy_count = snapshot.iter().filter(|p| p.is_healthy()).count();
        let total_requests: u64 = snapshot.iter().map(Proxy::total_requests).sum();
        let total_successes: u64 = snapshot.iter().map(Proxy::total_successes).sum();
        let overall_success_rate = if total_requests == 0 {
            0.0
        } else {
            (total_successes as f64 / total_requests as f64).clamp(0.0, 1.0)
        };

        PoolStats {
            size,
            healthy_count,
            unhealthy_count: size - healthy_count,
            total_requests,
            overall_success_rate,
        }
    }

    /// Record a successful request against a proxy, returning its new status
    pub fn record_success(&self, id: &str, latency_ms: f64) -> Result<HealthStatus> {
        let shared = self.shared_or_err(id)?;
        let mut proxy = shared.write();
        proxy.record_success(latency_ms);
        Ok(proxy.health_status())
    }

    /// Record a failed request against a proxy, returning its new status
    pub fn record_failure(&self, id: &str, error: Option<&str>) -> Result<HealthStatus> {
        let shared = self.shared_or_err(id)?;
        let mut proxy = shared.write();
        let before = proxy.health_status();
        proxy.record_failure(error);
        let after = proxy.health_status();
        if before != after {
            debug!(proxy_id = %id, from = %before, to = %after, "Proxy health changed");
        }
        Ok(after)
    }

    fn shared(&self, id: &str) -> Option<SharedProxy> {
        self.inner.read().index.get(id).cloned()
    }

    fn shared_or_err(&self, id: &str) -> Result<SharedProxy> {
        self.shared(id).ok_or_else(|| ProxyWhirlError::ProxyNotFound { id: id.to_string() })
    }

    fn snapshot_where(&self, keep: impl Fn(&Proxy) -> bool) -> Vec<Proxy> {
        let inner = self.inner.read();
        inner
            .proxies
            .iter()
            .filter_map(|shared| {
                let proxy = shared.read();
                keep(&proxy).then(|| proxy.clone())
            })
            .collect()
    }

    fn remove_where(&self, remove: impl Fn(&Proxy) -> bool) -> usize {
        let mut inner = self.inner.write();
        let PoolInner { proxies, index } = &mut *inner;
        let before = proxies.len();
        proxies.retain(|shared| {
            let proxy = shared.read();
            if remove(&proxy) {
                index.remove(proxy.id());
                false
            } else {
                true
            }
        });
        before - proxies.len()
    }
}

impl Default for ProxyPool {
    fn default() -> Self {
        Self::new()
    }
}
