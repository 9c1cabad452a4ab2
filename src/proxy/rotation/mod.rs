//! Proxy rotation strategies
//!
//! This module provides various strategies for selecting proxies from the pool.
//! Every strategy sees the same candidate list: selectable proxies minus the
//! ones that already failed during the current logical request, narrowed by
//! the performance tier hint.

mod geo;
mod least_used;
mod performance;
mod random;
mod round_robin;
mod session_affinity;
mod weighted;

pub use geo::GeoTargetedSelector;
pub use least_used::LeastUsedSelector;
pub use performance::PerformanceSelector;
pub use random::RandomSelector;
pub use round_robin::RoundRobinSelector;
pub use session_affinity::SessionPersistenceSelector;
pub use weighted::WeightedSelector;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{ProxyWhirlError, Result};
use crate::models::Proxy;
use crate::proxy::pool::ProxyPool;
use crate::proxy::session::SessionManager;

/// Strategy types for proxy rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationStrategy {
    #[default]
    RoundRobin,
    Random,
    Weighted,
    LeastUsed,
    PerformanceBased,
    GeoTargeted,
    SessionPersistence,
}

impl RotationStrategy {
    /// Parse a strategy name, falling back to round-robin for unknown names
    pub fn from_str(s: &str) -> Self {
        Self::parse(s).unwrap_or_default()
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "round_robin" | "roundrobin" | "round-robin" | "rr" => Some(Self::RoundRobin),
            "random" => Some(Self::Random),
            "weighted" => Some(Self::Weighted),
            "least_used" | "leastused" | "least-used" => Some(Self::LeastUsed),
            "performance_based" | "performance" | "performance-based" | "fastest" => {
                Some(Self::PerformanceBased)
            }
            "geo_targeted" | "geo" | "geo-targeted" => Some(Self::GeoTargeted),
            "session_persistence" | "session" | "sticky" | "session-persistence" => {
                Some(Self::SessionPersistence)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::Random => "random",
            Self::Weighted => "weighted",
            Self::LeastUsed => "least_used",
            Self::PerformanceBased => "performance_based",
            Self::GeoTargeted => "geo_targeted",
            Self::SessionPersistence => "session_persistence",
        }
    }
}

/// Minimum performance a caller asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PerformanceTier {
    #[default]
    Any,
    /// Average response time under 2s
    Standard,
    /// Average response time under 500ms
    Fast,
}

impl PerformanceTier {
    pub fn max_latency_ms(&self) -> Option<f64> {
        match self {
            PerformanceTier::Any => None,
            PerformanceTier::Standard => Some(2000.0),
            PerformanceTier::Fast => Some(500.0),
        }
    }

    /// Unmeasured proxies satisfy every tier
    pub fn admits(&self, proxy: &Proxy) -> bool {
        match (self.max_latency_ms(), proxy.average_response_time_ms()) {
            (Some(max), Some(avg)) => avg < max,
            _ => true,
        }
    }
}

/// Per-request selection inputs
#[derive(Debug, Clone, Default)]
pub struct SelectionContext {
    /// 1-based attempt within the current logical request
    pub attempt_number: u32,
    /// Proxies already tried and failed during this logical request
    pub failed_proxy_ids: HashSet<String>,
    pub session_id: Option<String>,
    /// Country code or region name
    pub region: Option<String>,
    pub min_tier: PerformanceTier,
}

impl SelectionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_tier(mut self, tier: PerformanceTier) -> Self {
        self.min_tier = tier;
        self
    }

    pub fn mark_failed(&mut self, proxy_id: &str) {
        self.failed_proxy_ids.insert(proxy_id.to_string());
    }

    pub fn has_failed(&self, proxy_id: &str) -> bool {
        self.failed_proxy_ids.contains(proxy_id)
    }
}

/// Proxies a strategy may choose from for `context` at `now`
pub fn eligible_candidates(
    pool: &ProxyPool,
    context: &SelectionContext,
    now: DateTime<Utc>,
) -> Vec<Proxy> {
    pool.selectable_where(now, |p| {
        !context.has_failed(p.id()) && context.min_tier.admits(p)
    })
}

/// Trait for proxy selection strategies
///
/// Implementations pick from a candidate list that has already been filtered
/// for health, expiry and proxies that failed earlier in the same request.
pub trait ProxySelector: Send + Sync {
    /// Pick one of `candidates`, or `None` if none fits
    fn choose(&self, candidates: &[Proxy], context: &SelectionContext) -> Option<Proxy>;

    /// Get the strategy name
    fn strategy_name(&self) -> &'static str;

    /// Select a proxy from the pool
    ///
    /// Fails with `PoolEmpty` when no eligible proxy exists.
    fn select(&self, pool: &ProxyPool, context: &SelectionContext) -> Result<Proxy> {
        let candidates = eligible_candidates(pool, context, Utc::now());
        if candidates.is_empty() {
            return Err(ProxyWhirlError::PoolEmpty);
        }
        self.choose(&candidates, context)
            .ok_or(ProxyWhirlError::PoolEmpty)
    }
}

/// The closed set of strategies
pub enum Selector {
    RoundRobin(RoundRobinSelector),
    Random(RandomSelector),
    Weighted(WeightedSelector),
    LeastUsed(LeastUsedSelector),
    PerformanceBased(PerformanceSelector),
    GeoTargeted(GeoTargetedSelector),
    SessionPersistence(SessionPersistenceSelector),
}

impl Selector {
    pub fn kind(&self) -> RotationStrategy {
        match self {
            Selector::RoundRobin(_) => RotationStrategy::RoundRobin,
            Selector::Random(_) => RotationStrategy::Random,
            Selector::Weighted(_) => RotationStrategy::Weighted,
            Selector::LeastUsed(_) => RotationStrategy::LeastUsed,
            Selector::PerformanceBased(_) => RotationStrategy::PerformanceBased,
            Selector::GeoTargeted(_) => RotationStrategy::GeoTargeted,
            Selector::SessionPersistence(_) => RotationStrategy::SessionPersistence,
        }
    }
}

impl ProxySelector for Selector {
    fn choose(&self, candidates: &[Proxy], context: &SelectionContext) -> Option<Proxy> {
        match self {
            Selector::RoundRobin(s) => s.choose(candidates, context),
            Selector::Random(s) => s.choose(candidates, context),
            Selector::Weighted(s) => s.choose(candidates, context),
            Selector::LeastUsed(s) => s.choose(candidates, context),
            Selector::PerformanceBased(s) => s.choose(candidates, context),
            Selector::GeoTargeted(s) => s.choose(candidates, context),
            Selector::SessionPersistence(s) => s.choose(candidates, context),
        }
    }

    fn strategy_name(&self) -> &'static str {
        self.kind().as_str()
    }
}

/// Create a proxy selector based on the strategy type
///
/// Geo-targeted and session-persistent selection delegate to round-robin.
pub fn create_selector(strategy: RotationStrategy, sessions: Arc<SessionManager>) -> Selector {
    match strategy {
        RotationStrategy::RoundRobin => Selector::RoundRobin(RoundRobinSelector::new()),
        RotationStrategy::Random => Selector::Random(RandomSelector::new()),
        RotationStrategy::Weighted => Selector::Weighted(WeightedSelector::new()),
        RotationStrategy::LeastUsed => Selector::LeastUsed(LeastUsedSelector::new()),
        RotationStrategy::PerformanceBased => {
            Selector::PerformanceBased(PerformanceSelector::new())
        }
        RotationStrategy::GeoTargeted => Selector::GeoTargeted(GeoTargetedSelector::new(
            Selector::RoundRobin(RoundRobinSelector::new()),
        )),
        RotationStrategy::SessionPersistence => {
            let timeout = sessions.config().default_timeout;
            Selector::SessionPersistence(SessionPersistenceSelector::new(
                sessions,
                Selector::RoundRobin(RoundRobinSelector::new()),
                timeout,
            ))
        }
    }
}
