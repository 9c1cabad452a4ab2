//! Geo-targeted proxy selection strategy

use super::{ProxySelector, SelectionContext, Selector};
use crate::models::Proxy;

/// Narrows candidates to the requested region, then delegates
///
/// A context without a region passes all candidates through. When no
/// candidate matches the region the selector either falls back to the full
/// list or returns nothing, depending on `fallback_to_any`.
pub struct GeoTargetedSelector {
    inner: Box<Selector>,
    fallback_to_any: bool,
}

impl GeoTargetedSelector {
    pub fn new(inner: Selector) -> Self {
        Self {
            inner: Box::new(inner),
            fallback_to_any: true,
        }
    }

    pub fn strict(mut self) -> Self {
        self.fallback_to_any = false;
        self
    }
}

impl ProxySelector for GeoTargetedSelector {
    fn choose(&self, candidates: &[Proxy], context: &SelectionContext) -> Option<Proxy> {
        let region = match context.region.as_deref() {
            Some(r) if !r.trim().is_empty() => r,
            _ => return self.inner.choose(candidates, context),
        };

        let local: Vec<Proxy> = candidates
            .iter()
            .filter(|p| p.matches_region(region))
            .cloned()
            .collect();

        if !local.is_empty() {
            self.inner.choose(&local, context)
        } else if self.fallback_to_any {
            self.inner.choose(candidates, context)
        } else {
            None
        }
    }

    fn strategy_name(&self) -> &'static str {
        "geo_targeted"
    }
}
