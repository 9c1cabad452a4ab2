//! Random proxy selection strategy

use rand::seq::SliceRandom;

use super::{ProxySelector, SelectionContext};
use crate::models::Proxy;

/// Selects a uniformly random proxy from the candidates
pub struct RandomSelector;

impl RandomSelector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RandomSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxySelector for RandomSelector {
    fn choose(&self, candidates: &[Proxy], _context: &SelectionContext) -> Option<Proxy> {
        let mut rng = rand::thread_rng();
        candidates.choose(&mut rng).cloned()
    }

    fn strategy_name(&self) -> &'static str {
        "random"
    }
}
