use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{validated, ProxyRepository};
use crate::error::Result;
use crate::models::Proxy;

/// In-process repository for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryRepository {
    proxies: Mutex<Vec<Proxy>>,
    saves: AtomicUsize,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_proxies(proxies: Vec<Proxy>) -> Self {
        Self {
            proxies: Mutex::new(proxies),
            saves: AtomicUsize::new(0),
        }
    }

    /// Number of completed saves
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Relaxed)
    }

    pub fn stored(&self) -> Vec<Proxy> {
        self.proxies.lock().clone()
    }
}

#[async_trait]
impl ProxyRepository for MemoryRepository {
    async fn load(&self) -> Result<Vec<Proxy>> {
        Ok(validated(self.proxies.lock().clone()))
    }

    async fn save(&self, proxies: &[Proxy]) -> Result<()> {
        *self.proxies.lock() = proxies.to_vec();
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
