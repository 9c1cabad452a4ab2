//! Proxy persistence
//!
//! The engine seeds its pool from a repository at startup and saves it back
//! periodically. The on-disk format belongs to the repository implementation.

mod json_file;
mod memory;

pub use json_file::JsonFileRepository;
pub use memory::MemoryRepository;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::Proxy;

/// Storage for the proxy list
#[async_trait]
pub trait ProxyRepository: Send + Sync {
    /// Load all stored proxies; an absent store yields an empty list
    async fn load(&self) -> Result<Vec<Proxy>>;

    /// Replace the stored list with `proxies`
    async fn save(&self, proxies: &[Proxy]) -> Result<()>;
}

/// Keep proxies that pass validation, logging the ones that do not
pub(crate) fn validated(proxies: Vec<Proxy>) -> Vec<Proxy> {
    proxies
        .into_iter()
        .filter(|proxy| match proxy.validate() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(proxy_id = %proxy.id(), "Skipping stored proxy: {}", e);
                false
            }
        })
        .collect()
}
