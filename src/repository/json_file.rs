use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{validated, ProxyRepository};
use crate::error::{ProxyWhirlError, Result};
use crate::models::Proxy;

const FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct StoredPool {
    version: u32,
    saved_at: DateTime<Utc>,
    proxies: Vec<Proxy>,
}

/// Repository backed by a single JSON file
///
/// Writes go to a sibling temp file which is then renamed over the target, so
/// a crash mid-save leaves the previous file intact.
#[derive(Debug, Clone)]
pub struct JsonFileRepository {
    path: PathBuf,
}

impl JsonFileRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "proxies.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl ProxyRepository for JsonFileRepository {
    async fn load(&self) -> Result<Vec<Proxy>> {
        if !tokio::fs::try_exists(&self.path).await? {
            debug!(path = %self.path.display(), "No proxy store yet");
            return Ok(Vec::new());
        }

        let raw = tokio::fs::read_to_string(&self.path).await?;
        let stored: StoredPool = serde_json::from_str(&raw)?;
        if stored.version != FORMAT_VERSION {
            return Err(ProxyWhirlError::Storage(format!(
                "unsupported store version {} in {}",
                stored.version,
                self.path.display()
            )));
        }

        let total = stored.proxies.len();
        let proxies = validated(stored.proxies);
        info!(
            path = %self.path.display(),
            "Loaded {} proxies ({} rejected)",
            proxies.len(),
            total - proxies.len()
        );
        Ok(proxies)
    }

    async fn save(&self, proxies: &[Proxy]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let stored = StoredPool {
            version: FORMAT_VERSION,
            saved_at: Utc::now(),
            proxies: proxies.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&stored)?;

        let temp = self.temp_path();
        tokio::fs::write(&temp, &json).await?;
        tokio::fs::rename(&temp, &self.path).await?;

        debug!(path = %self.path.display(), "Saved {} proxies", proxies.len());
        Ok(())
    }
}
