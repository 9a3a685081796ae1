//! Manifest loading

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use steeplechase_common::{Error, Manifest, ManifestEntry, Result, MANIFEST_PATH};

/// Source of the ordered test list
#[async_trait]
pub trait ManifestSource: Send + Sync {
    async fn load(&self) -> Result<Vec<ManifestEntry>>;
}

/// Fetches `/manifest.json` from the harness server with a single GET
pub struct ManifestLoader {
    url: Url,
    client: reqwest::Client,
}

impl ManifestLoader {
    /// `base` is any URL on the harness server; only its origin matters
    pub fn new(base: &str) -> Result<Self> {
        let base = Url::parse(base).map_err(|e| Error::Fetch(format!("bad harness URL {}: {}", base, e)))?;
        let url = base
            .join(MANIFEST_PATH)
            .map_err(|e| Error::Fetch(e.to_string()))?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Fetch(e.to_string()))?;
        Ok(Self { url, client })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl ManifestSource for ManifestLoader {
    async fn load(&self) -> Result<Vec<ManifestEntry>> {
        debug!("Fetching manifest from {}", self.url);
        let resp = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| Error::Fetch(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Error::Fetch(format!("{} returned {}", self.url, resp.status())));
        }

        let manifest: Manifest = resp
            .json()
            .await
            .map_err(|e| Error::Fetch(format!("malformed manifest: {}", e)))?;

        info!("Manifest lists {} test(s)", manifest.len());
        Ok(manifest.tests)
    }
}

/// Fixed in-memory manifest
pub struct StaticManifest(pub Vec<ManifestEntry>);

#[async_trait]
impl ManifestSource for StaticManifest {
    async fn load(&self) -> Result<Vec<ManifestEntry>> {
        Ok(self.0.clone())
    }
}
