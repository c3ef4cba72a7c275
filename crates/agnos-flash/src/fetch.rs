//! Manifest sources
//!
//! HTTP(S) URLs are fetched with `reqwest`, `file://` URLs and bare paths are
//! read from disk, and [`StaticManifestSource`] serves a fixed list.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::fs;
use tracing::{debug, info};

use crate::error::ManifestError;
use crate::manifest::{ManifestImage, ManifestSource};

/// Default timeout for manifest requests
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Fetches manifests over HTTP(S)
#[derive(Debug, Clone)]
pub struct HttpManifestSource {
    client: Client,
}

impl HttpManifestSource {
    /// Create a source with the default timeout.
    pub fn new() -> Result<Self, ManifestError> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// Create a source with a custom request timeout.
    pub fn with_timeout(timeout: Duration) -> Result<Self, ManifestError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("agnos-flash/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ManifestError::Unavailable(format!("HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ManifestSource for HttpManifestSource {
    async fn fetch(&self, url: &str) -> Result<Vec<ManifestImage>, ManifestError> {
        info!("Fetching manifest from: {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ManifestError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ManifestError::Unavailable(format!(
                "server returned {} - {}",
                status,
                status.canonical_reason().unwrap_or("Unknown")
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ManifestError::Unavailable(e.to_string()))?;
        Ok(serde_json::from_str(&body)?)
    }
}

/// Reads manifests from the local filesystem
///
/// Accepts `file://` URLs and plain paths.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileManifestSource;

#[async_trait]
impl ManifestSource for FileManifestSource {
    async fn fetch(&self, url: &str) -> Result<Vec<ManifestImage>, ManifestError> {
        let path = Path::new(url.strip_prefix("file://").unwrap_or(url));
        debug!(path = %path.display(), "Reading manifest");
        let body = fs::read_to_string(path)
            .await
            .map_err(|e| ManifestError::Unavailable(format!("{}: {e}", path.display())))?;
        Ok(serde_json::from_str(&body)?)
    }
}

/// Serves the same image list for every URL
#[derive(Debug, Clone, Default)]
pub struct StaticManifestSource {
    images: Vec<ManifestImage>,
}

impl StaticManifestSource {
    /// Serve `images` unchanged.
    pub fn new(images: Vec<ManifestImage>) -> Self {
        Self { images }
    }
}

#[async_trait]
impl ManifestSource for StaticManifestSource {
    async fn fetch(&self, _url: &str) -> Result<Vec<ManifestImage>, ManifestError> {
        Ok(self.images.clone())
    }
}

/// Pick a source able to fetch `url`.
pub fn source_for_url(url: &str) -> Result<Arc<dyn ManifestSource>, ManifestError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(Arc::new(HttpManifestSource::new()?))
    } else {
        Ok(Arc::new(FileManifestSource))
    }
}
