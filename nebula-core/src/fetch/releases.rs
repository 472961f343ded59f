//! Upstream release discovery
//!
//! Release metadata is untrusted: only the tag string is used, and only
//! after it passes version validation.

use super::{FetchError, Fetcher};
use crate::trust::manifest::validate_version;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

/// Default release endpoint for the upstream tool
pub const DEFAULT_RELEASE_API_URL: &str = "https://api.github.com/repos/jdx/mise/releases/latest";

/// Source of the latest published version tag
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// The most recent published version tag
    async fn latest_tag(&self) -> Result<String, FetchError>;
}

/// Subset of the GitHub "latest release" payload we read
#[derive(Debug, Deserialize)]
struct LatestRelease {
    tag_name: String,
}

/// GitHub releases API reader
pub struct GithubReleases {
    fetcher: Arc<dyn Fetcher>,
    api_url: String,
}

impl GithubReleases {
    pub fn new(fetcher: Arc<dyn Fetcher>, api_url: impl Into<String>) -> Self {
        Self {
            fetcher,
            api_url: api_url.into(),
        }
    }
}

#[async_trait]
impl ReleaseSource for GithubReleases {
    async fn latest_tag(&self) -> Result<String, FetchError> {
        let body = self.fetcher.fetch(&self.api_url).await?;

        let invalid = |detail: String| FetchError::InvalidMetadata {
            url: self.api_url.clone(),
            detail,
        };

        let release: LatestRelease =
            serde_json::from_slice(&body).map_err(|e| invalid(e.to_string()))?;
        let tag = release.tag_name.trim().to_string();
        validate_version(&tag).map_err(|e| invalid(e.to_string()))?;

        debug!("Latest upstream release tag: {}", tag);
        Ok(tag)
    }
}
