//! Read-only manifest view over a [`Fetcher`]
//!
//! Used at install time, when manifests are read from the published
//! repository (`<base>/<version>.conf`, `<base>/latest`) rather than a
//! local checkout.

use crate::fetch::Fetcher;
use crate::trust::directory::{LATEST_FILE, RECORD_EXTENSION};
use crate::trust::error::StoreError;
use crate::trust::manifest::{validate_version, ManifestEntry};
use crate::trust::store::ManifestReader;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Manifest records served over HTTPS
pub struct RemoteManifest {
    fetcher: Arc<dyn Fetcher>,
    base_url: String,
}

impl RemoteManifest {
    pub fn new(fetcher: Arc<dyn Fetcher>, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { fetcher, base_url }
    }

    fn record_url(&self, name: &str) -> String {
        format!("{}/{}", self.base_url, name)
    }

    fn decode(name: &str, body: Vec<u8>) -> Result<String, StoreError> {
        String::from_utf8(body).map_err(|_| StoreError::Malformed {
            version: name.to_string(),
            detail: "record is not valid UTF-8".to_string(),
        })
    }
}

#[async_trait]
impl ManifestReader for RemoteManifest {
    async fn lookup(&self, version: &str) -> Result<ManifestEntry, StoreError> {
        validate_version(version)?;
        let url = self.record_url(&format!("{version}.{RECORD_EXTENSION}"));
        debug!("Reading remote manifest record {}", url);

        match self.fetcher.fetch(&url).await {
            Ok(body) => ManifestEntry::from_record(version, &Self::decode(version, body)?),
            Err(e) if e.is_not_found() => Err(StoreError::NotFound {
                version: version.to_string(),
            }),
            Err(e) => Err(StoreError::Fetch(e)),
        }
    }

    async fn latest_version(&self) -> Result<Option<String>, StoreError> {
        let url = self.record_url(LATEST_FILE);

        let body = match self.fetcher.fetch(&url).await {
            Ok(body) => body,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(StoreError::Fetch(e)),
        };

        let content = Self::decode(LATEST_FILE, body)?;
        let version = content.trim();
        validate_version(version).map_err(|_| StoreError::Malformed {
            version: LATEST_FILE.to_string(),
            detail: format!("pointer does not name a valid version: {version:?}"),
        })?;

        Ok(Some(version.to_string()))
    }
}
