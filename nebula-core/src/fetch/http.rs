//! HTTPS fetcher backed by reqwest
//!
//! Every request is bounded by a timeout and a body size cap, plain http is
//! refused (including on redirect), and an optional bearer token is attached
//! only to GitHub API requests.

use super::{FetchError, Fetcher};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Host that receives the bearer token
pub const TOKEN_HOST: &str = "api.github.com";

/// Upper bound on followed redirects
const MAX_REDIRECTS: usize = 5;

/// Transport settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchSettings {
    /// Timeout for a single request in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Largest accepted response body
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,

    /// Environment variable holding an optional API token
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout(),
            max_bytes: default_max_bytes(),
            token_env: default_token_env(),
        }
    }
}

fn default_timeout() -> u64 {
    30
}

fn default_max_bytes() -> u64 {
    8 * 1024 * 1024
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

/// reqwest-based [`Fetcher`]
pub struct HttpFetcher {
    client: reqwest::Client,
    max_bytes: u64,
    token: Option<String>,
}

impl HttpFetcher {
    /// Create a fetcher; the token is read once from `settings.token_env`
    pub fn new(settings: &FetchSettings) -> Result<Self> {
        let token = std::env::var(&settings.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty());
        Self::with_token(settings, token)
    }

    /// Create a fetcher with an explicit token
    pub fn with_token(settings: &FetchSettings, token: Option<String>) -> Result<Self> {
        // Clamp timeout to at least one second; zero would disable it
        let timeout_seconds = if settings.timeout_seconds == 0 {
            warn!("Configured timeout_seconds=0 would disable the timeout; using 1 second");
            1
        } else {
            settings.timeout_seconds
        };

        let redirect = reqwest::redirect::Policy::custom(|attempt| {
            if attempt.url().scheme() != "https" {
                attempt.error("redirect to a non-https URL")
            } else if attempt.previous().len() >= MAX_REDIRECTS {
                attempt.stop()
            } else {
                attempt.follow()
            }
        });

        let client = reqwest::Client::builder()
            .user_agent(concat!("nebula/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(timeout_seconds))
            .redirect(redirect)
            .https_only(true)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            max_bytes: settings.max_bytes,
            token,
        })
    }

    fn transport_error(url: &str, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
            }
        } else {
            FetchError::Transport {
                url: url.to_string(),
                message: err.to_string(),
            }
        }
    }
}

/// Parse and check a URL before any request is made
pub fn require_https(url: &str) -> Result<Url, FetchError> {
    let parsed = Url::parse(url).map_err(|e| FetchError::InvalidUrl {
        url: url.to_string(),
        detail: e.to_string(),
    })?;

    if parsed.scheme() != "https" {
        return Err(FetchError::InsecureUrl {
            url: url.to_string(),
        });
    }

    Ok(parsed)
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let parsed = require_https(url)?;
        debug!("Fetching {}", parsed);

        let mut request = self.client.get(parsed.clone());
        if let Some(token) = &self.token {
            if parsed.host_str() == Some(TOKEN_HOST) {
                request = request.bearer_auth(token);
            }
        }

        let mut response = request
            .send()
            .await
            .map_err(|e| Self::transport_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let too_large = || FetchError::TooLarge {
            url: url.to_string(),
            limit: self.max_bytes,
        };

        if response.content_length().is_some_and(|len| len > self.max_bytes) {
            return Err(too_large());
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| Self::transport_error(url, e))?
        {
            if (body.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }

        debug!("Fetched {} bytes from {}", body.len(), url);
        Ok(body)
    }

    fn name(&self) -> &'static str {
        "https"
    }
}
