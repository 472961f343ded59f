//! Fetcher - retrieves remote bytes over an authenticated transport
//!
//! Release metadata, installer scripts and remote manifest records all come
//! through a [`Fetcher`]. Fetchers are stateless and never retry; callers
//! decide whether a failure is worth another attempt.

pub mod http;
pub mod releases;

pub use http::{FetchSettings, HttpFetcher};
pub use releases::{GithubReleases, ReleaseSource};

use async_trait::async_trait;
use thiserror::Error;

/// Transport-level failures. All of them are transient from the gate's
/// point of view: the attempt is rejected and the caller may retry.
#[derive(Error, Debug)]
pub enum FetchError {
    /// Only https:// is accepted
    #[error("Refusing to fetch '{url}': only https:// URLs are allowed")]
    InsecureUrl { url: String },

    /// URL could not be parsed
    #[error("Invalid URL '{url}': {detail}")]
    InvalidUrl { url: String, detail: String },

    /// Request exceeded the configured timeout
    #[error("Timed out fetching {url}")]
    Timeout { url: String },

    /// Server answered with a non-success status
    #[error("HTTP {status} fetching {url}")]
    Status { url: String, status: u16 },

    /// Body exceeded the configured size cap
    #[error("Response from {url} exceeds the {limit} byte limit")]
    TooLarge { url: String, limit: u64 },

    /// Connection, TLS or protocol failure
    #[error("Transport error fetching {url}: {message}")]
    Transport { url: String, message: String },

    /// Payload arrived but could not be interpreted
    #[error("Invalid metadata from {url}: {detail}")]
    InvalidMetadata { url: String, detail: String },
}

impl FetchError {
    /// The remote resource does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::Status { status: 404, .. })
    }
}

/// Trait for byte sources
///
/// Implementations must bound the time they spend on a single call.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Retrieve the full body at `url`
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;

    /// Fetcher identifier for logging/debugging
    fn name(&self) -> &'static str;
}
