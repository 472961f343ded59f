//! Test helpers shared across integration tests
//!
//! Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use async_trait::async_trait;
use nebula_core::fetch::{FetchError, Fetcher, ReleaseSource};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, Once};

pub const INSTALLER_URL: &str = "https://mise.run";

/// Initialize logging for tests (only once per test run)
static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .with_target(true)
                    .with_level(true),
            )
            .with(tracing_subscriber::filter::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Read a file from `tests/fixtures`
pub fn fixture(name: &str) -> Vec<u8> {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name);
    std::fs::read(&path).unwrap_or_else(|e| panic!("missing fixture {}: {e}", path.display()))
}

/// Fetcher serving canned responses; unknown URLs are 404
#[derive(Default)]
pub struct StaticFetcher {
    responses: Mutex<HashMap<String, Result<Vec<u8>, u16>>>,
    calls: AtomicUsize,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(self, url: &str, body: impl Into<Vec<u8>>) -> Self {
        self.set(url, body);
        self
    }

    pub fn fail(self, url: &str, status: u16) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), Err(status));
        self
    }

    /// Replace the response for `url`, e.g. to simulate an upstream change
    pub fn set(&self, url: &str, body: impl Into<Vec<u8>>) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), Ok(body.into()));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let response = self.responses.lock().unwrap().get(url).cloned();
        match response {
            Some(Ok(body)) => Ok(body),
            Some(Err(status)) => Err(FetchError::Status {
                url: url.to_string(),
                status,
            }),
            None => Err(FetchError::Status {
                url: url.to_string(),
                status: 404,
            }),
        }
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

/// Release source returning a fixed tag
pub struct StaticRelease(pub Mutex<String>);

impl StaticRelease {
    pub fn new(tag: &str) -> Self {
        Self(Mutex::new(tag.to_string()))
    }

    pub fn publish(&self, tag: &str) {
        *self.0.lock().unwrap() = tag.to_string();
    }
}

#[async_trait]
impl ReleaseSource for StaticRelease {
    async fn latest_tag(&self) -> Result<String, FetchError> {
        Ok(self.0.lock().unwrap().clone())
    }
}
