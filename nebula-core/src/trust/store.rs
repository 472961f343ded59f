//! Manifest store abstraction
//!
//! The store is an append-only registry of [`ManifestEntry`] records keyed by
//! version, plus a single `latest` pointer. Writers must follow
//! append-then-point: an entry is durably visible before any pointer can
//! reference it.

use crate::trust::error::StoreError;
use crate::trust::manifest::{compare_versions, validate_version, ManifestEntry};
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Result of a successful `put`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// A new record was written
    Created,
    /// An identical pin already existed; nothing was written
    AlreadyPinned,
}

/// Read half of the manifest store
#[async_trait]
pub trait ManifestReader: Send + Sync {
    /// Look up the entry pinned for a version
    async fn lookup(&self, version: &str) -> Result<ManifestEntry, StoreError>;

    /// The version the `latest` pointer currently names, if any
    async fn latest_version(&self) -> Result<Option<String>, StoreError>;

    /// Dereference the `latest` pointer
    async fn resolve_latest(&self) -> Result<ManifestEntry, StoreError> {
        let version = self.latest_version().await?.ok_or(StoreError::PointerUnset)?;

        match self.lookup(&version).await {
            Ok(entry) => Ok(entry),
            Err(StoreError::NotFound { version }) => {
                let err = StoreError::BrokenPointer { version };
                err.log_if_security_critical();
                Err(err)
            }
            Err(e) => Err(e),
        }
    }
}

/// Write half of the manifest store
#[async_trait]
pub trait ManifestWriter: ManifestReader {
    /// Append an entry. Identical re-puts are no-ops; a different hash for an
    /// existing version is refused.
    async fn put(&self, entry: &ManifestEntry) -> Result<PutOutcome, StoreError>;

    /// Point `latest` at an already-pinned version
    async fn advance_latest(&self, version: &str) -> Result<(), StoreError>;
}

/// Decide whether `existing` may be replaced by `entry`
pub(crate) fn check_repin(existing: &ManifestEntry, entry: &ManifestEntry) -> Result<PutOutcome, StoreError> {
    if existing.integrity_hash == entry.integrity_hash {
        debug!("Version {} already pinned with identical hash", entry.version);
        return Ok(PutOutcome::AlreadyPinned);
    }

    let err = StoreError::DuplicateVersion {
        version: entry.version.clone(),
        existing: existing.integrity_hash,
        attempted: entry.integrity_hash,
    };
    err.log_if_security_critical();
    Err(err)
}

/// Refuse to move `latest` backwards between two comparable versions
pub(crate) fn check_forward(current: Option<&str>, requested: &str) -> Result<(), StoreError> {
    if let Some(current) = current {
        if compare_versions(current, requested) == Some(Ordering::Greater) {
            return Err(StoreError::PointerRegression {
                current: current.to_string(),
                requested: requested.to_string(),
            });
        }
    }
    Ok(())
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: BTreeMap<String, ManifestEntry>,
    latest: Option<String>,
}

/// In-process manifest store
///
/// Entries and pointer live under one lock, so `advance_latest` observes and
/// moves the pointer atomically with respect to `lookup`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pinned versions
    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ManifestReader for MemoryStore {
    async fn lookup(&self, version: &str) -> Result<ManifestEntry, StoreError> {
        validate_version(version)?;
        self.state
            .read()
            .await
            .entries
            .get(version)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                version: version.to_string(),
            })
    }

    async fn latest_version(&self) -> Result<Option<String>, StoreError> {
        Ok(self.state.read().await.latest.clone())
    }
}

#[async_trait]
impl ManifestWriter for MemoryStore {
    async fn put(&self, entry: &ManifestEntry) -> Result<PutOutcome, StoreError> {
        validate_version(&entry.version)?;
        let mut state = self.state.write().await;

        if let Some(existing) = state.entries.get(&entry.version) {
            return check_repin(existing, entry);
        }

        state.entries.insert(entry.version.clone(), entry.clone());
        info!("Pinned {} -> {}", entry.version, entry.integrity_hash.short());
        Ok(PutOutcome::Created)
    }

    async fn advance_latest(&self, version: &str) -> Result<(), StoreError> {
        validate_version(version)?;
        let mut state = self.state.write().await;

        if !state.entries.contains_key(version) {
            return Err(StoreError::DanglingPointer {
                version: version.to_string(),
            });
        }

        check_forward(state.latest.as_deref(), version)?;

        if state.latest.as_deref() != Some(version) {
            info!("Advancing latest pointer to {}", version);
            state.latest = Some(version.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::hasher::hash_bytes;
    use crate::trust::manifest::PlatformSet;
    use std::sync::Arc;

    fn entry(version: &str, script: &[u8]) -> ManifestEntry {
        ManifestEntry::new(version, hash_bytes(script), PlatformSet::unrestricted())
    }

    #[tokio::test]
    async fn test_lookup_missing_version() {
        let store = MemoryStore::new();
        let result = store.lookup("v1.0.0").await;
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_put_is_idempotent_for_identical_hash() {
        let store = MemoryStore::new();
        let e = entry("v1.0.0", b"script");

        assert_eq!(store.put(&e).await.unwrap(), PutOutcome::Created);
        assert_eq!(store.put(&e).await.unwrap(), PutOutcome::AlreadyPinned);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_put_refuses_different_hash() {
        let store = MemoryStore::new();
        store.put(&entry("v1.0.0", b"original")).await.unwrap();

        let result = store.put(&entry("v1.0.0", b"tampered")).await;
        assert!(matches!(result, Err(StoreError::DuplicateVersion { .. })));

        // The original pin is untouched
        let pinned = store.lookup("v1.0.0").await.unwrap();
        assert_eq!(pinned.integrity_hash, hash_bytes(b"original"));
    }

    #[tokio::test]
    async fn test_advance_latest_requires_entry() {
        let store = MemoryStore::new();
        let result = store.advance_latest("v1.0.0").await;
        assert!(matches!(result, Err(StoreError::DanglingPointer { .. })));
        assert_eq!(store.latest_version().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_resolve_latest() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.resolve_latest().await,
            Err(StoreError::PointerUnset)
        ));

        store.put(&entry("v1.0.0", b"one")).await.unwrap();
        store.advance_latest("v1.0.0").await.unwrap();

        let latest = store.resolve_latest().await.unwrap();
        assert_eq!(latest.version, "v1.0.0");
    }

    #[tokio::test]
    async fn test_advance_latest_is_forward_only() {
        let store = MemoryStore::new();
        store.put(&entry("v1.0.0", b"one")).await.unwrap();
        store.put(&entry("v2.0.0", b"two")).await.unwrap();

        store.advance_latest("v2.0.0").await.unwrap();
        store.advance_latest("v2.0.0").await.unwrap();

        let result = store.advance_latest("v1.0.0").await;
        assert!(matches!(result, Err(StoreError::PointerRegression { .. })));
        assert_eq!(store.latest_version().await.unwrap().as_deref(), Some("v2.0.0"));
    }

    #[tokio::test]
    async fn test_concurrent_puts_for_different_versions() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();

        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let e = entry(&format!("v1.0.{i}"), format!("script {i}").as_bytes());
                store.put(&e).await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), PutOutcome::Created);
        }

        assert_eq!(store.len().await, 16);
        for i in 0..16 {
            let pinned = store.lookup(&format!("v1.0.{i}")).await.unwrap();
            assert_eq!(pinned.integrity_hash, hash_bytes(format!("script {i}").as_bytes()));
        }
    }
}
