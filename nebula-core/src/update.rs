//! Update agent - discovers, audits and pins new upstream installer releases
//!
//! A run is sequential and safe to repeat. Existing pins are never touched;
//! the only thing a rerun can change is a `latest` pointer left behind by an
//! interrupted earlier run.

use crate::fetch::{FetchError, Fetcher, ReleaseSource};
use crate::policy::{PolicyEngine, Violation};
use crate::trust::error::StoreError;
use crate::trust::hasher::hash_bytes;
use crate::trust::manifest::{compare_versions, ManifestEntry, PlatformSet};
use crate::trust::store::{ManifestWriter, PutOutcome};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Update agent configuration
#[derive(Debug, Clone)]
pub struct UpdateSettings {
    /// Where the installer script is fetched from
    pub installer_url: String,
    /// Platforms recorded on new pins
    pub allowed_platforms: PlatformSet,
    /// Where to write a copy of the audited script, if anywhere
    pub snapshot_path: Option<PathBuf>,
}

/// What a run did
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// The upstream release is already pinned and `latest` names it
    UpToDate { version: String },
    /// The release was pinned but `latest` lagged behind; it was advanced
    PointerRepaired { version: String },
    /// Dry run: the pointer would have been advanced
    WouldRepairPointer { version: String },
    /// Dry run: the script passed policy and would have been pinned
    WouldPin { entry: ManifestEntry },
    /// A new release was pinned and `latest` advanced to it
    Pinned {
        entry: ManifestEntry,
        snapshot: Option<PathBuf>,
    },
}

impl UpdateOutcome {
    pub fn version(&self) -> &str {
        match self {
            UpdateOutcome::UpToDate { version }
            | UpdateOutcome::PointerRepaired { version }
            | UpdateOutcome::WouldRepairPointer { version } => version,
            UpdateOutcome::WouldPin { entry } | UpdateOutcome::Pinned { entry, .. } => {
                &entry.version
            }
        }
    }
}

/// Update agent errors
#[derive(Error, Debug)]
pub enum UpdateError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// The new release failed the security policy; nothing was written
    #[error(
        "Installer for {version} violates the security policy ({} violation(s)):\n{}",
        .violations.len(),
        bullet_list(.violations)
    )]
    PolicyViolation {
        version: String,
        violations: Vec<Violation>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to write installer snapshot to {path}")]
    Snapshot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn bullet_list(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| format!("  - {v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Pins new upstream releases after auditing them
pub struct UpdateAgent {
    releases: Arc<dyn ReleaseSource>,
    fetcher: Arc<dyn Fetcher>,
    store: Arc<dyn ManifestWriter>,
    policy: PolicyEngine,
    settings: UpdateSettings,
}

impl UpdateAgent {
    pub fn new(
        releases: Arc<dyn ReleaseSource>,
        fetcher: Arc<dyn Fetcher>,
        store: Arc<dyn ManifestWriter>,
        policy: PolicyEngine,
        settings: UpdateSettings,
    ) -> Self {
        Self {
            releases,
            fetcher,
            store,
            policy,
            settings,
        }
    }

    /// Run one update. With `dry_run` nothing is written anywhere.
    pub async fn run(&self, dry_run: bool) -> Result<UpdateOutcome, UpdateError> {
        let tag = self.releases.latest_tag().await?;
        info!("Upstream latest release: {}", tag);

        let current = self.store.latest_version().await?;
        if let Some(current) = current.as_deref() {
            if compare_versions(current, &tag) == Some(Ordering::Greater) {
                warn!(
                    "Upstream reports {} but {} is already pinned as latest; leaving pointer alone",
                    tag, current
                );
                return Ok(UpdateOutcome::UpToDate {
                    version: current.to_string(),
                });
            }
        }

        match self.store.lookup(&tag).await {
            Ok(_) => return self.converge(tag, current, dry_run).await,
            Err(StoreError::NotFound { .. }) => {
                debug!("{} is not pinned yet", tag);
            }
            Err(e) => return Err(e.into()),
        }

        let script = self.fetcher.fetch(&self.settings.installer_url).await?;
        let hash = hash_bytes(&script);
        info!(
            "Fetched installer for {} ({} bytes, sha256 {})",
            tag,
            script.len(),
            hash
        );

        let violations = self.policy.evaluate(&String::from_utf8_lossy(&script));
        if !violations.is_empty() {
            error!(
                target: "security",
                "Installer for {} failed policy with {} violation(s); not pinning",
                tag,
                violations.len()
            );
            return Err(UpdateError::PolicyViolation {
                version: tag,
                violations,
            });
        }

        let entry = ManifestEntry::new(&tag, hash, self.settings.allowed_platforms.clone());
        if dry_run {
            info!("Dry run: would pin {} -> {}", tag, hash);
            return Ok(UpdateOutcome::WouldPin { entry });
        }

        // Snapshot first so a failed write leaves the store untouched
        let snapshot = match &self.settings.snapshot_path {
            Some(path) => Some(self.write_snapshot(path, &script).await?),
            None => None,
        };

        if self.store.put(&entry).await? == PutOutcome::AlreadyPinned {
            debug!("{} was pinned concurrently with an identical hash", tag);
        }
        self.store.advance_latest(&tag).await?;

        info!(
            "Pinned {} -> {}. Please run regression tests before pushing",
            entry.version, entry.integrity_hash
        );
        Ok(UpdateOutcome::Pinned { entry, snapshot })
    }

    /// The release is already pinned: make sure `latest` names it
    async fn converge(
        &self,
        tag: String,
        current: Option<String>,
        dry_run: bool,
    ) -> Result<UpdateOutcome, UpdateError> {
        if current.as_deref() == Some(tag.as_str()) {
            info!("{} is already pinned and current", tag);
            return Ok(UpdateOutcome::UpToDate { version: tag });
        }

        if dry_run {
            info!("Dry run: would advance latest pointer to {}", tag);
            return Ok(UpdateOutcome::WouldRepairPointer { version: tag });
        }

        warn!(
            "{} is pinned but latest points at {}; advancing pointer",
            tag,
            current.as_deref().unwrap_or("<unset>")
        );
        self.store.advance_latest(&tag).await?;
        Ok(UpdateOutcome::PointerRepaired { version: tag })
    }

    async fn write_snapshot(&self, path: &Path, script: &[u8]) -> Result<PathBuf, UpdateError> {
        let snapshot_err = |source| UpdateError::Snapshot {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(snapshot_err)?;
        }
        tokio::fs::write(path, script).await.map_err(snapshot_err)?;

        debug!("Wrote installer snapshot to {}", path.display());
        Ok(path.to_path_buf())
    }
}
