//! Directory-backed manifest store
//!
//! Layout (compatible with the shell installer):
//!
//! ```text
//! manifests/mise/
//! ├── v2025.1.5.conf   # BOOTSTRAPPER_SHA256=..., ALLOWED_PLATFORMS=...
//! ├── v2025.1.6.conf
//! └── latest           # "v2025.1.6"
//! ```
//!
//! Entry files are created with no-clobber semantics so an existing pin can
//! never be overwritten, even by a concurrent writer in another process. The
//! pointer file is replaced atomically by rename, and only after the entry
//! it names has been synced to disk.
//!
//! Writers in different processes serialise on an advisory lock held on
//! `<root>/.lock` for the whole check-then-write sequence of `put` and
//! `advance_latest`.

use crate::trust::error::StoreError;
use crate::trust::manifest::{validate_version, ManifestEntry};
use crate::trust::store::{check_forward, check_repin, ManifestReader, ManifestWriter, PutOutcome};
use async_trait::async_trait;
use fs4::fs_std::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Name of the pointer file
pub const LATEST_FILE: &str = "latest";

/// Extension of entry records
pub const RECORD_EXTENSION: &str = "conf";

/// Advisory lock file shared by every writer of the directory
pub const LOCK_FILE: &str = ".lock";

/// Manifest store persisted as one file per version plus a pointer file
#[derive(Debug)]
pub struct DirectoryStore {
    root: PathBuf,
    /// Single-writer discipline within this process; `.lock` covers the rest
    writer: Mutex<()>,
}

impl DirectoryStore {
    /// Open a store rooted at `root`; the directory is created on first write
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirectoryStore {
            root: root.into(),
            writer: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, version: &str) -> PathBuf {
        self.root.join(format!("{version}.{RECORD_EXTENSION}"))
    }

    fn pointer_path(&self) -> PathBuf {
        self.root.join(LATEST_FILE)
    }

    /// All pinned versions, sorted
    pub fn versions(&self) -> Result<Vec<String>, StoreError> {
        let read_err = |source| StoreError::ReadError {
            path: self.root.clone(),
            source,
        };

        let dir = match std::fs::read_dir(&self.root) {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(read_err(e)),
        };

        let mut versions = Vec::new();
        for item in dir {
            let path = item.map_err(read_err)?.path();
            if path.extension().is_some_and(|ext| ext == RECORD_EXTENSION) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    if validate_version(stem).is_ok() {
                        versions.push(stem.to_string());
                    }
                }
            }
        }

        versions.sort();
        Ok(versions)
    }

    fn read_entry(&self, version: &str) -> Result<ManifestEntry, StoreError> {
        let path = self.entry_path(version);
        match std::fs::read_to_string(&path) {
            Ok(content) => ManifestEntry::from_record(version, &content),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound {
                version: version.to_string(),
            }),
            Err(e) => Err(StoreError::ReadError { path, source: e }),
        }
    }

    /// Block until this process holds the directory's writer lock.
    ///
    /// The lock is released when the returned file is dropped.
    async fn lock_writers(&self) -> Result<File, StoreError> {
        let path = self.root.join(LOCK_FILE);
        let root = self.root.clone();

        let locked = tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&root)?;
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(root.join(LOCK_FILE))?;
            FileExt::lock_exclusive(&file)?;
            Ok::<_, std::io::Error>(file)
        })
        .await
        .map_err(|e| StoreError::WriteError {
            path: path.clone(),
            source: std::io::Error::other(e),
        })?;

        locked.map_err(|source| StoreError::WriteError { path, source })
    }

    /// Write `content` to a synced temp file inside the store directory
    fn stage(&self, content: &str) -> Result<NamedTempFile, StoreError> {
        let write_err = |source| StoreError::WriteError {
            path: self.root.clone(),
            source,
        };

        std::fs::create_dir_all(&self.root).map_err(write_err)?;
        let mut staged = NamedTempFile::new_in(&self.root).map_err(write_err)?;
        staged.write_all(content.as_bytes()).map_err(write_err)?;
        staged.as_file().sync_all().map_err(write_err)?;
        Ok(staged)
    }
}

#[async_trait]
impl ManifestReader for DirectoryStore {
    async fn lookup(&self, version: &str) -> Result<ManifestEntry, StoreError> {
        validate_version(version)?;
        self.read_entry(version)
    }

    async fn latest_version(&self) -> Result<Option<String>, StoreError> {
        let path = self.pointer_path();
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::ReadError { path, source: e }),
        };

        let version = content.trim();
        validate_version(version).map_err(|_| StoreError::Malformed {
            version: LATEST_FILE.to_string(),
            detail: format!("pointer does not name a valid version: {version:?}"),
        })?;

        Ok(Some(version.to_string()))
    }
}

#[async_trait]
impl ManifestWriter for DirectoryStore {
    async fn put(&self, entry: &ManifestEntry) -> Result<PutOutcome, StoreError> {
        validate_version(&entry.version)?;
        let _guard = self.writer.lock().await;
        let _lock = self.lock_writers().await?;

        match self.read_entry(&entry.version) {
            Ok(existing) => return check_repin(&existing, entry),
            Err(StoreError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        let path = self.entry_path(&entry.version);
        let staged = self.stage(&entry.to_record())?;

        match staged.persist_noclobber(&path) {
            Ok(_) => {
                info!(
                    "Pinned {} -> {} ({})",
                    entry.version,
                    entry.integrity_hash.short(),
                    path.display()
                );
                Ok(PutOutcome::Created)
            }
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
                // Another process pinned the same version between our check and persist
                debug!("Lost race pinning {}; comparing with winner", entry.version);
                let existing = self.read_entry(&entry.version)?;
                check_repin(&existing, entry)
            }
            Err(e) => Err(StoreError::WriteError {
                path,
                source: e.error,
            }),
        }
    }

    async fn advance_latest(&self, version: &str) -> Result<(), StoreError> {
        validate_version(version)?;

        // Entries are never removed, so existence holds once observed
        match self.read_entry(version) {
            Ok(_) => {}
            Err(StoreError::NotFound { .. }) => {
                return Err(StoreError::DanglingPointer {
                    version: version.to_string(),
                })
            }
            Err(e) => return Err(e),
        }

        let _guard = self.writer.lock().await;
        let _lock = self.lock_writers().await?;

        let current = self.latest_version().await?;
        check_forward(current.as_deref(), version)?;
        if current.as_deref() == Some(version) {
            debug!("Latest pointer already at {}", version);
            return Ok(());
        }

        let path = self.pointer_path();
        let staged = self.stage(version)?;
        staged.persist(&path).map_err(|e| StoreError::WriteError {
            path: path.clone(),
            source: e.error,
        })?;

        info!("Advanced latest pointer to {}", version);
        Ok(())
    }
}
