//! Manifest store error types with clear, actionable messages

use crate::fetch::FetchError;
use crate::trust::hasher::IntegrityHash;
use std::path::PathBuf;
use thiserror::Error;

/// Manifest store specific errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// No entry is pinned for this version
    #[error("No manifest entry is pinned for version '{version}'")]
    NotFound { version: String },

    /// The latest pointer has never been written
    #[error("The manifest has no 'latest' pointer yet.\n\nPin a release first, run:\n  nebula update")]
    PointerUnset,

    /// The latest pointer references an entry that does not exist
    #[error("SECURITY ALERT: manifest 'latest' pointer references missing version '{version}'.\n\nEntries are written before the pointer is advanced, so this indicates a storage\nfault or an out-of-band edit. Inspect the manifest directory before trusting it.")]
    BrokenPointer { version: String },

    /// A different hash is already pinned for this version
    #[error("Version '{version}' is already pinned with a different hash.\n\nPinned:    {existing}\nAttempted: {attempted}\n\nPinned hashes are immutable. Publish the new script under a new version.")]
    DuplicateVersion {
        version: String,
        existing: IntegrityHash,
        attempted: IntegrityHash,
    },

    /// Tried to point 'latest' at a version with no entry
    #[error("Refusing to point 'latest' at version '{version}': no entry is pinned for it")]
    DanglingPointer { version: String },

    /// Tried to move 'latest' backwards
    #[error("Refusing to move 'latest' backwards from '{current}' to '{requested}'.\n\nRollback is a separately audited operation and is not performed automatically.")]
    PointerRegression { current: String, requested: String },

    /// Version identifier is not acceptable as a manifest key
    #[error("Invalid version identifier '{version}': expected [A-Za-z0-9._+-], starting with an alphanumeric character")]
    InvalidVersion { version: String },

    /// A stored record could not be parsed
    #[error("Manifest record for '{version}' is malformed: {detail}")]
    Malformed { version: String, detail: String },

    /// Failed to read from the manifest directory
    #[error("Failed to read manifest record from {path}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to write to the manifest directory
    #[error("Failed to write manifest record to {path}")]
    WriteError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Remote manifest could not be retrieved
    #[error("Failed to fetch remote manifest record")]
    Fetch(#[from] FetchError),
}

impl StoreError {
    /// Corruption-class errors indicate a logic or storage bug and are never self-healed
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StoreError::BrokenPointer { .. }
                | StoreError::DanglingPointer { .. }
                | StoreError::Malformed { .. }
        )
    }

    /// Log security-critical store errors
    pub fn log_if_security_critical(&self) {
        if self.is_corruption() || matches!(self, StoreError::DuplicateVersion { .. }) {
            tracing::error!(target: "security", "MANIFEST INTEGRITY: {}", self);
        }
    }
}
