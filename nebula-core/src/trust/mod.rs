//! Nebula trust system - integrity pinning for remote installer scripts
//!
//! An installer is admitted only when the SHA-256 of the fetched bytes
//! matches the digest recorded when that release was audited. Pins live in
//! an append-only manifest store with a single `latest` pointer.
//!
//! Invariants:
//! - A pinned entry is never modified or replaced
//! - `latest` only ever names an entry that already exists
//! - The gate holds no state between attempts

pub mod directory;
pub mod error;
pub mod hasher;
pub mod manifest;
pub mod remote;
pub mod store;
pub mod verifier;

pub use directory::DirectoryStore;
pub use error::StoreError;
pub use hasher::{hash_bytes, IntegrityHash};
pub use manifest::{ManifestEntry, PlatformSet};
pub use remote::RemoteManifest;
pub use store::{ManifestReader, ManifestWriter, MemoryStore, PutOutcome};
pub use verifier::{GateSettings, GateState, RejectReason, Target, VerificationGate, VerificationResult, Verdict};
