//! Verification gate - runtime enforcement of installer integrity
//!
//! One call to [`VerificationGate::verify`] is one attempt:
//! `FETCHING → HASHING → POLICY_CHECK → ADMIT | REJECT`. Terminal states are
//! final. The gate never retries and never executes what it admits.
//!
//! The policy engine is not re-run here. A digest match proves byte identity
//! with the script that was linted when it was pinned; the policy stage only
//! enforces the pin's platform constraint.

use crate::fetch::Fetcher;
use crate::trust::error::StoreError;
use crate::trust::hasher::{hash_bytes, IntegrityHash};
use crate::trust::manifest::{ManifestEntry, PlatformSet};
use crate::trust::store::ManifestReader;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Which pinned version to verify against
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Whatever the `latest` pointer names
    Latest,
    /// An explicit version
    Version(String),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Latest => f.write_str("latest"),
            Target::Version(v) => f.write_str(v),
        }
    }
}

/// States of a single verification attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateState {
    Fetching,
    Hashing,
    PolicyCheck,
    Admit,
    Reject,
}

impl GateState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, GateState::Admit | GateState::Reject)
    }
}

/// Why an attempt was rejected
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectReason {
    /// The installer (or a remote manifest record) could not be fetched
    FetchFailure { detail: String },
    /// No pin exists for the requested target
    NotPinned { detail: String },
    /// Fetched bytes do not match the pinned digest
    IntegrityMismatch {
        expected: IntegrityHash,
        actual: IntegrityHash,
    },
    /// The pin does not admit this platform
    PlatformNotAllowed {
        platform: String,
        allowed: PlatformSet,
    },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::FetchFailure { detail } => write!(f, "fetch failed: {detail}"),
            RejectReason::NotPinned { detail } => write!(f, "not pinned: {detail}"),
            RejectReason::IntegrityMismatch { expected, actual } => write!(
                f,
                "integrity mismatch: expected sha256 {expected}, got {actual}"
            ),
            RejectReason::PlatformNotAllowed { platform, allowed } => {
                write!(f, "platform {platform} not allowed (pinned for {allowed})")
            }
        }
    }
}

/// Terminal verdict of an attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Admit,
    Reject { reason: RejectReason },
}

/// Result of one verification attempt
#[derive(Debug, Clone, Serialize)]
pub struct VerificationResult {
    target: String,
    version: Option<String>,
    #[serde(flatten)]
    verdict: Verdict,
    expected_hash: Option<IntegrityHash>,
    actual_hash: Option<IntegrityHash>,
    states: Vec<GateState>,
    #[serde(skip)]
    script: Option<Vec<u8>>,
}

impl VerificationResult {
    pub fn is_admitted(&self) -> bool {
        matches!(self.verdict, Verdict::Admit)
    }

    pub fn verdict(&self) -> &Verdict {
        &self.verdict
    }

    pub fn reject_reason(&self) -> Option<&RejectReason> {
        match &self.verdict {
            Verdict::Reject { reason } => Some(reason),
            Verdict::Admit => None,
        }
    }

    /// Resolved version, once the manifest lookup has succeeded
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn expected_hash(&self) -> Option<&IntegrityHash> {
        self.expected_hash.as_ref()
    }

    pub fn actual_hash(&self) -> Option<&IntegrityHash> {
        self.actual_hash.as_ref()
    }

    /// States visited, ending in a terminal state
    pub fn states(&self) -> &[GateState] {
        &self.states
    }

    /// Verified script bytes; present only on admit
    pub fn script(&self) -> Option<&[u8]> {
        self.script.as_deref()
    }

    pub fn into_script(self) -> Option<Vec<u8>> {
        self.script
    }
}

/// Gate configuration
#[derive(Debug, Clone)]
pub struct GateSettings {
    /// Where the installer script is fetched from
    pub installer_url: String,
    /// Platform identifier the script would run on
    pub platform: String,
}

/// In-flight attempt bookkeeping
struct Attempt {
    result: VerificationResult,
}

impl Attempt {
    fn start(target: &Target) -> Self {
        Self {
            result: VerificationResult {
                target: target.to_string(),
                version: None,
                verdict: Verdict::Admit,
                expected_hash: None,
                actual_hash: None,
                states: Vec::new(),
                script: None,
            },
        }
    }

    fn enter(&mut self, state: GateState) {
        debug!("Verification of {} entering {:?}", self.result.target, state);
        self.result.states.push(state);
    }

    fn pinned(&mut self, entry: &ManifestEntry) {
        self.result.version = Some(entry.version.clone());
        self.result.expected_hash = Some(entry.integrity_hash);
    }

    fn reject(mut self, reason: RejectReason) -> VerificationResult {
        self.enter(GateState::Reject);
        warn!("Rejected installer for {}: {}", self.result.target, reason);
        self.result.verdict = Verdict::Reject { reason };
        self.result
    }

    fn admit(mut self, script: Vec<u8>) -> VerificationResult {
        self.enter(GateState::Admit);
        info!(
            "Admitted installer {} ({} bytes, sha256 {})",
            self.result.version.as_deref().unwrap_or("?"),
            script.len(),
            self.result.actual_hash.map(|h| h.short()).unwrap_or_default()
        );
        self.result.script = Some(script);
        self.result
    }
}

/// Fetches an installer and admits it only if it matches its pin
pub struct VerificationGate {
    fetcher: Arc<dyn Fetcher>,
    manifests: Arc<dyn ManifestReader>,
    settings: GateSettings,
}

impl VerificationGate {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        manifests: Arc<dyn ManifestReader>,
        settings: GateSettings,
    ) -> Self {
        Self {
            fetcher,
            manifests,
            settings,
        }
    }

    async fn lookup(&self, target: &Target) -> Result<ManifestEntry, StoreError> {
        match target {
            Target::Latest => self.manifests.resolve_latest().await,
            Target::Version(version) => self.manifests.lookup(version).await,
        }
    }

    /// Run one verification attempt.
    ///
    /// Every ordinary failure is reported as a REJECT verdict. `Err` is
    /// reserved for manifest corruption and store I/O failures, which must
    /// not be mistaken for a routine rejection.
    pub async fn verify(&self, target: &Target) -> Result<VerificationResult, StoreError> {
        let mut attempt = Attempt::start(target);

        attempt.enter(GateState::Fetching);
        debug!(
            "Fetching {} via {} fetcher",
            self.settings.installer_url,
            self.fetcher.name()
        );
        let script = match self.fetcher.fetch(&self.settings.installer_url).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return Ok(attempt.reject(RejectReason::FetchFailure {
                    detail: e.to_string(),
                }))
            }
        };

        attempt.enter(GateState::Hashing);
        let actual = hash_bytes(&script);
        attempt.result.actual_hash = Some(actual);

        let entry = match self.lookup(target).await {
            Ok(entry) => entry,
            Err(
                e @ (StoreError::NotFound { .. }
                | StoreError::PointerUnset
                | StoreError::InvalidVersion { .. }),
            ) => {
                return Ok(attempt.reject(RejectReason::NotPinned {
                    detail: e.to_string(),
                }))
            }
            Err(StoreError::Fetch(e)) => {
                return Ok(attempt.reject(RejectReason::FetchFailure {
                    detail: e.to_string(),
                }))
            }
            Err(e) => return Err(e),
        };
        attempt.pinned(&entry);

        if entry.integrity_hash != actual {
            error!(
                target: "security",
                "INSTALLER INTEGRITY FAILURE: {} from {} hashed to {}, pinned {}",
                entry.version,
                self.settings.installer_url,
                actual,
                entry.integrity_hash
            );
            return Ok(attempt.reject(RejectReason::IntegrityMismatch {
                expected: entry.integrity_hash,
                actual,
            }));
        }

        attempt.enter(GateState::PolicyCheck);
        if !entry.allowed_platforms.permits(&self.settings.platform) {
            return Ok(attempt.reject(RejectReason::PlatformNotAllowed {
                platform: self.settings.platform.clone(),
                allowed: entry.allowed_platforms.clone(),
            }));
        }

        Ok(attempt.admit(script))
    }
}
