//! Manifest entry structure and the on-disk record format
//!
//! A manifest entry pins one audited release of the installer script to the
//! SHA-256 of its exact bytes. Records are stored as shell-sourceable
//! `KEY=VALUE` lines so the shell installer can read them without a parser:
//!
//! ```text
//! BOOTSTRAPPER_SHA256=<64 hex chars>
//! ALLOWED_PLATFORMS=linux-x64,linux-arm64
//! PINNED_AT=2025-01-06T12:00:00Z
//! ```

use crate::trust::error::StoreError;
use crate::trust::hasher::IntegrityHash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

/// Key holding the pinned digest
pub const HASH_KEY: &str = "BOOTSTRAPPER_SHA256";

/// Key holding the comma-separated platform list
pub const PLATFORMS_KEY: &str = "ALLOWED_PLATFORMS";

/// Key holding the pin timestamp
pub const PINNED_AT_KEY: &str = "PINNED_AT";

/// Longest accepted version identifier
const MAX_VERSION_LEN: usize = 128;

/// Validate an untrusted version identifier before it is used as a key
///
/// Versions become file names in the directory layout and path segments in
/// remote URLs, so anything outside `[A-Za-z0-9._+-]` is refused.
pub fn validate_version(version: &str) -> Result<(), StoreError> {
    let invalid = || StoreError::InvalidVersion {
        version: version.to_string(),
    };

    if version.is_empty() || version.len() > MAX_VERSION_LEN {
        return Err(invalid());
    }

    let mut chars = version.chars();
    if !chars.next().is_some_and(|c| c.is_ascii_alphanumeric()) {
        return Err(invalid());
    }

    if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '+' | '-')) {
        return Err(invalid());
    }

    Ok(())
}

/// Compare two version identifiers when both are semantic versions
///
/// A leading `v` is ignored. Returns `None` for opaque identifiers, which
/// carry no ordering.
pub fn compare_versions(a: &str, b: &str) -> Option<Ordering> {
    let parse = |v: &str| semver::Version::parse(v.strip_prefix('v').unwrap_or(v)).ok();
    Some(parse(a)?.cmp(&parse(b)?))
}

/// Set of platform identifiers an entry is valid for
///
/// The empty set means no platform restriction is enforced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlatformSet(BTreeSet<String>);

impl PlatformSet {
    /// An unrestricted set
    pub fn unrestricted() -> Self {
        PlatformSet(BTreeSet::new())
    }

    /// Does this set admit the given platform?
    pub fn permits(&self, platform: &str) -> bool {
        self.0.is_empty() || self.0.contains(platform)
    }

    pub fn is_unrestricted(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Parse the comma-separated record form
    pub fn parse_list(raw: &str) -> Self {
        raw.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Render the comma-separated record form
    pub fn to_list(&self) -> String {
        self.iter().collect::<Vec<_>>().join(",")
    }
}

impl<S: Into<String>> FromIterator<S> for PlatformSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        PlatformSet(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for PlatformSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unrestricted() {
            f.write_str("<any>")
        } else {
            f.write_str(&self.to_list())
        }
    }
}

/// One audited release of the installer script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Release tag, unique key
    pub version: String,

    /// SHA-256 of the exact installer bytes audited for this version
    pub integrity_hash: IntegrityHash,

    /// Platforms this entry is valid for (empty = any)
    #[serde(default)]
    pub allowed_platforms: PlatformSet,

    /// When the entry was pinned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_at: Option<DateTime<Utc>>,
}

impl ManifestEntry {
    /// Create an entry pinned now
    pub fn new(version: &str, integrity_hash: IntegrityHash, allowed_platforms: PlatformSet) -> Self {
        ManifestEntry {
            version: version.to_string(),
            integrity_hash,
            allowed_platforms,
            pinned_at: Some(Utc::now()),
        }
    }

    /// Two entries pin the same bytes; metadata is not compared
    pub fn same_pin(&self, other: &ManifestEntry) -> bool {
        self.version == other.version && self.integrity_hash == other.integrity_hash
    }

    /// Render the shell-sourceable record
    pub fn to_record(&self) -> String {
        let mut record = format!(
            "{HASH_KEY}={}\n{PLATFORMS_KEY}={}\n",
            self.integrity_hash,
            self.allowed_platforms.to_list()
        );
        if let Some(pinned_at) = &self.pinned_at {
            record.push_str(&format!("{PINNED_AT_KEY}={}\n", pinned_at.to_rfc3339()));
        }
        record
    }

    /// Parse a record for the given version
    ///
    /// Unknown keys, blank lines and `#` comments are ignored. Values may be
    /// wrapped in single or double quotes.
    pub fn from_record(version: &str, record: &str) -> Result<Self, StoreError> {
        let malformed = |detail: String| StoreError::Malformed {
            version: version.to_string(),
            detail,
        };

        let mut integrity_hash = None;
        let mut allowed_platforms = PlatformSet::unrestricted();
        let mut pinned_at = None;

        for (idx, line) in record.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(malformed(format!("line {} is not KEY=VALUE", idx + 1)));
            };
            let value = unquote(value.trim());

            match key.trim() {
                HASH_KEY => {
                    let hash = value
                        .parse::<IntegrityHash>()
                        .map_err(|e| malformed(e.to_string()))?;
                    integrity_hash = Some(hash);
                }
                PLATFORMS_KEY => allowed_platforms = PlatformSet::parse_list(value),
                PINNED_AT_KEY => {
                    let ts = DateTime::parse_from_rfc3339(value)
                        .map_err(|e| malformed(format!("{PINNED_AT_KEY}: {e}")))?;
                    pinned_at = Some(ts.with_timezone(&Utc));
                }
                _ => {}
            }
        }

        let integrity_hash = integrity_hash.ok_or_else(|| malformed(format!("missing {HASH_KEY}")))?;

        Ok(ManifestEntry {
            version: version.to_string(),
            integrity_hash,
            allowed_platforms,
            pinned_at,
        })
    }
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|v| v.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}
