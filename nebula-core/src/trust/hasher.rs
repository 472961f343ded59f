//! Cryptographic hashing utilities for the trust system
//!
//! Uses SHA-256 over the exact installer bytes. Digests are carried as
//! [`IntegrityHash`] and rendered as 64 lowercase hex characters.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Prefix accepted (and stripped) when parsing digests
const SHA256_PREFIX: &str = "sha256:";

/// A SHA-256 digest of installer bytes
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IntegrityHash([u8; 32]);

impl IntegrityHash {
    /// Lowercase hex rendering (no prefix)
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short form for log lines
    pub fn short(&self) -> String {
        self.to_hex()[..16].to_string()
    }
}

/// Error returned when a string is not a valid SHA-256 hex digest
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid sha256 digest '{input}': expected 64 hex characters")]
pub struct InvalidHash {
    pub input: String,
}

impl FromStr for IntegrityHash {
    type Err = InvalidHash;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let hex_part = trimmed.strip_prefix(SHA256_PREFIX).unwrap_or(trimmed);

        if hex_part.len() != 64 {
            return Err(InvalidHash {
                input: s.to_string(),
            });
        }

        let mut bytes = [0u8; 32];
        hex::decode_to_slice(hex_part, &mut bytes).map_err(|_| InvalidHash {
            input: s.to_string(),
        })?;

        Ok(IntegrityHash(bytes))
    }
}

impl fmt::Display for IntegrityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for IntegrityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IntegrityHash({})", self.to_hex())
    }
}

impl Serialize for IntegrityHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for IntegrityHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Hash a byte slice using SHA-256
pub fn hash_bytes(content: &[u8]) -> IntegrityHash {
    let mut hasher = Sha256::new();
    hasher.update(content);
    IntegrityHash(hasher.finalize().into())
}

/// Hash a file's contents using SHA-256
pub async fn hash_file(path: &Path) -> Result<IntegrityHash> {
    let contents = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read file for hashing: {}", path.display()))?;

    Ok(hash_bytes(&contents))
}
