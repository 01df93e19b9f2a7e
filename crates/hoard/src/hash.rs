//! ContentHash: a content digest truncated to 128 bits (32 hex chars).
//!
//! BLAKE3 is the default for its speed and the ability to safely use
//! shorter hashes while maintaining collision resistance. SHA-256 is
//! available for callers that need a FIPS-friendly digest. Either way the
//! hash is truncated to 128 bits, which is more than enough for content
//! addressing while keeping hashes human-manageable.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::Digest;
use thiserror::Error;

/// A content hash - 128 bits (16 bytes, 32 hex chars) of the configured digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

/// Errors that can occur when working with content hashes.
#[derive(Debug, Error)]
pub enum HashError {
    #[error("invalid hash length: expected 32 hex chars, got {0}")]
    InvalidLength(usize),

    #[error("invalid hex character in hash")]
    InvalidHex,
}

/// Digest algorithm used to derive content hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Blake3,
    Sha256,
}

impl ContentHash {
    /// Hash data with the default algorithm (BLAKE3).
    pub fn from_data(data: &[u8]) -> Self {
        Self::with_algorithm(HashAlgorithm::Blake3, data)
    }

    /// Hash data with a specific algorithm.
    pub fn with_algorithm(algorithm: HashAlgorithm, data: &[u8]) -> Self {
        let mut hasher = Hasher::new(algorithm);
        hasher.update(data);
        hasher.finish().0
    }

    /// Create from an existing hash string (validates format).
    pub fn from_str_checked(s: &str) -> Result<Self, HashError> {
        if s.len() != 32 {
            return Err(HashError::InvalidLength(s.len()));
        }
        if !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(HashError::InvalidHex);
        }
        Ok(Self(s.to_lowercase()))
    }

    /// Get the first 2 characters (used for directory sharding).
    pub fn prefix(&self) -> &str {
        &self.0[0..2]
    }

    /// Get the remainder after the prefix (used as filename).
    pub fn remainder(&self) -> &str {
        &self.0[2..]
    }

    /// Get the full hash as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume and return the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContentHash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_checked(s)
    }
}

impl AsRef<str> for ContentHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

enum HasherInner {
    Blake3(blake3::Hasher),
    Sha256(sha2::Sha256),
}

/// Streaming hash accumulator.
///
/// Folds chunks as they arrive and counts bytes, so a blob can be hashed
/// while it is written out without buffering the whole thing.
pub struct Hasher {
    inner: HasherInner,
    count: u64,
}

impl Hasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let inner = match algorithm {
            HashAlgorithm::Blake3 => HasherInner::Blake3(blake3::Hasher::new()),
            HashAlgorithm::Sha256 => HasherInner::Sha256(sha2::Sha256::new()),
        };
        Self { inner, count: 0 }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.inner {
            HasherInner::Blake3(h) => {
                h.update(data);
            }
            HasherInner::Sha256(h) => {
                h.update(data);
            }
        }
        self.count += data.len() as u64;
    }

    /// Finish hashing, returning the content hash and the byte count.
    pub fn finish(self) -> (ContentHash, u64) {
        let hex = match self.inner {
            HasherInner::Blake3(h) => hex::encode(&h.finalize().as_bytes()[..16]),
            HasherInner::Sha256(h) => hex::encode(&h.finalize()[..16]),
        };
        (ContentHash(hex), self.count)
    }

    /// Bytes folded in so far.
    pub fn bytes_seen(&self) -> u64 {
        self.count
    }
}
