//! Error taxonomy for stores and the content-addressed facade.
//!
//! The variants map onto the failure classes callers need to tell apart:
//! a missing key, their own source stream failing mid-transfer, an
//! extension capability that no backend provides, and the store's own I/O
//! failures. Source-stream failures carry the original error unchanged so
//! callers can distinguish "my input was bad" from "the store failed".

use std::io;

use thiserror::Error;

use crate::key::BlobKey;

/// Errors produced by stores and the [`Cas`](crate::Cas) facade.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A read, delete, or rename source referenced an absent key.
    #[error("blob not found: {0}")]
    NotFound(BlobKey),

    /// The caller-supplied source stream failed mid-transfer.
    ///
    /// Carries the originating error, never a store-side wrapper.
    #[error("source stream failed: {0}")]
    Source(io::Error),

    /// A forwarded capability call had no target on any backend.
    #[error("capability not found: {0}")]
    CapabilityNotFound(String),

    /// A mutating operation was issued against a read-only store.
    #[error("store is read-only")]
    ReadOnly,

    /// A key that cannot map to a storage location (absolute path,
    /// `..` component, or empty).
    #[error("invalid blob key: {0}")]
    InvalidKey(String),

    /// A blob info without a content hash was passed to finalize.
    #[error("blob has no content hash; call prepare_put first")]
    MissingHash,

    /// The store's own I/O failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StoreError {
    /// True for absent-key conditions (ENOENT-class).
    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::NotFound(_) => true,
            StoreError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<StoreError> for io::Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => {
                io::Error::new(io::ErrorKind::NotFound, format!("blob not found: {key}"))
            }
            StoreError::Source(e) | StoreError::Io(e) => e,
            other => io::Error::other(other.to_string()),
        }
    }
}
