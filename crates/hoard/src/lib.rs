//! Content-addressed blob storage with tiered caching.
//!
//! Callers submit byte streams; the content is hashed while it streams
//! and persisted under a key derived from the hash, so identical content
//! always collapses onto one stored copy. Any backend satisfying the
//! small [`Store`] contract can hold the bytes: a directory tree
//! ([`DirStore`]), an in-process map ([`MemStore`]), or a
//! [`TieredStore`] composing a fast cache tier with a durable fallback
//! tier under an LRU byte budget.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use hoard::{BlobMeta, Cas, HoardConfig};
//!
//! # async fn example() -> Result<(), hoard::StoreError> {
//! // Memory cache over a directory tree at the configured path.
//! let cas = Cas::open(&HoardConfig::with_base_path("/tank/hoard"))?;
//!
//! // Store content; identical bytes land on the same key.
//! let info = cas.put_bytes("Hello, World!", BlobMeta::new()).await?;
//! println!("stored as {}", info.key);
//!
//! // Retrieve it by the returned info (or a bare key).
//! let data = cas.read(&info).await?;
//! println!("got {} bytes", data.len());
//! # Ok(())
//! # }
//! ```
//!
//! # Two-phase puts
//!
//! [`Cas::put`] is [`Cas::prepare_put`] (stream in under a staging key,
//! hashing on the way through) followed by [`Cas::finalize_put`] (rename
//! onto the hash-derived key). The phases are public so callers can hold
//! a prepared blob and decide later whether to finalize or
//! [`Cas::unlink`] it.

pub mod backend;
pub mod cas;
pub mod config;
pub mod error;
pub mod hash;
pub mod key;
pub mod store;
pub mod tee;
pub mod tiered;

// Re-exports for convenience
pub use backend::{DirStore, MemStore};
pub use cas::{Cas, TempBlob};
pub use config::{ConfigError, HoardConfig};
pub use error::StoreError;
pub use hash::{ContentHash, HashAlgorithm, HashError, Hasher};
pub use key::{
    default_key_derivation, AsBlobKey, BlobInfo, BlobKey, BlobMeta, KeyDerivation, KeyInput,
};
pub use store::{stream_from_bytes, ByteStream, Capability, CapabilityRegistry, Store, StoreExt};
pub use tiered::{TieredStore, DEFAULT_BYTE_BUDGET};
