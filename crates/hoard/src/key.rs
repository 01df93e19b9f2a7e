//! Blob keys, caller metadata, and key derivation.
//!
//! A [`BlobKey`] is an opaque string naming an entry within one store.
//! Keys for finalized content are derived from the content hash, so
//! identical bytes always land on the same key; in-progress writes get a
//! random staging key that is renamed away at finalize time.
//!
//! Layout produced by the default derivation:
//! ```text
//! objects/
//! ├── ab/
//! │   └── cde123...       # finalized content (remainder of hash)
//! staging/
//! └── ef5678...           # in-progress content (random id)
//! ```

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hash::ContentHash;

/// Opaque key identifying a stored byte sequence within one store.
///
/// Uniqueness is per-store; two different stores may reuse the same key
/// for unrelated content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobKey(String);

impl BlobKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BlobKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for BlobKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for BlobKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Caller-supplied metadata carried alongside a put.
///
/// Opaque to the storage layer; passed through to key derivation so keys
/// can carry an extension, and kept on the [`BlobInfo`] for the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMeta {
    /// File extension without the leading dot (e.g. "wav").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,

    /// MIME type of the content (e.g. "audio/wav").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl BlobMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_extension(mut self, ext: impl Into<String>) -> Self {
        self.extension = Some(ext.into());
        self
    }

    pub fn with_mime_type(mut self, mime: impl Into<String>) -> Self {
        self.mime_type = Some(mime.into());
        self
    }
}

/// Record of a stored (or in-flight) blob.
///
/// `hash` and `size` are `None` until the content has fully streamed
/// through at prepare time, and always present after finalize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobInfo {
    pub key: BlobKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<ContentHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default)]
    pub meta: BlobMeta,
}

/// Anything that resolves to a blob key: a bare key or a [`BlobInfo`].
pub trait AsBlobKey {
    fn blob_key(&self) -> &BlobKey;
}

impl AsBlobKey for BlobKey {
    fn blob_key(&self) -> &BlobKey {
        self
    }
}

impl AsBlobKey for BlobInfo {
    fn blob_key(&self) -> &BlobKey {
        &self.key
    }
}

impl<T: AsBlobKey + ?Sized> AsBlobKey for &T {
    fn blob_key(&self) -> &BlobKey {
        (*self).blob_key()
    }
}

/// Input to a key derivation function.
///
/// `hash` is absent for the first (temporary-key) invocation and present
/// for the second (final-key) one.
#[derive(Debug, Clone, Copy)]
pub struct KeyInput<'a> {
    pub hash: Option<&'a ContentHash>,
    pub meta: &'a BlobMeta,
}

/// Pure function deriving a storage key from `{hash?, meta}`.
///
/// Determinism given `{hash, meta}` is what makes identical content
/// collapse to identical storage.
pub type KeyDerivation = Arc<dyn Fn(KeyInput<'_>) -> BlobKey + Send + Sync>;

/// The default derivation: `objects/<2-char prefix>/<remainder><.ext>`
/// for hashed content, `staging/<random id><.ext>` before the hash is
/// known.
pub fn default_key_derivation() -> KeyDerivation {
    Arc::new(|input: KeyInput<'_>| {
        let ext = input
            .meta
            .extension
            .as_deref()
            .map(|e| format!(".{e}"))
            .unwrap_or_default();

        match input.hash {
            Some(hash) => BlobKey::new(format!(
                "objects/{}/{}{}",
                hash.prefix(),
                hash.remainder(),
                ext
            )),
            None => BlobKey::new(format!("staging/{}{}", random_id(), ext)),
        }
    })
}

/// A random 32-hex id for staging keys - same format as a content hash
/// so staging entries can be addressed before their hash is known.
fn random_id() -> String {
    let uuid = Uuid::new_v4();
    let hash_bytes = blake3::hash(uuid.as_bytes());
    hex::encode(&hash_bytes.as_bytes()[..16])
}
