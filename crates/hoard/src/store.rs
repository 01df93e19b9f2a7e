//! The capability contract every storage backend satisfies.
//!
//! [`Store`] is the seam between the content-addressed layer and whatever
//! actually holds bytes: a directory tree, an in-process map, or a
//! [`TieredStore`](crate::TieredStore) composing two of them. Backends may
//! expose extra capabilities beyond the core five operations through a
//! statically declared [`CapabilityRegistry`]; composites forward them
//! without hardcoding capability names.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, Stream};

use crate::error::StoreError;
use crate::key::BlobKey;

/// A stream of byte chunks, as produced and consumed by stores.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + 'static>>;

/// Wrap an in-memory byte sequence as a single-chunk [`ByteStream`].
pub fn stream_from_bytes(data: impl Into<Bytes>) -> ByteStream {
    let chunk: io::Result<Bytes> = Ok(data.into());
    Box::pin(stream::iter([chunk]))
}

/// Capability set any backend must satisfy.
///
/// All operations are keyed; keys are opaque strings whose layout is the
/// concern of key derivation, not of the backend.
#[async_trait]
pub trait Store: Send + Sync {
    /// Persist all bytes of `src` under `key`, overwriting any existing
    /// entry. Resolves only once the write is durably complete, returning
    /// the number of bytes written. Fails if the source stream itself
    /// fails mid-transfer, propagating the source's error.
    async fn put(&self, key: &BlobKey, src: ByteStream) -> Result<u64, StoreError>;

    /// Stream the stored bytes for `key`. Fails with
    /// [`StoreError::NotFound`] if the key is absent.
    async fn get(&self, key: &BlobKey) -> Result<ByteStream, StoreError>;

    /// Relocate the entry from `from` to `to`, overwriting `to` if
    /// present. Fails with [`StoreError::NotFound`] if `from` is absent.
    async fn rename(&self, from: &BlobKey, to: &BlobKey) -> Result<(), StoreError>;

    /// Whether `key` exists. Never errors for a merely-absent key.
    async fn exists(&self, key: &BlobKey) -> Result<bool, StoreError>;

    /// Remove the entry. Behavior for an already-absent key is
    /// backend-defined but must not corrupt other entries.
    async fn delete(&self, key: &BlobKey) -> Result<(), StoreError>;

    /// Look up an extension capability by name.
    fn capability(&self, _name: &str) -> Option<Arc<dyn Capability>> {
        None
    }

    /// Names of all extension capabilities this store declares.
    fn capability_names(&self) -> Vec<String> {
        Vec::new()
    }
}

/// An extension capability a backend exposes beyond the core contract
/// (e.g. a bulk-copy operation). Arguments and results are open-ended
/// JSON values so composites can pass them through unchanged.
#[async_trait]
pub trait Capability: Send + Sync {
    async fn invoke(&self, args: serde_json::Value) -> Result<serde_json::Value, StoreError>;
}

#[async_trait]
impl<F, Fut> Capability for F
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<serde_json::Value, StoreError>> + Send + 'static,
{
    async fn invoke(&self, args: serde_json::Value) -> Result<serde_json::Value, StoreError> {
        (self)(args).await
    }
}

/// Named registry of extension capabilities, declared at construction.
#[derive(Default, Clone)]
pub struct CapabilityRegistry {
    entries: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, capability: Arc<dyn Capability>) {
        self.entries.insert(name.into(), capability);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.entries.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("names", &self.names())
            .finish()
    }
}

/// Convenience calls layered over any [`Store`].
#[async_trait]
pub trait StoreExt: Store {
    /// Invoke an extension capability, failing with
    /// [`StoreError::CapabilityNotFound`] if the store does not declare it.
    async fn invoke_capability(
        &self,
        name: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, StoreError> {
        match self.capability(name) {
            Some(capability) => capability.invoke(args).await,
            None => Err(StoreError::CapabilityNotFound(name.to_string())),
        }
    }
}

#[async_trait]
impl<S: Store + ?Sized> StoreExt for S {}
