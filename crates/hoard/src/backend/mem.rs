//! In-memory store backend.
//!
//! Maps keys to byte buffers in a plain map. Useful as the fast tier of a
//! [`TieredStore`](crate::TieredStore) and for tests.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;

use crate::error::StoreError;
use crate::key::BlobKey;
use crate::store::{stream_from_bytes, ByteStream, Capability, CapabilityRegistry, Store};

/// In-memory byte-buffer store.
#[derive(Debug, Default)]
pub struct MemStore {
    blobs: RwLock<HashMap<BlobKey, Bytes>>,
    capabilities: CapabilityRegistry,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an extension capability on this store.
    pub fn with_capability(
        mut self,
        name: impl Into<String>,
        capability: Arc<dyn Capability>,
    ) -> Self {
        self.capabilities.register(name, capability);
        self
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().unwrap().is_empty()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn put(&self, key: &BlobKey, mut src: ByteStream) -> Result<u64, StoreError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = src.next().await {
            let chunk = chunk.map_err(StoreError::Source)?;
            buf.extend_from_slice(&chunk);
        }

        let size = buf.len() as u64;
        self.blobs
            .write()
            .unwrap()
            .insert(key.clone(), buf.freeze());
        Ok(size)
    }

    async fn get(&self, key: &BlobKey) -> Result<ByteStream, StoreError> {
        let data = self
            .blobs
            .read()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        Ok(stream_from_bytes(data))
    }

    async fn rename(&self, from: &BlobKey, to: &BlobKey) -> Result<(), StoreError> {
        let mut blobs = self.blobs.write().unwrap();
        let data = blobs
            .remove(from)
            .ok_or_else(|| StoreError::NotFound(from.clone()))?;
        blobs.insert(to.clone(), data);
        Ok(())
    }

    async fn exists(&self, key: &BlobKey) -> Result<bool, StoreError> {
        Ok(self.blobs.read().unwrap().contains_key(key))
    }

    async fn delete(&self, key: &BlobKey) -> Result<(), StoreError> {
        // Removing an absent key is a no-op here.
        self.blobs.write().unwrap().remove(key);
        Ok(())
    }

    fn capability(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(name)
    }

    fn capability_names(&self) -> Vec<String> {
        self.capabilities.names()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreExt;
    use serde_json::json;

    async fn read_all(store: &MemStore, key: &BlobKey) -> Result<Vec<u8>, StoreError> {
        let mut stream = store.get(key).await?;
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.map_err(StoreError::Io)?);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() -> anyhow::Result<()> {
        let store = MemStore::new();
        let key = BlobKey::from("objects/ab/cdef");

        let size = store.put(&key, stream_from_bytes("Hello, World!")).await?;
        assert_eq!(size, 13);
        assert_eq!(read_all(&store, &key).await?, b"Hello, World!");
        Ok(())
    }

    #[tokio::test]
    async fn test_put_overwrites() -> anyhow::Result<()> {
        let store = MemStore::new();
        let key = BlobKey::from("k");

        store.put(&key, stream_from_bytes("old")).await?;
        store.put(&key, stream_from_bytes("new")).await?;
        assert_eq!(read_all(&store, &key).await?, b"new");
        assert_eq!(store.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = MemStore::new();
        let err = store.get(&BlobKey::from("missing")).await.err().unwrap();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_rename_moves_and_overwrites() -> anyhow::Result<()> {
        let store = MemStore::new();
        let from = BlobKey::from("staging/tmp");
        let to = BlobKey::from("objects/ab/final");

        store.put(&from, stream_from_bytes("payload")).await?;
        store.put(&to, stream_from_bytes("stale")).await?;
        store.rename(&from, &to).await?;

        assert!(!store.exists(&from).await?);
        assert_eq!(read_all(&store, &to).await?, b"payload");
        Ok(())
    }

    #[tokio::test]
    async fn test_rename_missing_source() {
        let store = MemStore::new();
        let err = store
            .rename(&BlobKey::from("gone"), &BlobKey::from("dest"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(k) if k.as_str() == "gone"));
    }

    #[tokio::test]
    async fn test_delete_absent_is_noop() -> anyhow::Result<()> {
        let store = MemStore::new();
        store.delete(&BlobKey::from("never-existed")).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_registered_capability_is_invokable() -> anyhow::Result<()> {
        let store = MemStore::new().with_capability(
            "echo",
            Arc::new(|args: serde_json::Value| async move { Ok::<_, StoreError>(args) }),
        );

        let result = store
            .invoke_capability("echo", json!({"ping": true}))
            .await?;
        assert_eq!(result, json!({"ping": true}));
        assert_eq!(store.capability_names(), vec!["echo".to_string()]);
        Ok(())
    }
}
