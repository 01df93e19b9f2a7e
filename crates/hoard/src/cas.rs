//! Content-addressed facade over any [`Store`].
//!
//! A put runs in two phases. `prepare_put` streams the source into the
//! store under a random staging key while a forked consumer hashes the
//! same bytes - nothing is buffered and the hash is final exactly when
//! the write is. `finalize_put` renames the staging entry onto the key
//! derived from the hash; because the rename overwrites, duplicate
//! content collapses onto one stored copy with no separate dedup check.

use std::io;
use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::backend::{DirStore, MemStore};
use crate::config::HoardConfig;
use crate::error::StoreError;
use crate::hash::{HashAlgorithm, Hasher};
use crate::key::{default_key_derivation, AsBlobKey, BlobInfo, BlobMeta, KeyDerivation, KeyInput};
use crate::store::{stream_from_bytes, ByteStream, Store};
use crate::tee::{fan_out_pair, FanOutError};
use crate::tiered::TieredStore;

/// Content-addressed store facade.
///
/// Works against any [`Store`]: a bare backend or a
/// [`TieredStore`](crate::TieredStore) composition.
#[derive(Clone)]
pub struct Cas {
    store: Arc<dyn Store>,
    algorithm: HashAlgorithm,
    derive: KeyDerivation,
}

impl Cas {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            algorithm: HashAlgorithm::default(),
            derive: default_key_derivation(),
        }
    }

    /// Use a different content digest (default: BLAKE3).
    pub fn with_algorithm(mut self, algorithm: HashAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Replace the key derivation function.
    pub fn with_key_derivation(mut self, derive: KeyDerivation) -> Self {
        self.derive = derive;
        self
    }

    /// Open a tiered store from configuration: an in-memory cache tier
    /// over a directory fallback tier at the configured base path.
    pub fn open(config: &HoardConfig) -> Result<Self, StoreError> {
        let fallback: Arc<dyn Store> = if config.read_only {
            Arc::new(DirStore::read_only_at(config.base_path.clone()))
        } else {
            Arc::new(DirStore::new(config.base_path.clone())?)
        };
        let cache: Arc<dyn Store> = Arc::new(MemStore::new());
        let store = TieredStore::with_byte_budget(cache, fallback, config.byte_budget);
        Ok(Self::new(Arc::new(store)))
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Stream `source` into the store under a temporary key, hashing it
    /// on the way through.
    ///
    /// Resolves once the store confirms the write is durable and the
    /// hash covers every byte; the returned info carries the temporary
    /// key plus the now-known hash and size. A source that fails
    /// mid-stream fails the operation with the originating error and
    /// never leaves a successfully-readable entry behind.
    pub async fn prepare_put(
        &self,
        source: ByteStream,
        meta: BlobMeta,
    ) -> Result<BlobInfo, StoreError> {
        let temp_key = (self.derive)(KeyInput {
            hash: None,
            meta: &meta,
        });

        let (store_stream, hash_stream, driver) = fan_out_pair(source);

        let algorithm = self.algorithm;
        let hash_task = async move {
            let mut hasher = Hasher::new(algorithm);
            let mut hash_stream = hash_stream;
            while let Some(chunk) = hash_stream.next().await {
                let chunk = chunk.map_err(StoreError::Source)?;
                hasher.update(&chunk);
            }
            Ok::<_, StoreError>(hasher.finish())
        };

        let (driver_res, write_res, hash_res) = tokio::join!(
            driver,
            self.store.put(&temp_key, store_stream),
            hash_task
        );

        // The source's own error outranks the copies the consumers saw.
        let streamed = match driver_res {
            Ok(total) => Some(total),
            Err(FanOutError::Source(e)) => return Err(StoreError::Source(e)),
            Err(FanOutError::ConsumerGone) => None,
        };
        write_res?;
        let (hash, size) = hash_res?;
        if streamed.is_none() {
            return Err(StoreError::Io(io::Error::other(
                "byte stream fan-out aborted",
            )));
        }

        debug!(blob.key = %temp_key, blob.hash = %hash, blob.size = size, "prepared blob");
        Ok(BlobInfo {
            key: temp_key,
            hash: Some(hash),
            size: Some(size),
            meta,
        })
    }

    /// Rename a prepared blob onto its content-derived final key.
    ///
    /// The rename overwrites an existing entry: identical content from
    /// concurrent puts lands on the same key, and the last rename wins
    /// harmlessly.
    pub async fn finalize_put(&self, info: BlobInfo) -> Result<BlobInfo, StoreError> {
        let hash = info.hash.clone().ok_or(StoreError::MissingHash)?;
        let final_key = (self.derive)(KeyInput {
            hash: Some(&hash),
            meta: &info.meta,
        });

        if final_key != info.key {
            if self.store.exists(&final_key).await? {
                debug!(blob.key = %final_key, "final key already stored; rename overwrites");
            }
            self.store.rename(&info.key, &final_key).await?;
        }

        info!(blob.key = %final_key, blob.hash = %hash, "finalized blob");
        Ok(BlobInfo {
            key: final_key,
            ..info
        })
    }

    /// Two-phase put: prepare then finalize.
    pub async fn put(&self, source: ByteStream, meta: BlobMeta) -> Result<BlobInfo, StoreError> {
        let info = self.prepare_put(source, meta).await?;
        self.finalize_put(info).await
    }

    /// Put an in-memory byte sequence.
    pub async fn put_bytes(
        &self,
        data: impl Into<bytes::Bytes>,
        meta: BlobMeta,
    ) -> Result<BlobInfo, StoreError> {
        self.put(stream_from_bytes(data), meta).await
    }

    /// Put the contents of a file.
    pub async fn put_file(
        &self,
        path: impl AsRef<Path>,
        meta: BlobMeta,
    ) -> Result<BlobInfo, StoreError> {
        let file = tokio::fs::File::open(path).await?;
        self.put(Box::pin(ReaderStream::new(file)), meta).await
    }

    /// Stream a stored blob into `dest`, returning the byte count.
    pub async fn stream_to<W>(
        &self,
        target: impl AsBlobKey,
        dest: &mut W,
    ) -> Result<u64, StoreError>
    where
        W: tokio::io::AsyncWrite + Unpin + ?Sized,
    {
        let mut stream = self.store.get(target.blob_key()).await?;
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            dest.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        dest.flush().await?;
        Ok(written)
    }

    /// Read a stored blob into memory.
    pub async fn read(&self, target: impl AsBlobKey) -> Result<Vec<u8>, StoreError> {
        let mut stream = self.store.get(target.blob_key()).await?;
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    /// Remove a stored blob.
    pub async fn unlink(&self, target: impl AsBlobKey) -> Result<(), StoreError> {
        self.store.delete(target.blob_key()).await
    }

    /// Whether a blob exists under the given key.
    pub async fn has(&self, target: impl AsBlobKey) -> Result<bool, StoreError> {
        self.store.exists(target.blob_key()).await
    }

    /// Whether content identical to `source` is already stored.
    ///
    /// Fully consumes `source` to compute its hash - no hash, no lookup.
    pub async fn has_content(
        &self,
        mut source: ByteStream,
        meta: &BlobMeta,
    ) -> Result<bool, StoreError> {
        let mut hasher = Hasher::new(self.algorithm);
        while let Some(chunk) = source.next().await {
            hasher.update(&chunk.map_err(StoreError::Source)?);
        }
        let (hash, _) = hasher.finish();
        let key = (self.derive)(KeyInput {
            hash: Some(&hash),
            meta,
        });
        self.store.exists(&key).await
    }

    /// Stream a blob to a caller-local temporary file.
    ///
    /// The returned [`TempBlob`] deletes the file when dropped, on every
    /// exit path.
    pub async fn temp_file(&self, target: impl AsBlobKey) -> Result<TempBlob, StoreError> {
        let tmp = tempfile::NamedTempFile::new()?;
        let (std_file, path) = tmp.into_parts();

        let mut file = tokio::fs::File::from_std(std_file);
        let size = self.stream_to(target, &mut file).await?;
        file.sync_all().await?;
        drop(file);

        Ok(TempBlob { path, size })
    }
}

/// Scoped handle to a temporary copy of a blob.
///
/// The backing file is removed when this drops.
#[derive(Debug)]
pub struct TempBlob {
    path: tempfile::TempPath,
    size: u64,
}

impl TempBlob {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}
