//! Directory-backed store.
//!
//! A key maps directly to a relative path under the base directory, so
//! the sharded keys produced by the default derivation land as:
//!
//! ```text
//! {base}/
//! ├── objects/
//! │   ├── ab/
//! │   │   └── cde123...   # finalized content (remainder of hash)
//! └── staging/
//!     └── ef5678...       # in-progress content
//! ```
//!
//! Intermediate directories are created on demand. Rename works across
//! the whole tree, falling back to copy+delete when the rename crosses a
//! filesystem boundary (EXDEV).

use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::error::StoreError;
use crate::key::BlobKey;
use crate::store::{ByteStream, Store};

/// Filesystem store rooted at a base directory.
#[derive(Debug, Clone)]
pub struct DirStore {
    base: PathBuf,
    read_only: bool,
}

impl DirStore {
    /// Create a store rooted at `base`, creating the directory if needed.
    pub fn new(base: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base = base.into();
        std::fs::create_dir_all(&base)?;
        Ok(Self {
            base,
            read_only: false,
        })
    }

    /// Create a read-only store over an existing directory. Mutating
    /// operations fail with [`StoreError::ReadOnly`].
    pub fn read_only_at(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            read_only: true,
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn ensure_writable(&self) -> Result<(), StoreError> {
        if self.read_only {
            Err(StoreError::ReadOnly)
        } else {
            Ok(())
        }
    }

    /// Map a key to its path under the base directory, rejecting keys
    /// that would escape it.
    fn resolve(&self, key: &BlobKey) -> Result<PathBuf, StoreError> {
        let rel = Path::new(key.as_str());
        if key.as_str().is_empty()
            || !rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.base.join(rel))
    }
}

async fn create_parent(path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    Ok(())
}

#[async_trait]
impl Store for DirStore {
    async fn put(&self, key: &BlobKey, mut src: ByteStream) -> Result<u64, StoreError> {
        self.ensure_writable()?;
        let path = self.resolve(key)?;
        create_parent(&path).await?;

        let mut file = fs::File::create(&path).await?;
        let mut written = 0u64;

        while let Some(chunk) = src.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    // A failed source must not leave a partial entry that
                    // reads back as the blob.
                    drop(file);
                    let _ = fs::remove_file(&path).await;
                    return Err(StoreError::Source(e));
                }
            };
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        file.flush().await?;
        file.sync_all().await?;

        debug!(blob.key = %key, blob.size = written, "wrote blob file");
        Ok(written)
    }

    async fn get(&self, key: &BlobKey) -> Result<ByteStream, StoreError> {
        let path = self.resolve(key)?;
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(key.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Box::pin(ReaderStream::new(file)))
    }

    async fn rename(&self, from: &BlobKey, to: &BlobKey) -> Result<(), StoreError> {
        self.ensure_writable()?;
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;

        if !fs::try_exists(&src).await? {
            return Err(StoreError::NotFound(from.clone()));
        }
        create_parent(&dst).await?;

        match fs::rename(&src, &dst).await {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
                // Cross-filesystem: fall back to copy + delete.
                fs::copy(&src, &dst).await?;
                fs::remove_file(&src).await?;
            }
            Err(e) => return Err(e.into()),
        }

        debug!(blob.from = %from, blob.to = %to, "renamed blob file");
        Ok(())
    }

    async fn exists(&self, key: &BlobKey) -> Result<bool, StoreError> {
        let path = self.resolve(key)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn delete(&self, key: &BlobKey) -> Result<(), StoreError> {
        self.ensure_writable()?;
        let path = self.resolve(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
