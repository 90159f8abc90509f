//! Local filesystem storage backend.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, ObjectMeta, ObjectStore};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::instrument;
use uuid::Uuid;

/// Local filesystem object store.
///
/// Writes go through a temp file plus rename so a crashed upload never
/// leaves a partially-written object under its final key.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend rooted at `root`.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Resolve a key to a path under the root.
    ///
    /// Keys are registry-generated, but the check still rejects anything
    /// that could escape the root.
    fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty() || key.contains("..") || key.starts_with('/') {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        for component in Path::new(key).components() {
            if !matches!(component, std::path::Component::Normal(_)) {
                return Err(StorageError::InvalidKey(key.to_string()));
            }
        }
        Ok(self.root.join(key))
    }

    fn map_io_err(key: &str, err: std::io::Error) -> StorageError {
        if err.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(key.to_string())
        } else {
            StorageError::Io(err)
        }
    }
}

#[async_trait]
impl ObjectStore for FilesystemBackend {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.key_path(key)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let path = self.key_path(key)?;
        let meta = fs::metadata(&path)
            .await
            .map_err(|e| Self::map_io_err(key, e))?;
        let last_modified = meta
            .modified()
            .ok()
            .map(time::OffsetDateTime::from);
        Ok(ObjectMeta {
            size: meta.len(),
            last_modified,
            content_type: None,
        })
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.key_path(key)?;
        let data = fs::read(&path)
            .await
            .map_err(|e| Self::map_io_err(key, e))?;
        Ok(Bytes::from(data))
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        let path = self.key_path(key)?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| Self::map_io_err(key, e))?;
        let stream = ReaderStream::new(file).map(|chunk| chunk.map_err(StorageError::Io));
        Ok(Box::pin(stream))
    }

    #[instrument(skip(self, data), fields(key = %key, len = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let path = self.key_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
        let mut file = fs::File::create(&temp).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(err) = fs::rename(&temp, &path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(StorageError::Io(err));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.key_path(key)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| Self::map_io_err(key, e))
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }
}
