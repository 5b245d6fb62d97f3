//! Object-store backends
//!
//! The platform persists object bytes under `{bucket}/{object id}`; metadata
//! (including the user-visible key) lives in the object repository, so
//! renames never move bytes. Backends never interpret user-supplied names.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncWriteExt};

use crate::error::{Error, Result};

/// A reader over one stored object
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// Byte storage for objects
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn put(&self, bucket: &str, key: &str, data: &[u8]) -> Result<()>;

    async fn open(&self, bucket: &str, key: &str) -> Result<ObjectReader>;

    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;
}

/// Filesystem-backed object store
pub struct LocalFsBackend {
    root: PathBuf,
}

impl LocalFsBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        for part in [bucket, key] {
            if part.is_empty()
                || part.contains('/')
                || part.contains('\\')
                || part.contains("..")
            {
                return Err(Error::BadRequest("Invalid storage path".to_string()));
            }
        }
        Ok(self.root.join(bucket).join(key))
    }
}

#[async_trait]
impl StorageBackend for LocalFsBackend {
    async fn put(&self, bucket: &str, key: &str, data: &[u8]) -> Result<()> {
        let path = self.path_for(bucket, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&path).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn open(&self, bucket: &str, key: &str) -> Result<ObjectReader> {
        let path = self.path_for(bucket, key)?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|_| Error::NotFound("Object not found".to_string()))?;
        Ok(Box::new(file))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let path = self.path_for(bucket, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory object store for tests and ephemeral deployments
#[derive(Default)]
pub struct InMemoryBackend {
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn put(&self, bucket: &str, key: &str, data: &[u8]) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .insert((bucket.to_string(), key.to_string()), data.to_vec());
        Ok(())
    }

    async fn open(&self, bucket: &str, key: &str) -> Result<ObjectReader> {
        let objects = self.objects.lock().unwrap();
        let data = objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound("Object not found".to_string()))?;
        Ok(Box::new(Cursor::new(data)))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn read_all(mut reader: ObjectReader) -> Vec<u8> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_fs_backend_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(dir.path());

        backend.put("bucket", "key1", b"hello").await.unwrap();
        let data = read_all(backend.open("bucket", "key1").await.unwrap()).await;
        assert_eq!(data, b"hello");

        backend.delete("bucket", "key1").await.unwrap();
        assert!(backend.open("bucket", "key1").await.is_err());
        // Deleting a missing object is a no-op.
        backend.delete("bucket", "key1").await.unwrap();
    }

    #[tokio::test]
    async fn test_fs_backend_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(dir.path());

        assert!(backend.put("..", "key", b"x").await.is_err());
        assert!(backend.put("bucket", "../escape", b"x").await.is_err());
        assert!(backend.put("a/b", "key", b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_memory_backend_round_trip() {
        let backend = InMemoryBackend::default();
        backend.put("b", "k", b"data").await.unwrap();
        let data = read_all(backend.open("b", "k").await.unwrap()).await;
        assert_eq!(data, b"data");
    }
}
