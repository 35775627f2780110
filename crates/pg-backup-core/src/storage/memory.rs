//! In-memory storage backend for testing.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use std::sync::Arc;
use tokio::fs::File;

use super::{stream, StorageBackend};
use crate::error::StorageError;
use crate::{Error, Result};

/// In-memory storage backend using object_store
///
/// This backend is primarily useful for testing purposes as it doesn't
/// persist data between runs. Its bucket always exists.
pub struct MemoryBackend {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl MemoryBackend {
    /// Create a new in-memory storage backend
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            store: Arc::new(InMemory::new()),
            bucket: bucket.into(),
        }
    }
}

fn map_err(op: &str, key: &str, e: object_store::Error) -> Error {
    match e {
        object_store::Error::NotFound { .. } => {
            Error::Storage(StorageError::NotFound(key.to_string()))
        }
        other => Error::Storage(StorageError::Backend(format!(
            "Memory {} failed: {}",
            op, other
        ))),
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn check_bucket(&self) -> Result<()> {
        Ok(())
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.store
            .put(&Path::from(key), PutPayload::from_bytes(data))
            .await
            .map_err(|e| map_err("PUT", key, e))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let result = self
            .store
            .get(&Path::from(key))
            .await
            .map_err(|e| map_err("GET", key, e))?;

        result
            .bytes()
            .await
            .map_err(|e| map_err("GET", key, e))
    }

    async fn upload_file(&self, key: &str, file: File) -> Result<u64> {
        stream::upload(self.store.clone(), key, file).await
    }

    async fn download_file(&self, key: &str, file: File) -> Result<u64> {
        stream::download(self.store.as_ref(), key, file, |e| map_err("GET", key, e)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix_path = Path::from(prefix);
        let mut keys = Vec::new();
        let mut stream = self.store.list(Some(&prefix_path));

        while let Some(result) = stream.next().await {
            let meta = result.map_err(|e| map_err("LIST", prefix, e))?;
            keys.push(meta.location.to_string());
        }

        Ok(keys)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self.store.head(&Path::from(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(map_err("HEAD", key, e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.store
            .delete(&Path::from(key))
            .await
            .map_err(|e| map_err("DELETE", key, e))?;
        Ok(())
    }
}
