//! Filesystem storage backend implementation.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::StorageBackend;
use crate::error::StorageError;
use crate::Result;

/// Filesystem-based storage backend
///
/// The bucket is the directory `root/bucket`, which has to exist already.
#[derive(Debug, Clone)]
pub struct FilesystemBackend {
    bucket: String,
    base_path: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend for `root/bucket`
    pub fn new(root: PathBuf, bucket: String) -> Self {
        let base_path = root.join(&bucket);
        Self { bucket, base_path }
    }

    /// Convert a storage key to a filesystem path
    fn key_to_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key.trim_start_matches('/'));
        // Keys may not climb out of the bucket directory
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(StorageError::InvalidPath(key.to_string()).into());
        }
        Ok(self.base_path.join(relative))
    }

    /// Convert a filesystem path to a storage key
    fn path_to_key(&self, path: &Path) -> Option<String> {
        path.strip_prefix(&self.base_path)
            .ok()
            .map(|p| p.to_string_lossy().to_string())
    }
}

fn not_found_or(key: &str, path: &Path, op: &str, e: std::io::Error) -> StorageError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound(key.to_string())
    } else {
        StorageError::Backend(format!("Failed to {} {}: {}", op, path.display(), e))
    }
}

#[async_trait]
impl StorageBackend for FilesystemBackend {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn check_bucket(&self) -> Result<()> {
        match fs::metadata(&self.base_path).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(StorageError::BucketNotFound(self.bucket.clone()).into()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::BucketNotFound(self.bucket.clone()).into())
            }
            Err(e) => Err(StorageError::Backend(format!(
                "Failed to check bucket directory {}: {}",
                self.base_path.display(),
                e
            ))
            .into()),
        }
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.key_to_path(key)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                StorageError::Backend(format!("Failed to create directories: {}", e))
            })?;
        }

        let mut file = fs::File::create(&path).await.map_err(|e| {
            StorageError::Backend(format!("Failed to create file {}: {}", path.display(), e))
        })?;

        file.write_all(&data).await.map_err(|e| {
            StorageError::Backend(format!("Failed to write to file {}: {}", path.display(), e))
        })?;

        file.flush().await.map_err(|e| {
            StorageError::Backend(format!("Failed to flush file {}: {}", path.display(), e))
        })?;

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = self.key_to_path(key)?;
        let data = fs::read(&path)
            .await
            .map_err(|e| not_found_or(key, &path, "read", e))?;
        Ok(Bytes::from(data))
    }

    async fn upload_file(&self, key: &str, mut file: fs::File) -> Result<u64> {
        let path = self.key_to_path(key)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                StorageError::Backend(format!("Failed to create directories: {}", e))
            })?;
        }

        let mut target = fs::File::create(&path).await.map_err(|e| {
            StorageError::Backend(format!("Failed to create file {}: {}", path.display(), e))
        })?;
        let copied = tokio::io::copy(&mut file, &mut target).await.map_err(|e| {
            StorageError::Backend(format!("Failed to write to file {}: {}", path.display(), e))
        })?;
        target.flush().await.map_err(|e| {
            StorageError::Backend(format!("Failed to flush file {}: {}", path.display(), e))
        })?;

        Ok(copied)
    }

    async fn download_file(&self, key: &str, mut file: fs::File) -> Result<u64> {
        let path = self.key_to_path(key)?;
        let mut source = fs::File::open(&path)
            .await
            .map_err(|e| not_found_or(key, &path, "open", e))?;

        let copied = tokio::io::copy(&mut source, &mut file)
            .await
            .map_err(|e| not_found_or(key, &path, "read", e))?;
        file.flush()
            .await
            .map_err(|e| not_found_or(key, &path, "flush", e))?;

        Ok(copied)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let base = self.key_to_path(prefix)?;
        let mut results = Vec::new();

        if !base.exists() {
            return Ok(results);
        }

        let mut stack = vec![base];
        while let Some(dir) = stack.pop() {
            if dir.is_file() {
                if let Some(key) = self.path_to_key(&dir) {
                    results.push(key);
                }
                continue;
            }

            let mut entries = fs::read_dir(&dir).await.map_err(|e| {
                StorageError::Backend(format!("Failed to read directory {}: {}", dir.display(), e))
            })?;

            while let Some(entry) = entries.next_entry().await.map_err(|e| {
                StorageError::Backend(format!("Failed to read directory entry: {}", e))
            })? {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Some(key) = self.path_to_key(&path) {
                    results.push(key);
                }
            }
        }

        results.sort();
        Ok(results)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.key_to_path(key)?.exists())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.key_to_path(key)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| not_found_or(key, &path, "delete", e))?;
        Ok(())
    }
}
