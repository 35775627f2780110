//! Storage backend trait definition.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::File;

use crate::Result;

/// Trait for storage backends
///
/// Keys are full object keys; prefix handling belongs to the
/// [`Repository`](crate::repository::Repository) layered on top.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Name of the bucket this backend is bound to
    fn bucket(&self) -> &str;

    /// Fail with `StorageError::BucketNotFound` when the bucket is missing
    async fn check_bucket(&self) -> Result<()>;

    /// Write data to a key
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Read data from a key
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Stream the contents of `file` into a key; returns the bytes written
    async fn upload_file(&self, key: &str, file: File) -> Result<u64>;

    /// Stream the object under a key into `file`; returns the bytes written
    async fn download_file(&self, key: &str, file: File) -> Result<u64>;

    /// List keys with a given prefix
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Check if a key exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Delete a key
    async fn delete(&self, key: &str) -> Result<()>;
}
