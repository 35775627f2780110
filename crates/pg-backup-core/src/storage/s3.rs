//! S3-compatible storage backend using object_store.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use std::sync::Arc;
use tokio::fs::File;
use tracing::{debug, info};

use super::{stream, StorageBackend};
use crate::error::StorageError;
use crate::{Error, Result};

/// S3 storage backend configuration
///
/// Unset fields are resolved from the ambient `AWS_*` environment.
#[derive(Debug, Clone, Default)]
pub struct S3Config {
    /// S3 bucket name
    pub bucket: String,
    /// AWS region
    pub region: Option<String>,
    /// Custom endpoint (for S3-compatible services like MinIO)
    pub endpoint: Option<String>,
    /// Access key ID
    pub access_key_id: Option<String>,
    /// Secret access key
    pub secret_access_key: Option<String>,
    /// Allow HTTP (insecure) connections
    pub allow_http: bool,
}

/// S3 storage backend
pub struct S3Backend {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl S3Backend {
    /// Create a new S3 backend
    pub fn new(config: S3Config) -> Result<Self> {
        let mut builder = AmazonS3Builder::from_env().with_bucket_name(&config.bucket);

        if let Some(region) = &config.region {
            builder = builder.with_region(region);
        }

        if let Some(endpoint) = &config.endpoint {
            builder = builder.with_endpoint(endpoint);
            // Custom endpoints (MinIO, Ceph) expect path-style requests
            builder = builder.with_virtual_hosted_style_request(false);
        }

        if let Some(access_key) = &config.access_key_id {
            builder = builder.with_access_key_id(access_key);
        }

        if let Some(secret_key) = &config.secret_access_key {
            builder = builder.with_secret_access_key(secret_key);
        }

        if config.allow_http {
            builder = builder.with_allow_http(true);
        }

        let store = builder.build().map_err(|e| {
            Error::Storage(StorageError::Backend(format!(
                "Failed to create S3 client: {}",
                e
            )))
        })?;

        info!("Created S3 backend for bucket: {}", config.bucket);

        Ok(Self {
            store: Arc::new(store),
            bucket: config.bucket,
        })
    }

    fn backend_error(&self, op: &str, key: &str, e: object_store::Error) -> Error {
        match e {
            object_store::Error::NotFound { .. } => {
                Error::Storage(StorageError::NotFound(key.to_string()))
            }
            other => Error::Storage(StorageError::Backend(format!(
                "S3 {} {} failed: {}",
                op, key, other
            ))),
        }
    }
}

/// Whether an object_store error means the bucket itself is missing.
///
/// object_store 0.11 reports a failed S3 list as `Error::Generic` carrying
/// the response body, so a missing bucket is only visible through the
/// `NoSuchBucket` error code in that text. Revisit on upgrade.
fn is_missing_bucket(e: &object_store::Error) -> bool {
    matches!(e, object_store::Error::NotFound { .. }) || e.to_string().contains("NoSuchBucket")
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn check_bucket(&self) -> Result<()> {
        debug!("S3 check bucket: {}", self.bucket);

        // A single list page is enough to tell whether the bucket answers.
        let mut stream = self.store.list(None);
        match stream.next().await {
            None | Some(Ok(_)) => Ok(()),
            Some(Err(e)) if is_missing_bucket(&e) => Err(Error::Storage(
                StorageError::BucketNotFound(self.bucket.clone()),
            )),
            Some(Err(e)) => Err(Error::Storage(StorageError::Backend(format!(
                "S3 bucket check failed for {}: {}",
                self.bucket, e
            )))),
        }
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = Path::from(key);
        debug!("S3 PUT: {} ({} bytes)", path, data.len());

        self.store
            .put(&path, PutPayload::from_bytes(data))
            .await
            .map_err(|e| self.backend_error("PUT", key, e))?;

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = Path::from(key);
        debug!("S3 GET: {}", path);

        let result = self
            .store
            .get(&path)
            .await
            .map_err(|e| self.backend_error("GET", key, e))?;

        result.bytes().await.map_err(|e| {
            Error::Storage(StorageError::Backend(format!(
                "Failed to read S3 response: {}",
                e
            )))
        })
    }

    async fn upload_file(&self, key: &str, file: File) -> Result<u64> {
        debug!("S3 streaming PUT: {}", key);
        stream::upload(self.store.clone(), key, file).await
    }

    async fn download_file(&self, key: &str, file: File) -> Result<u64> {
        debug!("S3 streaming GET: {}", key);
        stream::download(self.store.as_ref(), key, file, |e| {
            self.backend_error("GET", key, e)
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix_path = Path::from(prefix);
        debug!("S3 LIST: {}", prefix_path);

        let mut keys = Vec::new();
        let mut stream = self.store.list(Some(&prefix_path));
        while let Some(result) = stream.next().await {
            let meta = result.map_err(|e| self.backend_error("LIST", prefix, e))?;
            keys.push(meta.location.to_string());
        }

        Ok(keys)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = Path::from(key);
        debug!("S3 HEAD: {}", path);

        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(self.backend_error("HEAD", key, e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = Path::from(key);
        debug!("S3 DELETE: {}", path);

        self.store
            .delete(&path)
            .await
            .map_err(|e| self.backend_error("DELETE", key, e))?;

        Ok(())
    }
}
