//! Object storage repository bound to one bucket and key prefix.
//!
//! The repository owns the local working directory as well: uploads are
//! read from it and downloads land in it, named after the object's base
//! name.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::error::StorageError;
use crate::snapshot::discard_file;
use crate::storage::{create_backend, StorageBackend};
use crate::Result;

/// Narrow put/get capability the backup executor and restore orchestrator
/// depend on.
#[async_trait]
pub trait BackupStore: Send + Sync {
    /// Local directory used for dumps, archives and downloads
    fn working_dir(&self) -> &Path;

    /// Upload `path` under the prefixed `key` and return the full object key.
    ///
    /// The file is streamed from disk and removed once the upload has
    /// finished, whether or not it succeeded.
    async fn put_file(&self, key: &str, path: &Path) -> Result<String>;

    /// Download the object stored under `key` into the working directory
    async fn get_file(&self, key: &str) -> Result<PathBuf>;
}

/// A bucket, a key prefix and a working directory
pub struct Repository {
    backend: Arc<dyn StorageBackend>,
    prefix: String,
    working_dir: PathBuf,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("bucket", &self.backend.bucket())
            .field("prefix", &self.prefix)
            .field("working_dir", &self.working_dir)
            .finish()
    }
}

impl Repository {
    /// Bind a repository to an existing bucket.
    ///
    /// Fails with `StorageError::BucketNotFound` when the bucket does not
    /// exist; any other check failure is returned unchanged.
    pub async fn connect(
        backend: Arc<dyn StorageBackend>,
        prefix: impl Into<String>,
        working_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        backend.check_bucket().await?;

        let repository = Self {
            backend,
            prefix: prefix.into().trim_matches('/').to_string(),
            working_dir: working_dir.into(),
        };
        info!(
            "Connected to bucket {} (prefix: {:?})",
            repository.bucket(),
            repository.prefix
        );
        Ok(repository)
    }

    /// Build the storage backend described by `config` and connect to it
    pub async fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let backend = create_backend(&config.storage)?;
        Self::connect(backend, config.storage.prefix(), config.working_dir.clone()).await
    }

    pub fn bucket(&self) -> &str {
        self.backend.bucket()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Full object key for `suffix`.
    ///
    /// A suffix that already carries the prefix is returned as-is, so a key
    /// reported by a backup can be handed straight back to a restore.
    pub fn object_key(&self, suffix: &str) -> String {
        let suffix = suffix.trim_start_matches('/');
        if self.prefix.is_empty() {
            return suffix.to_string();
        }
        match suffix.strip_prefix(self.prefix.as_str()) {
            Some(rest) if rest.starts_with('/') => suffix.to_string(),
            _ => format!("{}/{}", self.prefix, suffix),
        }
    }

    /// Path in the working directory for a file called `name`
    pub fn local_path(&self, name: impl AsRef<Path>) -> PathBuf {
        self.working_dir.join(name)
    }

    /// Keys stored under the repository prefix
    pub async fn list(&self) -> Result<Vec<String>> {
        self.backend.list(&self.prefix).await
    }
}

#[async_trait]
impl BackupStore for Repository {
    fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    async fn put_file(&self, key: &str, path: &Path) -> Result<String> {
        let object_key = self.object_key(key);
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();

        info!(
            "Uploading {} ({} bytes) to {}/{}",
            path.display(),
            size,
            self.bucket(),
            object_key
        );

        let uploaded = self.backend.upload_file(&object_key, file).await;
        let removed = tokio::fs::remove_file(path).await;

        if let Err(e) = uploaded {
            error!(
                "Unable to upload object to bucket {}: key {}: {}",
                self.bucket(),
                object_key,
                e
            );
            return Err(e);
        }
        removed?;

        Ok(object_key)
    }

    async fn get_file(&self, key: &str) -> Result<PathBuf> {
        let object_key = self.object_key(key);
        let file_name = Path::new(&object_key)
            .file_name()
            .ok_or_else(|| StorageError::InvalidPath(object_key.clone()))?
            .to_owned();

        tokio::fs::create_dir_all(&self.working_dir).await?;
        let local = self.local_path(file_name);
        let file = tokio::fs::File::create(&local).await?;

        info!("Downloading {}/{}", self.bucket(), object_key);
        match self.backend.download_file(&object_key, file).await {
            Ok(size) => debug!("Wrote {} bytes to {}", size, local.display()),
            Err(e) => {
                error!(
                    "Unable to download object from bucket {}: key {}: {}",
                    self.bucket(),
                    object_key,
                    e
                );
                discard_file(&local).await;
                return Err(e);
            }
        }

        Ok(local)
    }
}
