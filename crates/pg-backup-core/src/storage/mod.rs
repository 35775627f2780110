//! Storage backend abstraction and implementations.
//!
//! - **S3**: AWS S3 and S3-compatible services (MinIO, Ceph RGW, etc.)
//! - **Filesystem**: a directory standing in for a bucket
//! - **Memory**: In-memory storage (for testing)

mod backend;
mod config;
mod filesystem;
mod memory;
mod s3;
mod stream;

pub use backend::StorageBackend;
pub use config::StorageBackendConfig;
pub use filesystem::FilesystemBackend;
pub use memory::MemoryBackend;
pub use s3::{S3Backend, S3Config};

use crate::Result;
use std::sync::Arc;

/// Create a storage backend from configuration.
///
/// The backend is bound to the configured bucket; no request is made until
/// it is used.
pub fn create_backend(config: &StorageBackendConfig) -> Result<Arc<dyn StorageBackend>> {
    config.validate()?;

    match config {
        StorageBackendConfig::S3 {
            bucket,
            prefix: _,
            region,
            endpoint,
            access_key,
            secret_key,
            allow_http,
        } => {
            let s3_config = S3Config {
                bucket: bucket.clone(),
                region: region.clone(),
                endpoint: endpoint.clone(),
                access_key_id: access_key.clone(),
                secret_access_key: secret_key.clone(),
                allow_http: *allow_http,
            };
            Ok(Arc::new(S3Backend::new(s3_config)?))
        }

        StorageBackendConfig::Filesystem { root, bucket, .. } => {
            Ok(Arc::new(FilesystemBackend::new(root.clone(), bucket.clone())))
        }
    }
}
