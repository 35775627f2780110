//! Storage configuration types.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Storage backend configuration using a tagged enum for type-safe configuration.
///
/// Supports:
/// - S3 and S3-compatible (MinIO, Ceph RGW, etc.)
/// - Local filesystem, where a "bucket" is a directory below `root`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend")]
pub enum StorageBackendConfig {
    /// AWS S3 or S3-compatible storage
    #[serde(rename = "s3")]
    S3 {
        /// S3 bucket name
        bucket: String,
        /// Key prefix for all backups
        #[serde(default)]
        prefix: String,
        /// AWS region (falls back to AWS_REGION)
        #[serde(default)]
        region: Option<String>,
        /// Custom endpoint URL (for S3-compatible services like MinIO)
        #[serde(default)]
        endpoint: Option<String>,
        /// Access key ID (falls back to AWS_ACCESS_KEY_ID)
        #[serde(default)]
        access_key: Option<String>,
        /// Secret access key (falls back to AWS_SECRET_ACCESS_KEY)
        #[serde(default)]
        secret_key: Option<String>,
        /// Allow HTTP (insecure) connections
        #[serde(default)]
        allow_http: bool,
    },

    /// Local filesystem storage
    #[serde(rename = "filesystem")]
    Filesystem {
        /// Directory holding the buckets
        root: PathBuf,
        /// Bucket directory name below `root`; must already exist
        bucket: String,
        /// Key prefix for all backups
        #[serde(default)]
        prefix: String,
    },
}

impl StorageBackendConfig {
    /// S3 configuration for a bucket with every other setting left to the
    /// ambient AWS environment.
    pub fn s3(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self::S3 {
            bucket: bucket.into(),
            prefix: prefix.into(),
            region: None,
            endpoint: None,
            access_key: None,
            secret_key: None,
            allow_http: false,
        }
    }

    /// Parse configuration from a URL string
    ///
    /// Supported URL formats:
    /// - `s3://bucket-name/prefix?region=us-east-1&endpoint=http://minio:9000`
    /// - `file:///var/buckets?bucket=bucket-name&prefix=cluster-a`
    pub fn from_url(url: &str) -> crate::Result<Self> {
        let parsed = url::Url::parse(url)
            .map_err(|e| crate::Error::Config(format!("Invalid storage URL: {}", e)))?;

        let query = |key: &str| {
            parsed
                .query_pairs()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.to_string())
        };

        match parsed.scheme() {
            "s3" | "s3a" => {
                let bucket = parsed.host_str().unwrap_or_default().to_string();
                let endpoint = query("endpoint");
                let allow_http = endpoint
                    .as_deref()
                    .is_some_and(|e| e.starts_with("http://"));

                Ok(Self::S3 {
                    bucket,
                    prefix: parsed.path().trim_matches('/').to_string(),
                    region: query("region"),
                    endpoint,
                    access_key: None,
                    secret_key: None,
                    allow_http,
                })
            }
            "file" => {
                let bucket = query("bucket").ok_or_else(|| {
                    crate::Error::Config(format!("Filesystem URL needs a bucket: {}", url))
                })?;
                Ok(Self::Filesystem {
                    root: PathBuf::from(parsed.path()),
                    bucket,
                    prefix: query("prefix").unwrap_or_default(),
                })
            }
            scheme => Err(crate::Error::Config(format!(
                "Unknown storage scheme: {}",
                scheme
            ))),
        }
    }

    /// Bucket name for this storage configuration
    pub fn bucket(&self) -> &str {
        match self {
            Self::S3 { bucket, .. } => bucket,
            Self::Filesystem { bucket, .. } => bucket,
        }
    }

    /// Key prefix for this storage configuration
    pub fn prefix(&self) -> &str {
        match self {
            Self::S3 { prefix, .. } => prefix,
            Self::Filesystem { prefix, .. } => prefix,
        }
    }

    /// Same backend settings pointed at another bucket and prefix.
    pub fn with_location(mut self, new_bucket: &str, new_prefix: &str) -> Self {
        match &mut self {
            Self::S3 { bucket, prefix, .. } | Self::Filesystem { bucket, prefix, .. } => {
                *bucket = new_bucket.to_string();
                *prefix = new_prefix.to_string();
            }
        }
        self
    }

    /// Validate the storage configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.bucket().trim().is_empty() {
            return Err(crate::Error::Config("bucket cannot be empty".to_string()));
        }

        if let Self::Filesystem { root, bucket, .. } = self {
            if !root.is_absolute() {
                return Err(crate::Error::Config(format!(
                    "filesystem root must be absolute: {}",
                    root.display()
                )));
            }
            if bucket.contains('/') {
                return Err(crate::Error::Config(format!(
                    "filesystem bucket must be a single directory name: {}",
                    bucket
                )));
            }
        }

        Ok(())
    }
}
