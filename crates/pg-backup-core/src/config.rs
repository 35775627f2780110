//! Configuration structures for backup and restore operations.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::storage::StorageBackendConfig;
use crate::{Error, Result};

/// Plugin parameter keys understood by [`Config::from_parameters`].
pub mod params {
    pub const REGION: &str = "region";
    pub const ENDPOINT: &str = "endpoint";
    pub const AWS_KEY: &str = "aws_key";
    pub const AWS_SECRET_KEY: &str = "aws_secret_key";
    pub const BUCKET: &str = "bucket";
    pub const PREFIX: &str = "prefix";
}

/// Environment variables read by [`Config::from_env`].
pub mod env {
    pub const BUCKET: &str = "AWS_BUCKET";
    pub const PREFIX: &str = "BACKUP_PREFIX";
    pub const REGION: &str = "AWS_REGION";
    pub const ENDPOINT: &str = "AWS_ENDPOINT_URL";
    pub const ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
    pub const SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Storage configuration (S3 or filesystem)
    pub storage: StorageBackendConfig,

    /// Instance manager endpoints
    #[serde(default)]
    pub instance: InstanceConfig,

    /// Dump and replay commands
    #[serde(default)]
    pub snapshot: SnapshotConfig,

    /// Local directory for dumps, archives and downloads (default: /backup)
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,

    /// Backup mode negotiation options
    #[serde(default)]
    pub backup_mode: BackupModeOptions,
}

fn default_working_dir() -> PathBuf {
    PathBuf::from("/backup")
}

/// Addresses and timeouts of the instance manager running next to Postgres
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Host of the instance manager (default: 127.0.0.1)
    #[serde(default = "default_host")]
    pub host: String,

    /// Port serving `/pg/controldata` (default: 8000)
    #[serde(default = "default_status_port")]
    pub status_port: u16,

    /// Port serving `/pg/mode/backup` (default: 8010)
    #[serde(default = "default_backup_port")]
    pub backup_port: u16,

    /// TCP connect timeout in milliseconds (default: 2000)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Total request timeout in milliseconds (default: 30000)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_status_port() -> u16 {
    8000
}

fn default_backup_port() -> u16 {
    8010
}

fn default_connect_timeout_ms() -> u64 {
    2_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            status_port: default_status_port(),
            backup_port: default_backup_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl InstanceConfig {
    /// URL of the control-data endpoint
    pub fn control_data_url(&self) -> String {
        format!("http://{}:{}/pg/controldata", self.host, self.status_port)
    }

    /// URL of the backup-mode endpoint
    pub fn backup_mode_url(&self) -> String {
        format!("http://{}:{}/pg/mode/backup", self.host, self.backup_port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// External logical dump and replay commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Dump executable (default: pg_dumpall)
    #[serde(default = "default_dump_command")]
    pub dump_command: String,

    /// Replay executable (default: psql)
    #[serde(default = "default_replay_command")]
    pub replay_command: String,

    /// Directory of the local database socket (default: /controller/run)
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,
}

fn default_dump_command() -> String {
    "pg_dumpall".to_string()
}

fn default_replay_command() -> String {
    "psql".to_string()
}

fn default_socket_dir() -> PathBuf {
    PathBuf::from("/controller/run")
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            dump_command: default_dump_command(),
            replay_command: default_replay_command(),
            socket_dir: default_socket_dir(),
        }
    }
}

/// Backup mode negotiation options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupModeOptions {
    /// Polling schedule for the start and stop confirmations
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Send one stop request when the data copy fails after backup mode
    /// was confirmed (default: true)
    #[serde(default = "default_release_on_failure")]
    pub release_on_failure: bool,
}

fn default_release_on_failure() -> bool {
    true
}

impl Default for BackupModeOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            release_on_failure: default_release_on_failure(),
        }
    }
}

impl Config {
    /// Configuration with defaults for everything but storage
    pub fn new(storage: StorageBackendConfig) -> Self {
        Self {
            storage,
            instance: InstanceConfig::default(),
            snapshot: SnapshotConfig::default(),
            working_dir: default_working_dir(),
            backup_mode: BackupModeOptions::default(),
        }
    }

    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Build an S3 configuration from the process environment
    ///
    /// Missing variables stay unset; the bucket is checked by
    /// [`Config::validate`] once the caller had a chance to override it.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let endpoint = get(env::ENDPOINT);
        let allow_http = endpoint
            .as_deref()
            .is_some_and(|e| e.starts_with("http://"));

        Self::new(StorageBackendConfig::S3 {
            bucket: get(env::BUCKET).unwrap_or_default(),
            prefix: get(env::PREFIX).unwrap_or_default(),
            region: get(env::REGION),
            endpoint,
            access_key: get(env::ACCESS_KEY_ID),
            secret_key: get(env::SECRET_ACCESS_KEY),
            allow_http,
        })
    }

    /// Build an S3 configuration from the flat plugin parameter map
    pub fn from_parameters(parameters: &HashMap<String, String>) -> Result<Self> {
        let config = Self::from_lookup(|key| {
            let param = match key {
                env::BUCKET => params::BUCKET,
                env::PREFIX => params::PREFIX,
                env::REGION => params::REGION,
                env::ENDPOINT => params::ENDPOINT,
                env::ACCESS_KEY_ID => params::AWS_KEY,
                env::SECRET_ACCESS_KEY => params::AWS_SECRET_KEY,
                _ => return None,
            };
            parameters.get(param).cloned()
        });
        config.storage.validate()?;
        Ok(config)
    }

    /// Flatten the storage settings back into plugin parameters
    pub fn to_parameters(&self) -> HashMap<String, String> {
        self.storage_pairs(|p, _| p)
    }

    /// Environment of a sidecar that should reproduce this configuration
    /// through [`Config::from_env`]
    pub fn to_env_vars(&self) -> HashMap<String, String> {
        self.storage_pairs(|_, e| e)
    }

    fn storage_pairs(
        &self,
        pick: impl Fn(&'static str, &'static str) -> &'static str,
    ) -> HashMap<String, String> {
        let mut out = HashMap::new();
        let mut insert = |param, var, value: Option<&str>| {
            if let Some(value) = value.filter(|v| !v.is_empty()) {
                out.insert(pick(param, var).to_string(), value.to_string());
            }
        };

        insert(params::BUCKET, env::BUCKET, Some(self.storage.bucket()));
        insert(params::PREFIX, env::PREFIX, Some(self.storage.prefix()));

        if let StorageBackendConfig::S3 {
            region,
            endpoint,
            access_key,
            secret_key,
            ..
        } = &self.storage
        {
            insert(params::REGION, env::REGION, region.as_deref());
            insert(params::ENDPOINT, env::ENDPOINT, endpoint.as_deref());
            insert(params::AWS_KEY, env::ACCESS_KEY_ID, access_key.as_deref());
            insert(
                params::AWS_SECRET_KEY,
                env::SECRET_ACCESS_KEY,
                secret_key.as_deref(),
            );
        }

        out
    }

    /// Same configuration pointed at another bucket and prefix
    pub fn with_location(mut self, bucket: &str, prefix: &str) -> Self {
        self.storage = self.storage.with_location(bucket, prefix);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.storage.validate()?;
        self.backup_mode.retry.validate()?;

        if !self.working_dir.is_absolute() {
            return Err(Error::Config(format!(
                "working_dir must be absolute: {}",
                self.working_dir.display()
            )));
        }

        if self.instance.connect_timeout_ms == 0 || self.instance.request_timeout_ms == 0 {
            return Err(Error::Config(
                "instance timeouts must be greater than zero".to_string(),
            ));
        }

        if self.snapshot.dump_command.trim().is_empty()
            || self.snapshot.replay_command.trim().is_empty()
        {
            return Err(Error::Config(
                "snapshot commands cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}
