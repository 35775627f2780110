//! PostgreSQL Backup Core Library
//!
//! This crate backs up a running Postgres cluster into object storage and
//! restores it again. A backup puts the instance into physical backup mode,
//! takes a logical dump, archives and uploads it, then releases backup mode
//! and reports the WAL range it covers.

pub mod archive;
pub mod backup;
pub mod config;
pub mod error;
pub mod instance;
pub mod repository;
pub mod restore;
pub mod retry;
pub mod snapshot;
pub mod storage;

pub use backup::{
    perform_backup, BackupExecutor, BackupPhase, BackupResult, BackupSession, CompletedBackup,
};
pub use config::{BackupModeOptions, Config, InstanceConfig, SnapshotConfig};
pub use error::{BackupModeError, Error, InstanceError, Result, StorageError};
pub use instance::{
    BackupModePhase, BackupStatus, HttpInstanceClient, InstanceClient, StartBackupRequest,
    StopBackupRequest,
};
pub use repository::{BackupStore, Repository};
pub use restore::{restore, RestoreOrchestrator, RestoreStep};
pub use retry::RetryPolicy;
pub use snapshot::{Snapshotter, SqlSnapshotter};
pub use storage::{StorageBackend, StorageBackendConfig};
