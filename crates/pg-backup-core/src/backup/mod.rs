//! Online backup of a Postgres cluster into object storage.

pub mod executor;

pub use executor::{BackupExecutor, BackupPhase, BackupSession, CompletedBackup};

use base64::Engine;
use serde::{Serialize, Serializer};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::instance::HttpInstanceClient;
use crate::repository::Repository;
use crate::retry::cancellable;
use crate::snapshot::SqlSnapshotter;
use crate::Result;

/// Outcome of a backup, as reported to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupResult {
    pub backup_id: String,
    pub backup_name: String,
    /// Object key of the uploaded archive
    pub object_key: String,
    /// Seconds since the epoch
    pub started_at: i64,
    /// Seconds since the epoch
    pub stopped_at: i64,
    pub begin_wal: String,
    pub end_wal: String,
    pub begin_lsn: String,
    pub end_lsn: String,
    #[serde(serialize_with = "base64_bytes")]
    pub backup_label_file: Vec<u8>,
    #[serde(serialize_with = "base64_bytes")]
    pub tablespace_map_file: Vec<u8>,
    /// Always true: the cluster keeps serving during the backup
    pub online: bool,
}

fn base64_bytes<S: Serializer>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
}

impl From<&CompletedBackup> for BackupResult {
    fn from(done: &CompletedBackup) -> Self {
        let status = done.status();
        Self {
            backup_id: done.backup_name().to_string(),
            backup_name: done.backup_name().to_string(),
            object_key: done.object_key().to_string(),
            started_at: done.started_at().timestamp(),
            stopped_at: done.stopped_at().timestamp(),
            begin_wal: done.begin_wal().to_string(),
            end_wal: done.end_wal().to_string(),
            begin_lsn: status.begin_lsn.clone(),
            end_lsn: status.end_lsn.clone(),
            backup_label_file: status.label_file.clone(),
            tablespace_map_file: status.spcmap_file.clone(),
            online: true,
        }
    }
}

/// Back up the local cluster into `bucket` under `prefix`.
///
/// The rest of the settings (instance endpoints, commands, working
/// directory, retry schedule) come from `config`.
pub async fn perform_backup(
    config: &Config,
    bucket: &str,
    prefix: &str,
    cancel: &CancellationToken,
) -> Result<BackupResult> {
    let config = config.clone().with_location(bucket, prefix);
    config.validate()?;

    let repository = cancellable(cancel, Repository::from_config(&config)).await?;
    let instance = HttpInstanceClient::new(&config.instance)?;
    let snapshotter = SqlSnapshotter::new(config.snapshot.clone());

    let mut executor = BackupExecutor::new(
        Arc::new(instance),
        Arc::new(repository),
        Arc::new(snapshotter),
        config.backup_mode.clone(),
    );
    info!(
        "Starting backup {} into {}/{}",
        executor.backup_name(),
        bucket,
        prefix
    );

    let completed = executor.execute(cancel).await?;
    Ok(BackupResult::from(&completed))
}
