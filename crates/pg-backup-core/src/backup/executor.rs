//! Backup mode state machine.
//!
//! A backup moves through these phases:
//!
//! ```text
//! Idle -> ModeRequested -> ModeConfirmedStarted -> SnapshotCaptured
//!      -> ModeStopRequested -> ModeConfirmedStopped -> Done
//! ```
//!
//! Any failure moves it to `Failed`. The snapshot is only taken once the
//! instance confirmed backup mode, and the stop is only requested once the
//! snapshot is uploaded, so the begin and end WAL markers bracket the copy.

use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::archive::{archive_name, create_archive_async};
use crate::config::BackupModeOptions;
use crate::error::BackupModeError;
use crate::instance::{
    BackupModePhase, BackupStatus, InstanceClient, StartBackupRequest, StopBackupRequest,
};
use crate::repository::BackupStore;
use crate::retry::cancellable;
use crate::snapshot::{discard_file, Snapshotter};
use crate::{Error, Result};

/// Phase of a backup run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackupPhase {
    Idle,
    ModeRequested,
    ModeConfirmedStarted,
    SnapshotCaptured,
    ModeStopRequested,
    ModeConfirmedStopped,
    Done,
    Failed,
}

impl BackupPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for BackupPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::ModeRequested => "mode-requested",
            Self::ModeConfirmedStarted => "mode-confirmed-started",
            Self::SnapshotCaptured => "snapshot-captured",
            Self::ModeStopRequested => "mode-stop-requested",
            Self::ModeConfirmedStopped => "mode-confirmed-stopped",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Everything recorded by a backup that ran to completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedBackup {
    backup_name: String,
    object_key: String,
    begin_wal: String,
    end_wal: String,
    started_at: DateTime<Utc>,
    stopped_at: DateTime<Utc>,
    status: BackupStatus,
}

impl CompletedBackup {
    pub fn backup_name(&self) -> &str {
        &self.backup_name
    }

    /// Object key the archive was uploaded under
    pub fn object_key(&self) -> &str {
        &self.object_key
    }

    pub fn begin_wal(&self) -> &str {
        &self.begin_wal
    }

    pub fn end_wal(&self) -> &str {
        &self.end_wal
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn stopped_at(&self) -> DateTime<Utc> {
        self.stopped_at
    }

    /// Status reported by the instance when it confirmed the stop
    pub fn status(&self) -> &BackupStatus {
        &self.status
    }
}

/// A backup that is either still running or finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupSession {
    Pending { backup_name: String },
    Completed(CompletedBackup),
}

impl BackupSession {
    pub fn backup_name(&self) -> &str {
        match self {
            Self::Pending { backup_name } => backup_name,
            Self::Completed(done) => &done.backup_name,
        }
    }

    /// WAL file current when backup mode was requested
    pub fn begin_wal(&self) -> Result<&str> {
        match self {
            Self::Pending { .. } => Err(Error::BackupNotExecuted),
            Self::Completed(done) => Ok(&done.begin_wal),
        }
    }

    /// WAL file current once backup mode was released
    pub fn end_wal(&self) -> Result<&str> {
        match self {
            Self::Pending { .. } => Err(Error::BackupNotExecuted),
            Self::Completed(done) => Ok(&done.end_wal),
        }
    }

    pub fn completed(&self) -> Option<&CompletedBackup> {
        match self {
            Self::Pending { .. } => None,
            Self::Completed(done) => Some(done),
        }
    }
}

/// Drives one backup through backup mode, snapshot and upload
pub struct BackupExecutor {
    instance: Arc<dyn InstanceClient>,
    store: Arc<dyn BackupStore>,
    snapshotter: Arc<dyn Snapshotter>,
    options: BackupModeOptions,
    session: BackupSession,
    phase: BackupPhase,
}

impl BackupExecutor {
    /// Create an executor with a freshly generated backup name
    pub fn new(
        instance: Arc<dyn InstanceClient>,
        store: Arc<dyn BackupStore>,
        snapshotter: Arc<dyn Snapshotter>,
        options: BackupModeOptions,
    ) -> Self {
        Self {
            instance,
            store,
            snapshotter,
            options,
            session: BackupSession::Pending {
                backup_name: Uuid::new_v4().to_string(),
            },
            phase: BackupPhase::Idle,
        }
    }

    pub fn backup_name(&self) -> &str {
        self.session.backup_name()
    }

    pub fn phase(&self) -> BackupPhase {
        self.phase
    }

    pub fn session(&self) -> &BackupSession {
        &self.session
    }

    fn transition(&mut self, next: BackupPhase) {
        info!(
            "Backup {}: {} -> {}",
            self.session.backup_name(),
            self.phase,
            next
        );
        self.phase = next;
    }

    /// Run the backup.
    ///
    /// Errors are wrapped with the phase that failed, except for
    /// cancellation which is returned as [`Error::Cancelled`].
    pub async fn execute(&mut self, cancel: &CancellationToken) -> Result<CompletedBackup> {
        if self.phase != BackupPhase::Idle {
            return Err(Error::Config(format!(
                "backup {} already ran (phase: {})",
                self.backup_name(),
                self.phase
            )));
        }

        match self.run(cancel).await {
            Ok(completed) => {
                self.session = BackupSession::Completed(completed.clone());
                self.transition(BackupPhase::Done);
                Ok(completed)
            }
            Err(e) => {
                error!("Backup {} failed in {}: {}", self.backup_name(), self.phase, e);
                self.transition(BackupPhase::Failed);
                Err(e)
            }
        }
    }

    async fn run(&mut self, cancel: &CancellationToken) -> Result<CompletedBackup> {
        let backup_name = self.backup_name().to_string();
        let started_at = Utc::now();

        info!("Preparing physical backup {}", backup_name);
        let begin_wal = self
            .instance
            .current_wal_file(cancel)
            .await
            .map_err(|e| e.in_phase(BackupPhase::ModeRequested))?;
        debug!("Begin WAL for {}: {}", backup_name, begin_wal);

        self.instance
            .start_backup(&StartBackupRequest::forced(&backup_name), cancel)
            .await
            .map_err(|e| e.in_phase(BackupPhase::ModeRequested))?;
        self.transition(BackupPhase::ModeRequested);

        self.await_instance_phase(BackupModePhase::Started, cancel)
            .await
            .map_err(|e| e.in_phase(BackupPhase::ModeConfirmedStarted))?;
        self.transition(BackupPhase::ModeConfirmedStarted);

        let object_key = match self.capture_snapshot(cancel).await {
            Ok(key) => key,
            Err(e) => {
                if self.options.release_on_failure {
                    self.release_backup_mode(&backup_name).await;
                }
                return Err(e.in_phase(BackupPhase::SnapshotCaptured));
            }
        };
        self.transition(BackupPhase::SnapshotCaptured);

        info!("Finishing backup {}", backup_name);
        self.instance
            .stop_backup(
                &StopBackupRequest {
                    backup_name: backup_name.clone(),
                },
                cancel,
            )
            .await
            .map_err(|e| e.in_phase(BackupPhase::ModeStopRequested))?;
        self.transition(BackupPhase::ModeStopRequested);

        let status = self
            .await_instance_phase(BackupModePhase::Completed, cancel)
            .await
            .map_err(|e| e.in_phase(BackupPhase::ModeConfirmedStopped))?;
        self.transition(BackupPhase::ModeConfirmedStopped);

        let end_wal = self
            .instance
            .current_wal_file(cancel)
            .await
            .map_err(|e| e.in_phase(BackupPhase::Done))?;
        debug!("End WAL for {}: {}", backup_name, end_wal);

        Ok(CompletedBackup {
            backup_name,
            object_key,
            begin_wal,
            end_wal,
            started_at,
            stopped_at: Utc::now(),
            status,
        })
    }

    /// Poll the instance until it reports `target`.
    async fn await_instance_phase(
        &self,
        target: BackupModePhase,
        cancel: &CancellationToken,
    ) -> Result<BackupStatus> {
        let (operation, is_retryable): (&str, fn(&Error) -> bool) =
            if target == BackupModePhase::Started {
                ("confirm backup mode start", Error::is_backup_not_started)
            } else {
                ("confirm backup mode stop", Error::is_backup_not_stopped)
            };
        let instance = &self.instance;

        self.options
            .retry
            .retry(operation, cancel, is_retryable, || async move {
                let status = instance.backup_status(cancel).await?;
                if status.phase == target {
                    return Ok(status);
                }

                debug!("Backup mode is {} while waiting for {}", status.phase, target);
                let phase = status.phase.to_string();
                let mismatch = if target == BackupModePhase::Started {
                    BackupModeError::NotStarted { phase }
                } else {
                    BackupModeError::NotStopped { phase }
                };
                Err::<BackupStatus, Error>(Error::BackupMode(mismatch))
            })
            .await
    }

    /// Dump, archive and upload; returns the object key.
    ///
    /// On failure the dump and the archive are removed from the working
    /// directory.
    async fn capture_snapshot(&self, cancel: &CancellationToken) -> Result<String> {
        let working_dir = self.store.working_dir().to_path_buf();
        tokio::fs::create_dir_all(&working_dir).await?;

        info!("Creating snapshot");
        let dump = self.snapshotter.dump(&working_dir, cancel).await?;
        let archive = archive_name(&file_name(&dump)?);
        let archive_path = working_dir.join(&archive);

        let uploaded = self
            .archive_and_upload(&dump, &archive, &archive_path, cancel)
            .await;
        if uploaded.is_err() {
            discard_file(&dump).await;
            discard_file(&archive_path).await;
        }
        uploaded
    }

    async fn archive_and_upload(
        &self,
        dump: &Path,
        archive: &str,
        archive_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<String> {
        info!("Archiving snapshot {}", dump.display());
        // Not raced against `cancel`: the blocking writer cannot be stopped.
        create_archive_async(archive_path.to_path_buf(), vec![dump.to_path_buf()]).await?;
        tokio::fs::remove_file(dump).await?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        info!("Uploading snapshot {}", archive);
        cancellable(cancel, self.store.put_file(archive, archive_path)).await
    }

    /// One stop request after a failed snapshot; failures are only logged.
    async fn release_backup_mode(&self, backup_name: &str) {
        // Fresh token: the caller's may be the reason we are failing.
        let request = StopBackupRequest {
            backup_name: backup_name.to_string(),
        };
        match self
            .instance
            .stop_backup(&request, &CancellationToken::new())
            .await
        {
            Ok(()) => warn!("Requested backup mode release for {} after failure", backup_name),
            Err(e) => warn!(
                "Failed to release backup mode for {}; the instance stays in backup mode: {}",
                backup_name, e
            ),
        }
    }
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::Archive(format!("not a file path: {}", path.display())))
}
