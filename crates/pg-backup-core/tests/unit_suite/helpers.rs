//! Test helper utilities.
//!
//! In-process stand-ins for the collaborators of the backup executor and
//! the restore orchestrator. Every fake appends to a shared [`EventLog`] so
//! tests can assert on the order in which things happened.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use pg_backup_core::instance::CURRENT_WAL_FILE_KEY;
use pg_backup_core::storage::MemoryBackend;
use pg_backup_core::{
    BackupModeOptions, BackupModePhase, BackupStatus, BackupStore, Error, InstanceClient,
    InstanceError, Repository, Result, RetryPolicy, Snapshotter, StartBackupRequest,
    StopBackupRequest,
};

pub const DUMP_NAME: &str = "20240101120000.sql";
pub const DUMP_CONTENTS: &str = "CREATE TABLE t (id int);\nINSERT INTO t VALUES (1);\n";
pub const BEGIN_WAL: &str = "000000010000000000000003";
pub const END_WAL: &str = "000000010000000000000005";

/// Ordered record of calls made on the fakes
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// Index of the first event starting with `prefix`
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.0.lock().iter().position(|e| e.starts_with(prefix))
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.0.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

/// A fast polling schedule for tests
pub fn fast_options(steps: u32) -> BackupModeOptions {
    BackupModeOptions {
        retry: RetryPolicy {
            steps,
            initial_delay_ms: 1,
            factor: 2.0,
            jitter: 0.1,
            max_delay_ms: Some(20),
        },
        release_on_failure: true,
    }
}

// ============================================================================
// Instance manager
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Idle,
    Starting { polls: usize },
    Started,
    Stopping { polls: usize },
    Completed,
}

/// Scripted backup-control API.
///
/// After a start request the status reports `starting` for
/// `polls_until_started` polls, then `started`; after a stop request it
/// reports `closing` for `polls_until_stopped` polls, then `completed`.
pub struct ScriptedInstance {
    log: EventLog,
    mode: Mutex<Mode>,
    wal_files: Mutex<VecDeque<String>>,
    pub polls_until_started: usize,
    pub polls_until_stopped: usize,
    pub reject_start: bool,
    pub reject_stop: bool,
    pub fail_control_data: bool,
}

impl ScriptedInstance {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            mode: Mutex::new(Mode::Idle),
            wal_files: Mutex::new(VecDeque::from([BEGIN_WAL.to_string(), END_WAL.to_string()])),
            polls_until_started: 0,
            polls_until_stopped: 0,
            reject_start: false,
            reject_stop: false,
            fail_control_data: false,
        }
    }

    pub fn with_polls(mut self, until_started: usize, until_stopped: usize) -> Self {
        self.polls_until_started = until_started;
        self.polls_until_stopped = until_stopped;
        self
    }

    fn rejected(&self, what: &str) -> Error {
        InstanceError::Status {
            url: "http://127.0.0.1:8010/pg/mode/backup".to_string(),
            status: 500,
            message: format!("{} rejected", what),
        }
        .into()
    }
}

#[async_trait]
impl InstanceClient for ScriptedInstance {
    async fn control_data(&self, _cancel: &CancellationToken) -> Result<HashMap<String, String>> {
        self.log.push("control_data");
        if self.fail_control_data {
            return Err(InstanceError::Connection {
                url: "http://127.0.0.1:8000/pg/controldata".to_string(),
                message: "connection refused".to_string(),
            }
            .into());
        }

        let mut wal_files = self.wal_files.lock();
        let current = if wal_files.len() > 1 {
            wal_files.pop_front()
        } else {
            wal_files.front().cloned()
        };
        let mut pairs = HashMap::new();
        if let Some(wal) = current {
            pairs.insert(CURRENT_WAL_FILE_KEY.to_string(), wal);
        }
        Ok(pairs)
    }

    async fn start_backup(
        &self,
        request: &StartBackupRequest,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.log.push(format!("start:{}", request.backup_name));
        if self.reject_start {
            return Err(self.rejected("start"));
        }
        *self.mode.lock() = Mode::Starting { polls: 0 };
        Ok(())
    }

    async fn stop_backup(
        &self,
        request: &StopBackupRequest,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.log.push(format!("stop:{}", request.backup_name));
        if self.reject_stop {
            return Err(self.rejected("stop"));
        }
        *self.mode.lock() = Mode::Stopping { polls: 0 };
        Ok(())
    }

    async fn backup_status(&self, _cancel: &CancellationToken) -> Result<BackupStatus> {
        let mut mode = self.mode.lock();
        let current = *mode;
        let phase = match current {
            Mode::Idle => BackupModePhase::Unknown,
            Mode::Starting { polls } if polls < self.polls_until_started => {
                *mode = Mode::Starting { polls: polls + 1 };
                BackupModePhase::Starting
            }
            Mode::Starting { .. } | Mode::Started => {
                *mode = Mode::Started;
                BackupModePhase::Started
            }
            Mode::Stopping { polls } if polls < self.polls_until_stopped => {
                *mode = Mode::Stopping { polls: polls + 1 };
                BackupModePhase::Closing
            }
            Mode::Stopping { .. } | Mode::Completed => {
                *mode = Mode::Completed;
                BackupModePhase::Completed
            }
        };
        self.log.push(format!("status:{}", phase));

        let mut status = BackupStatus {
            phase,
            ..Default::default()
        };
        if phase == BackupModePhase::Completed {
            status.begin_lsn = "0/3000028".to_string();
            status.end_lsn = "0/5000100".to_string();
            status.label_file = b"START WAL LOCATION: 0/3000028".to_vec();
            status.spcmap_file = Vec::new();
        }
        Ok(status)
    }
}

// ============================================================================
// Snapshot tool
// ============================================================================

/// Writes a fixed dump file and records replays
pub struct FakeSnapshotter {
    log: EventLog,
    pub dump_name: String,
    pub fail_dump: bool,
    pub fail_replay: bool,
    /// Cancelled right after the dump file is written
    pub cancel_after_dump: Option<CancellationToken>,
    replayed: Mutex<Vec<(PathBuf, String)>>,
}

impl FakeSnapshotter {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            dump_name: DUMP_NAME.to_string(),
            fail_dump: false,
            fail_replay: false,
            cancel_after_dump: None,
            replayed: Mutex::new(Vec::new()),
        }
    }

    /// Paths handed to replay, with the file contents seen at that time
    pub fn replayed(&self) -> Vec<(PathBuf, String)> {
        self.replayed.lock().clone()
    }
}

#[async_trait]
impl Snapshotter for FakeSnapshotter {
    async fn dump(&self, output_dir: &Path, _cancel: &CancellationToken) -> Result<PathBuf> {
        self.log.push("dump");
        if self.fail_dump {
            return Err(Error::Command {
                command: "pg_dumpall".to_string(),
                status: "exit status: 1".to_string(),
                stderr: "could not connect".to_string(),
            });
        }
        let path = output_dir.join(&self.dump_name);
        tokio::fs::write(&path, DUMP_CONTENTS).await?;
        if let Some(cancel) = &self.cancel_after_dump {
            cancel.cancel();
        }
        Ok(path)
    }

    async fn replay(&self, dump_file: &Path, _cancel: &CancellationToken) -> Result<()> {
        self.log.push(format!("replay:{}", dump_file.display()));
        let contents = tokio::fs::read_to_string(dump_file).await?;
        self.replayed
            .lock()
            .push((dump_file.to_path_buf(), contents));
        if self.fail_replay {
            return Err(Error::Command {
                command: "psql".to_string(),
                status: "exit status: 3".to_string(),
                stderr: "syntax error".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Repository over an in-memory bucket
pub async fn memory_repository(
    bucket: &str,
    prefix: &str,
    working_dir: &Path,
) -> (Arc<MemoryBackend>, Repository) {
    let backend = Arc::new(MemoryBackend::new(bucket));
    let repository = Repository::connect(backend.clone(), prefix, working_dir)
        .await
        .unwrap();
    (backend, repository)
}

/// [`BackupStore`] that records uploads and can be told to fail them.
///
/// A failed upload leaves the local file alone.
pub struct RecordingStore {
    inner: Repository,
    log: EventLog,
    pub fail_put: bool,
}

impl RecordingStore {
    pub fn new(inner: Repository, log: EventLog) -> Self {
        Self {
            inner,
            log,
            fail_put: false,
        }
    }
}

#[async_trait]
impl BackupStore for RecordingStore {
    fn working_dir(&self) -> &Path {
        self.inner.working_dir()
    }

    async fn put_file(&self, key: &str, path: &Path) -> Result<String> {
        self.log.push(format!("upload:{}", key));
        if self.fail_put {
            return Err(pg_backup_core::StorageError::Backend("upload refused".to_string()).into());
        }
        self.inner.put_file(key, path).await
    }

    async fn get_file(&self, key: &str) -> Result<PathBuf> {
        self.log.push(format!("download:{}", key));
        self.inner.get_file(key).await
    }
}

/// Regular files below `dir`, relative to it
pub fn files_in(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(relative) = path.strip_prefix(dir) {
                files.push(relative.to_path_buf());
            }
        }
    }
    files.sort();
    files
}
