//! Logical dump and replay through external executables.
//!
//! Both commands talk to the database through its local socket directory.
//! There is no retry here: a failed dump or replay fails the whole backup
//! or restore.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SnapshotConfig;
use crate::{Error, Result};

/// Timestamp layout of dump file names, e.g. `20240101120000.sql`
pub const DUMP_TIME_FORMAT: &str = "%Y%m%d%H%M%S";

/// Name of the dump file taken at `at`
pub fn dump_file_name(at: DateTime<Utc>) -> String {
    format!("{}.sql", at.format(DUMP_TIME_FORMAT))
}

/// Produces and consumes plain-text logical dumps
#[async_trait]
pub trait Snapshotter: Send + Sync {
    /// Dump the whole cluster into a new file below `output_dir`
    async fn dump(&self, output_dir: &Path, cancel: &CancellationToken) -> Result<PathBuf>;

    /// Feed `dump_file` back into the cluster
    async fn replay(&self, dump_file: &Path, cancel: &CancellationToken) -> Result<()>;
}

/// `pg_dumpall` / `psql` pair run against the local socket
#[derive(Debug, Clone)]
pub struct SqlSnapshotter {
    config: SnapshotConfig,
}

impl SqlSnapshotter {
    pub fn new(config: SnapshotConfig) -> Self {
        Self { config }
    }

    fn socket_args(&self, file: &Path) -> Vec<OsString> {
        vec![
            "-h".into(),
            self.config.socket_dir.clone().into_os_string(),
            "-f".into(),
            file.as_os_str().to_owned(),
        ]
    }
}

#[async_trait]
impl Snapshotter for SqlSnapshotter {
    async fn dump(&self, output_dir: &Path, cancel: &CancellationToken) -> Result<PathBuf> {
        let file = output_dir.join(dump_file_name(Utc::now()));
        info!("Dumping cluster to {}", file.display());

        let dumped = run_command(&self.config.dump_command, &self.socket_args(&file), cancel).await;
        if let Err(e) = dumped {
            discard_file(&file).await;
            return Err(e);
        }
        Ok(file)
    }

    async fn replay(&self, dump_file: &Path, cancel: &CancellationToken) -> Result<()> {
        info!("Replaying {}", dump_file.display());
        run_command(
            &self.config.replay_command,
            &self.socket_args(dump_file),
            cancel,
        )
        .await
    }
}

/// Remove a working file, tolerating its absence; other failures are only
/// logged.
pub(crate) async fn discard_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}

/// Run `program` to completion, capturing its output.
///
/// The child is killed if `cancel` fires first.
async fn run_command(
    program: &str,
    args: &[OsString],
    cancel: &CancellationToken,
) -> Result<()> {
    let rendered = std::iter::once(program.to_string())
        .chain(args.iter().map(|a| a.to_string_lossy().into_owned()))
        .collect::<Vec<_>>()
        .join(" ");

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Command {
            command: rendered.clone(),
            status: "not started".to_string(),
            stderr: e.to_string(),
        })?;

    let output = tokio::select! {
        _ = cancel.cancelled() => {
            info!("Cancelled `{}`", rendered);
            return Err(Error::Cancelled);
        }
        output = child.wait_with_output() => output?,
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    if !output.status.success() {
        error!(
            "Command failed: `{}` ({}), stdout: {:?}, stderr: {:?}",
            rendered, output.status, stdout, stderr
        );
        return Err(Error::Command {
            command: rendered,
            status: output.status.to_string(),
            stderr: stderr.trim().to_string(),
        });
    }

    info!(
        "Command succeeded: `{}`, stdout: {:?}, stderr: {:?}",
        rendered, stdout, stderr
    );
    Ok(())
}
