//! Restore of a logical backup into the local cluster.
//!
//! Download, extract, replay, clean up. No backup mode negotiation is
//! involved: restores run against a cluster that is not serving yet.

use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::archive::{
    extract_archive_async, list_archive_async, strip_archive_suffix, ArchiveEntry, EntryKind,
    ARCHIVE_SUFFIX,
};
use crate::config::Config;
use crate::repository::{BackupStore, Repository};
use crate::retry::cancellable;
use crate::snapshot::{Snapshotter, SqlSnapshotter};
use crate::{Error, Result};

/// Step of a restore run, used to label failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreStep {
    Download,
    Extract,
    Replay,
    Cleanup,
}

impl std::fmt::Display for RestoreStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Download => "download",
            Self::Extract => "extract",
            Self::Replay => "replay",
            Self::Cleanup => "cleanup",
        };
        f.write_str(s)
    }
}

/// Linear download / extract / replay / cleanup pipeline
pub struct RestoreOrchestrator {
    store: Arc<dyn BackupStore>,
    snapshotter: Arc<dyn Snapshotter>,
}

impl RestoreOrchestrator {
    pub fn new(store: Arc<dyn BackupStore>, snapshotter: Arc<dyn Snapshotter>) -> Self {
        Self { store, snapshotter }
    }

    /// Restore the archive stored under `backup_name`.
    ///
    /// A failed step aborts the run and leaves whatever the earlier steps
    /// wrote in the working directory.
    pub async fn restore(&self, backup_name: &str, cancel: &CancellationToken) -> Result<()> {
        info!("Restoring snapshot {}", backup_name);

        info!("Downloading snapshot");
        let archive = cancellable(cancel, self.store.get_file(backup_name))
            .await
            .map_err(|e| e.in_phase(RestoreStep::Download))?;

        let extracted_name = extracted_name(&archive).map_err(|e| e.in_phase(RestoreStep::Extract))?;
        let working_dir = self.store.working_dir().to_path_buf();

        let entries = cancellable(cancel, list_archive_async(archive.clone()))
            .await
            .map_err(|e| e.in_phase(RestoreStep::Extract))?;
        if !contains_member(&entries, &extracted_name) {
            return Err(Error::Archive(format!(
                "{} does not contain {}",
                archive.display(),
                extracted_name
            ))
            .in_phase(RestoreStep::Extract));
        }

        info!("Extracting snapshot {}", archive.display());
        cancellable(
            cancel,
            extract_archive_async(archive.clone(), working_dir.clone()),
        )
        .await
        .map_err(|e| e.in_phase(RestoreStep::Extract))?;

        let extracted = working_dir.join(extracted_name);
        info!("Executing restore from {}", extracted.display());
        self.snapshotter
            .replay(&extracted, cancel)
            .await
            .map_err(|e| e.in_phase(RestoreStep::Replay))?;

        remove_path(&archive)
            .await
            .map_err(|e| e.in_phase(RestoreStep::Cleanup))?;
        remove_path(&extracted)
            .await
            .map_err(|e| e.in_phase(RestoreStep::Cleanup))?;

        info!("Restore of {} finished", backup_name);
        Ok(())
    }
}

/// Name the archive extracts to: its base name without the archive suffix.
fn extracted_name(archive: &Path) -> Result<String> {
    archive
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(strip_archive_suffix)
        .map(str::to_string)
        .ok_or_else(|| {
            Error::Archive(format!(
                "{} does not end in {}",
                archive.display(),
                ARCHIVE_SUFFIX
            ))
        })
}

/// Whether the archive holds `name` as a file or as the top of a directory.
fn contains_member(entries: &[ArchiveEntry], name: &str) -> bool {
    entries
        .iter()
        .any(|entry| entry.kind == EntryKind::File && entry.path.starts_with(name))
}

async fn remove_path(path: &Path) -> Result<()> {
    let meta = tokio::fs::symlink_metadata(path).await?;
    if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await?;
    } else {
        tokio::fs::remove_file(path).await?;
    }
    Ok(())
}

/// Restore the backup `backup_name` from `bucket` under `prefix`.
pub async fn restore(
    config: &Config,
    bucket: &str,
    prefix: &str,
    backup_name: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let config = config.clone().with_location(bucket, prefix);
    config.validate()?;

    if backup_name.trim().is_empty() {
        return Err(Error::Config("backup name cannot be empty".to_string()));
    }

    let repository = cancellable(cancel, Repository::from_config(&config)).await?;
    let orchestrator = RestoreOrchestrator::new(
        Arc::new(repository),
        Arc::new(SqlSnapshotter::new(config.snapshot.clone())),
    );
    orchestrator.restore(backup_name, cancel).await
}
