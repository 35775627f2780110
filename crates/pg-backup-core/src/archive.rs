//! Gzip-compressed tar archives of dump files.
//!
//! Member names are always relative to the archive root. Directories are
//! walked but not written as entries of their own; only regular files carry
//! payload. Extraction refuses members that would land outside the output
//! directory.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder, EntryType};
use tracing::debug;

use crate::{Error, Result};

/// Suffix appended to a dump file name to name its archive.
pub const ARCHIVE_SUFFIX: &str = ".tar.gz";

/// Kind of an archive member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// One member of an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Path relative to the archive root
    pub path: PathBuf,
    /// Payload size in bytes
    pub size: u64,
    pub kind: EntryKind,
}

/// Archive file name for a dump file name: `20240101120000.sql` becomes
/// `20240101120000.sql.tar.gz`.
pub fn archive_name(file_name: &str) -> String {
    format!("{}{}", file_name, ARCHIVE_SUFFIX)
}

/// Inverse of [`archive_name`]; `None` when the name lacks the suffix.
pub fn strip_archive_suffix(archive_name: &str) -> Option<&str> {
    archive_name
        .strip_suffix(ARCHIVE_SUFFIX)
        .filter(|name| !name.is_empty())
}

/// Pack `inputs` into a gzip-compressed tar archive at `archive_path`.
///
/// Each input is stored under its own base name; directories contribute
/// their regular files depth-first with paths relative to the input's
/// parent. A partially written archive is left in place on failure.
pub fn create_archive(archive_path: &Path, inputs: &[PathBuf]) -> Result<()> {
    let file = File::create(archive_path).map_err(|e| {
        Error::Archive(format!(
            "Failed to create archive {}: {}",
            archive_path.display(),
            e
        ))
    })?;

    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = Builder::new(encoder);

    for input in inputs {
        let name = input.file_name().ok_or_else(|| {
            Error::Archive(format!("Input has no file name: {}", input.display()))
        })?;
        append_path(&mut builder, input, Path::new(name))?;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| Error::Archive(format!("Failed to finish tar stream: {}", e)))?;
    let mut writer = encoder
        .finish()
        .map_err(|e| Error::Archive(format!("Failed to finish gzip stream: {}", e)))?;
    writer.flush()?;

    debug!(
        "Created archive {} from {} input(s)",
        archive_path.display(),
        inputs.len()
    );
    Ok(())
}

fn append_path<W: Write>(builder: &mut Builder<W>, full: &Path, relative: &Path) -> Result<()> {
    let metadata = fs::metadata(full)
        .map_err(|e| Error::Archive(format!("Failed to stat {}: {}", full.display(), e)))?;

    if metadata.is_dir() {
        let entries = fs::read_dir(full).map_err(|e| {
            Error::Archive(format!("Failed to read directory {}: {}", full.display(), e))
        })?;
        for entry in entries {
            let entry = entry?;
            append_path(builder, &entry.path(), &relative.join(entry.file_name()))?;
        }
        return Ok(());
    }

    // Header name, size, mode and mtime all come from the filesystem.
    builder
        .append_path_with_name(full, relative)
        .map_err(|e| Error::Archive(format!("Failed to append {}: {}", full.display(), e)))
}

/// Unpack the regular files of `archive_path` below `output_dir`.
///
/// `output_dir` is created if missing. Non-file members are skipped. Any
/// decode error aborts extraction and may leave a partially populated
/// output directory behind.
pub fn extract_archive(archive_path: &Path, output_dir: &Path) -> Result<()> {
    fs::create_dir_all(output_dir)?;

    let file = File::open(archive_path).map_err(|e| {
        Error::Archive(format!(
            "Failed to open archive {}: {}",
            archive_path.display(),
            e
        ))
    })?;
    let mut archive = Archive::new(GzDecoder::new(BufReader::new(file)));

    let entries = archive
        .entries()
        .map_err(|e| Error::Archive(format!("Failed to read archive: {}", e)))?;

    let mut extracted = 0usize;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| Error::Archive(format!("Failed to read archive entry: {}", e)))?;

        if entry.header().entry_type() != EntryType::Regular {
            continue;
        }

        let member = entry
            .path()
            .map_err(|e| Error::Archive(format!("Invalid member name: {}", e)))?
            .into_owned();
        let target = output_dir.join(confined(&member)?);

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut out = BufWriter::new(File::create(&target)?);
        io::copy(&mut entry, &mut out).map_err(|e| {
            Error::Archive(format!("Failed to extract {}: {}", member.display(), e))
        })?;
        out.flush()?;
        extracted += 1;
    }

    debug!(
        "Extracted {} file(s) from {} into {}",
        extracted,
        archive_path.display(),
        output_dir.display()
    );
    Ok(())
}

/// List the members of an archive in stored order.
pub fn list_archive(archive_path: &Path) -> Result<Vec<ArchiveEntry>> {
    let file = File::open(archive_path)?;
    let mut archive = Archive::new(GzDecoder::new(BufReader::new(file)));

    let mut listed = Vec::new();
    for entry in archive
        .entries()
        .map_err(|e| Error::Archive(format!("Failed to read archive: {}", e)))?
    {
        let entry =
            entry.map_err(|e| Error::Archive(format!("Failed to read archive entry: {}", e)))?;
        let kind = match entry.header().entry_type() {
            EntryType::Regular => EntryKind::File,
            EntryType::Directory => EntryKind::Directory,
            _ => continue,
        };
        listed.push(ArchiveEntry {
            path: entry
                .path()
                .map_err(|e| Error::Archive(format!("Invalid member name: {}", e)))?
                .into_owned(),
            size: entry.size(),
            kind,
        });
    }
    Ok(listed)
}

/// Reject absolute member names and parent-directory escapes.
fn confined(member: &Path) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in member.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => {
                return Err(Error::Archive(format!(
                    "Refusing to extract member outside output directory: {}",
                    member.display()
                )))
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(Error::Archive("Empty member name".to_string()));
    }
    Ok(clean)
}

/// [`create_archive`] on the blocking thread pool.
pub async fn create_archive_async(archive_path: PathBuf, inputs: Vec<PathBuf>) -> Result<()> {
    tokio::task::spawn_blocking(move || create_archive(&archive_path, &inputs))
        .await
        .map_err(|e| Error::Archive(format!("Archive task failed: {}", e)))?
}

/// [`list_archive`] on the blocking thread pool.
pub async fn list_archive_async(archive_path: PathBuf) -> Result<Vec<ArchiveEntry>> {
    tokio::task::spawn_blocking(move || list_archive(&archive_path))
        .await
        .map_err(|e| Error::Archive(format!("Archive task failed: {}", e)))?
}

/// [`extract_archive`] on the blocking thread pool.
pub async fn extract_archive_async(archive_path: PathBuf, output_dir: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || extract_archive(&archive_path, &output_dir))
        .await
        .map_err(|e| Error::Archive(format!("Archive task failed: {}", e)))?
}
