//! File transfers against an `object_store` bucket without buffering whole
//! objects in memory.

use futures::StreamExt;
use object_store::buffered::BufWriter;
use object_store::path::Path;
use object_store::ObjectStore;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::{Error, Result};

fn io_failure(op: &str, key: &str, e: std::io::Error) -> Error {
    StorageError::Backend(format!("{} {} failed: {}", op, key, e)).into()
}

/// Copy `file` into `key`.
///
/// Small files go up in a single request; anything past the writer's
/// buffer becomes a multipart upload, which is aborted on failure.
pub(crate) async fn upload(store: Arc<dyn ObjectStore>, key: &str, mut file: File) -> Result<u64> {
    let mut writer = BufWriter::new(store, Path::from(key));

    let copied = match tokio::io::copy(&mut file, &mut writer).await {
        Ok(copied) => copied,
        Err(e) => {
            if let Err(abort) = writer.abort().await {
                warn!("Failed to abort upload of {}: {}", key, abort);
            }
            return Err(io_failure("Upload", key, e));
        }
    };
    writer
        .shutdown()
        .await
        .map_err(|e| io_failure("Upload", key, e))?;

    debug!("Uploaded {} bytes to {}", copied, key);
    Ok(copied)
}

/// Copy the object under `key` into `file`, one response chunk at a time.
pub(crate) async fn download(
    store: &dyn ObjectStore,
    key: &str,
    mut file: File,
    map_err: impl Fn(object_store::Error) -> Error,
) -> Result<u64> {
    let mut chunks = store
        .get(&Path::from(key))
        .await
        .map_err(&map_err)?
        .into_stream();

    let mut written = 0u64;
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(&map_err)?;
        file.write_all(&chunk)
            .await
            .map_err(|e| io_failure("Download", key, e))?;
        written += chunk.len() as u64;
    }
    file.flush()
        .await
        .map_err(|e| io_failure("Download", key, e))?;

    debug!("Downloaded {} bytes from {}", written, key);
    Ok(written)
}
