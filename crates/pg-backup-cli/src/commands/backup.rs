use anyhow::{Context, Result};
use pg_backup_core::perform_backup;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::Location;

pub async fn run(location: &Location, cancel: &CancellationToken) -> Result<()> {
    let (config, bucket, prefix) = super::resolve(location)?;

    info!("Starting backup into bucket {} (prefix: {:?})", bucket, prefix);

    let result = perform_backup(&config, &bucket, &prefix, cancel)
        .await
        .context("backup failed")?;

    info!(
        "Backup {} completed: {} (WAL {} - {})",
        result.backup_name, result.object_key, result.begin_wal, result.end_wal
    );
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
