use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::Location;

pub async fn run(location: &Location, backup_name: &str, cancel: &CancellationToken) -> Result<()> {
    let (config, bucket, prefix) = super::resolve(location)?;

    info!("Starting restore of {} from bucket {}", backup_name, bucket);

    pg_backup_core::restore(&config, &bucket, &prefix, backup_name, cancel)
        .await
        .with_context(|| format!("restore of {} failed", backup_name))?;

    info!("Restore completed successfully");
    Ok(())
}
