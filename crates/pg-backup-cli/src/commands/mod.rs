pub mod backup;
pub mod list;
pub mod restore;

use anyhow::{Context, Result};
use pg_backup_core::Config;
use std::path::Path;
use tracing::info;

use crate::Location;

/// Configuration plus the bucket and prefix to operate on.
///
/// Flags and their environment variables win over the configuration file.
pub fn resolve(location: &Location) -> Result<(Config, String, String)> {
    let config = match &location.config {
        Some(path) => {
            info!("Loading configuration from: {}", path);
            Config::from_file(Path::new(path))
                .with_context(|| format!("loading configuration from {}", path))?
        }
        None => Config::from_env(),
    };

    let bucket = location
        .bucket
        .clone()
        .unwrap_or_else(|| config.storage.bucket().to_string());
    let prefix = location
        .prefix
        .clone()
        .unwrap_or_else(|| config.storage.prefix().to_string());

    Ok((config, bucket, prefix))
}
