use anyhow::Result;
use pg_backup_core::archive::ARCHIVE_SUFFIX;
use pg_backup_core::Repository;
use tracing::info;

use crate::Location;

pub async fn run(location: &Location) -> Result<()> {
    let (config, bucket, prefix) = super::resolve(location)?;
    let config = config.with_location(&bucket, &prefix);

    info!("Listing backups in {} (prefix: {:?})", bucket, prefix);
    let repository = Repository::from_config(&config).await?;

    let mut backups: Vec<_> = repository
        .list()
        .await?
        .into_iter()
        .filter(|key| key.ends_with(ARCHIVE_SUFFIX))
        .collect();
    backups.sort();

    if backups.is_empty() {
        println!("No backups found in {}/{}", bucket, prefix);
    } else {
        for key in backups {
            println!("{}", key);
        }
    }

    Ok(())
}
