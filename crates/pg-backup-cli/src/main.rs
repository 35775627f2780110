use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

#[derive(Parser)]
#[command(name = "pg-backup")]
#[command(about = "PostgreSQL backup and restore on object storage", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Where backups live
#[derive(Args, Debug, Clone)]
pub struct Location {
    /// Path to a YAML configuration file (defaults to the AWS_* environment)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Bucket holding the backups
    #[arg(long, env = "AWS_BUCKET")]
    pub bucket: Option<String>,

    /// Key prefix of the backups inside the bucket
    #[arg(long, env = "BACKUP_PREFIX")]
    pub prefix: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up the local cluster and print the result as JSON
    Backup {
        #[command(flatten)]
        location: Location,
    },

    /// Restore a backup into the local cluster
    Restore {
        #[command(flatten)]
        location: Location,

        /// The backup name to restore
        #[arg(long)]
        backup_name: String,
    },

    /// List backup archives stored under the prefix
    List {
        #[command(flatten)]
        location: Location,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    // Priority: RUST_LOG env var > verbose flag > default (info)
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match cli.verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            on_signal.cancel();
        }
    });

    match cli.command {
        Commands::Backup { location } => {
            commands::backup::run(&location, &cancel).await?;
        }
        Commands::Restore {
            location,
            backup_name,
        } => {
            commands::restore::run(&location, &backup_name, &cancel).await?;
        }
        Commands::List { location } => {
            commands::list::run(&location).await?;
        }
    }

    Ok(())
}
