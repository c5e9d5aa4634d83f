use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use csnap_storage::PgDocumentStore;
use csnap_sync::{RunOptions, SyncConfig};

#[derive(Debug, Parser)]
#[command(name = "csnap-cli")]
#[command(about = "Catalog snapshot reconciler")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, validate and reconcile one catalog snapshot.
    Sync {
        /// Snapshot marker in epoch milliseconds (defaults to now).
        #[arg(long)]
        snapshot_at: Option<i64>,
        /// Gzip raw payload archives.
        #[arg(long)]
        compress_archives: bool,
    },
    /// Apply document store migrations.
    Migrate,
    /// Serve the read-only query endpoints.
    Serve {
        #[arg(long)]
        bind: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Sync {
        snapshot_at: None,
        compress_archives: false,
    });

    match command {
        Commands::Sync {
            snapshot_at,
            compress_archives,
        } => {
            let report = csnap_sync::run_sync_once_from_env(RunOptions {
                snapshot_at,
                compress_archives,
            })
            .await?;
            println!(
                "sync complete: run_id={} snapshot_at={} errors={} warnings={} phase_two_skipped={}",
                report.run_id,
                report.snapshot_at,
                report.errors,
                report.warnings,
                report.phase_two_skipped
            );
            for (entity, e) in &report.entities {
                println!(
                    "  {entity}: fetched={} inserted={} replaced={} stable={} issues={}",
                    e.fetched,
                    e.inserted,
                    e.replaced,
                    e.stable,
                    e.issues.len()
                );
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let Some(url) = config.database_url else {
                bail!("DATABASE_URL must be set to run migrations");
            };
            PgDocumentStore::connect(&url).await?.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve { bind } => {
            csnap_web::serve_from_env(bind).await?;
        }
    }

    Ok(())
}
