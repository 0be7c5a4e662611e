//! CLI entry point for buildstash-admin: one-off maintenance against the
//! stores named in a server configuration file.

use std::path::PathBuf;
use std::sync::Arc;

use buildstash::config::{load_config, Config};
use buildstash::metadata::sqlite::SqliteMetadataIndex;
use buildstash::metadata::store::MetadataIndex;
use buildstash::storage::backend::StorageBackend;
use buildstash::storage::local::LocalBackend;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "buildstash-admin", about = "buildstash maintenance tool")]
struct Cli {
    /// Server configuration file.
    #[arg(long, global = true, default_value = "buildstash.example.yaml")]
    config: PathBuf,

    /// Print reports as JSON.
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Delete every entry not used within the staleness threshold
    Sweep,
    /// Create or replace a credential
    PutCredential { id: String, secret: String },
    /// Report blobs that have no index entry
    Audit,
}

type Stores = (Arc<dyn MetadataIndex>, Arc<dyn StorageBackend>);

/// Only persistent stores make sense for offline maintenance.
fn open_stores(config: &Config) -> anyhow::Result<Stores> {
    if config.metadata.engine != "sqlite" {
        anyhow::bail!("metadata.engine '{}' is not persistent", config.metadata.engine);
    }
    if config.storage.backend != "local" {
        anyhow::bail!("storage.backend '{}' is not persistent", config.storage.backend);
    }
    let metadata = SqliteMetadataIndex::new(&config.metadata.sqlite.path)?;
    let storage = LocalBackend::new(&config.storage.local.root_dir)?;
    Ok((Arc::new(metadata), Arc::new(storage)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let (metadata, storage) = open_stores(&config)?;

    match cli.command {
        Commands::Sweep => {
            let now = buildstash::handlers::cache::unix_now();
            let report = buildstash::sweeper::sweep(
                metadata.as_ref(),
                storage.as_ref(),
                &config.sweeper,
                now,
            )
            .await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "Removed {} stale entries in {} batches",
                    report.deleted, report.batches
                );
            }
        }
        Commands::PutCredential { id, secret } => {
            buildstash::auth::CredentialStore::new(storage)
                .put(&id, &secret)
                .await?;
            println!("Stored credential {id}");
        }
        Commands::Audit => {
            let report = buildstash::audit::audit(metadata.as_ref(), storage.as_ref()).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for key in &report.orphans {
                    println!("{key}");
                }
                eprintln!(
                    "Scanned {} blobs, {} without an index entry",
                    report.scanned,
                    report.orphans.len()
                );
            }
            if !report.is_consistent() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
