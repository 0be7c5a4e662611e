//! buildstash -- remote build-artifact cache server.
//!
//! Startup is idempotent: seeded credentials are rewritten, stale temp
//! files from an earlier crash are cleared by the local backend, and the
//! index needs no recovery because it only ever over-approximates the
//! blob store.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use buildstash::config::{Config, LoggingConfig};
use buildstash::metadata::store::MetadataIndex;
use buildstash::storage::backend::StorageBackend;

/// Command-line arguments for the buildstash server.
#[derive(Parser, Debug)]
#[command(name = "buildstash", version, about = "Remote build-artifact cache")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "buildstash.example.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = buildstash::config::load_config(&cli.config)?;
    init_tracing(&config.logging);
    info!("Loaded configuration from {}", cli.config);

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    if config.observability.metrics {
        buildstash::metrics::init_metrics()?;
        buildstash::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let metadata = open_metadata(&config)?;
    let storage = open_storage(&config)?;

    let state = Arc::new(buildstash::AppState::new(config.clone(), metadata, storage));

    for seed in &config.auth.credentials {
        state.auth.provision(&seed.id, &seed.secret).await?;
    }
    if !config.auth.credentials.is_empty() {
        info!("Seeded {} credentials", config.auth.credentials.len());
    }

    let sweeper = if config.sweeper.enabled {
        info!(
            "Sweeper enabled: every {}s, threshold {}s, batch {}",
            config.sweeper.interval_seconds,
            config.sweeper.staleness_threshold_seconds,
            config.sweeper.batch_size
        );
        Some(buildstash::sweeper::spawn_sweeper(
            state.clone(),
            config.sweeper.interval(),
        ))
    } else {
        None
    };

    let app = buildstash::server::app(state.clone());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("buildstash listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }

    let timeout = Duration::from_secs(config.server.shutdown_timeout);
    if !state.background.settle_with_timeout(timeout).await {
        warn!("Background tasks still running after {:?}; exiting anyway", timeout);
    }

    info!("buildstash shut down");

    Ok(())
}

/// Text or JSON output; `RUST_LOG` overrides the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn open_metadata(config: &Config) -> anyhow::Result<Arc<dyn MetadataIndex>> {
    match config.metadata.engine.as_str() {
        "memory" => {
            info!("In-memory metadata index initialized");
            Ok(Arc::new(buildstash::metadata::memory::MemoryMetadataIndex::new()))
        }
        "sqlite" => {
            let path = &config.metadata.sqlite.path;
            if let Some(parent) = std::path::Path::new(path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            let index = buildstash::metadata::sqlite::SqliteMetadataIndex::new(path)?;
            info!("SQLite metadata index initialized at {}", path);
            Ok(Arc::new(index))
        }
        other => anyhow::bail!("unknown metadata.engine '{other}' (expected sqlite or memory)"),
    }
}

fn open_storage(config: &Config) -> anyhow::Result<Arc<dyn StorageBackend>> {
    match config.storage.backend.as_str() {
        "memory" => {
            info!("In-memory storage backend initialized");
            Ok(Arc::new(buildstash::storage::memory::MemoryBackend::new()))
        }
        "local" => {
            let root = &config.storage.local.root_dir;
            let backend = buildstash::storage::local::LocalBackend::new(root)?;
            info!("Local storage backend initialized at {}", root);
            Ok(Arc::new(backend))
        }
        other => anyhow::bail!("unknown storage.backend '{other}' (expected local or memory)"),
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        },
    }
}
