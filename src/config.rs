//! Configuration loading and types for buildstash.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! system: networking, authentication, the metadata index, the blob
//! store, the stale-object sweeper, and logging.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Authentication settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Metadata index settings.
    #[serde(default)]
    pub metadata: MetadataConfig,

    /// Blob store settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Stale object sweeper settings.
    #[serde(default)]
    pub sweeper: SweeperConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings (metrics + health probe).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,

    /// Maximum object size in bytes (default 1 GiB).
    #[serde(default = "default_max_object_size")]
    pub max_object_size: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
            max_object_size: default_max_object_size(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and the `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,

    /// Enable the `/health` probe.
    #[serde(default = "default_true")]
    pub health_check: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics: true,
            health_check: true,
        }
    }
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Request header carrying the credential id.
    #[serde(default = "default_id_header")]
    pub id_header: String,

    /// Request header carrying the credential secret.
    #[serde(default = "default_secret_header")]
    pub secret_header: String,

    /// How long a found credential stays cached.
    #[serde(default = "default_positive_ttl")]
    pub positive_ttl_seconds: u64,

    /// How long a not-found result stays cached.
    #[serde(default = "default_negative_ttl")]
    pub negative_ttl_seconds: u64,

    /// Credentials written to the credential store on every startup.
    #[serde(default)]
    pub credentials: Vec<SeedCredential>,
}

impl AuthConfig {
    pub fn positive_ttl(&self) -> Duration {
        Duration::from_secs(self.positive_ttl_seconds)
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_ttl_seconds)
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            id_header: default_id_header(),
            secret_header: default_secret_header(),
            positive_ttl_seconds: default_positive_ttl(),
            negative_ttl_seconds: default_negative_ttl(),
            credentials: Vec::new(),
        }
    }
}

/// A credential id/secret pair from the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedCredential {
    pub id: String,
    pub secret: String,
}

/// Metadata index configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetadataConfig {
    /// Backend type: `sqlite` or `memory`.
    #[serde(default = "default_metadata_engine")]
    pub engine: String,

    /// SQLite-specific configuration.
    #[serde(default)]
    pub sqlite: SqliteConfig,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            engine: default_metadata_engine(),
            sqlite: SqliteConfig::default(),
        }
    }
}

/// SQLite-specific metadata configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_metadata_path")]
    pub path: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: default_metadata_path(),
        }
    }
}

/// Blob store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend type: `local` or `memory`.
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Local storage configuration.
    #[serde(default)]
    pub local: LocalStorageConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            local: LocalStorageConfig::default(),
        }
    }
}

/// Local filesystem storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalStorageConfig {
    /// Root directory for stored objects.
    #[serde(default = "default_storage_root")]
    pub root_dir: String,
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            root_dir: default_storage_root(),
        }
    }
}

/// Stale object sweeper configuration.
///
/// With the in-process scheduler disabled, run `buildstash-admin sweep`
/// from an external scheduler instead.
#[derive(Debug, Clone, Deserialize)]
pub struct SweeperConfig {
    /// Run the sweep on an in-process interval.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between sweeps.
    #[serde(default = "default_sweep_interval")]
    pub interval_seconds: u64,

    /// Entries unused for longer than this are swept.
    #[serde(default = "default_staleness_threshold")]
    pub staleness_threshold_seconds: u64,

    /// Maximum keys deleted per store call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: default_sweep_interval(),
            staleness_threshold_seconds: default_staleness_threshold(),
            batch_size: default_batch_size(),
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9092
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_max_object_size() -> u64 {
    1_073_741_824 // 1 GiB
}

fn default_id_header() -> String {
    "x-cache-credential-id".to_string()
}

fn default_secret_header() -> String {
    "x-cache-credential-secret".to_string()
}

fn default_positive_ttl() -> u64 {
    30 * 60
}

fn default_negative_ttl() -> u64 {
    5
}

fn default_metadata_engine() -> String {
    "sqlite".to_string()
}

fn default_metadata_path() -> String {
    "./data/index.db".to_string()
}

fn default_storage_backend() -> String {
    "local".to_string()
}

fn default_storage_root() -> String {
    "./data/blobs".to_string()
}

fn default_sweep_interval() -> u64 {
    6 * 60 * 60
}

fn default_staleness_threshold() -> u64 {
    14 * 24 * 60 * 60
}

fn default_batch_size() -> usize {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}
