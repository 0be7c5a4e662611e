//! buildstash library -- remote build-artifact cache.
//!
//! This crate provides the components of an HTTP build cache: credential
//! authentication, the upload/retrieve lifecycle that keeps the metadata
//! index a superset of the blob store, pluggable index and blob backends,
//! and the sweeper that expires entries by last access.

use std::sync::Arc;

pub mod audit;
pub mod auth;
pub mod background;
pub mod codec;
pub mod config;
pub mod credentials;
pub mod errors;
pub mod handlers;
pub mod metadata;
pub mod metrics;
pub mod server;
pub mod storage;
pub mod sweeper;

use crate::background::BackgroundTasks;
use crate::config::Config;
use crate::metadata::store::MetadataIndex;
use crate::storage::backend::StorageBackend;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Last-used index over every cached object.
    pub metadata: Arc<dyn MetadataIndex>,
    /// Blob store holding cached objects and credentials.
    pub storage: Arc<dyn StorageBackend>,
    /// Credential check and its cache.
    pub auth: auth::Authenticator,
    /// Detached work scheduled by requests.
    pub background: BackgroundTasks,
}

impl AppState {
    pub fn new(
        config: Config,
        metadata: Arc<dyn MetadataIndex>,
        storage: Arc<dyn StorageBackend>,
    ) -> Self {
        let auth = auth::Authenticator::new(&config.auth, storage.clone());
        Self {
            config,
            metadata,
            storage,
            auth,
            background: BackgroundTasks::new(),
        }
    }
}
