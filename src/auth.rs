//! Credential-header authentication.
//!
//! Every cache request carries two headers: a credential id and its
//! secret.  The secret on record lives in the blob store under
//! `credentials/<id>` (raw UTF-8, one object per id) and is looked up
//! through the [`CredentialCache`].  Presented and stored secrets are
//! compared in constant time.

use std::sync::Arc;

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::config::AuthConfig;
use crate::credentials::CredentialCache;
use crate::storage::backend::{bytes_stream, StorageBackend};

/// Blob-store prefix holding one object per credential id.
pub const CREDENTIALS_PREFIX: &str = "credentials/";

/// Compare two secrets in constant time.  Both sides are hashed first so
/// the comparison length does not depend on the secret's length.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = Sha256::digest(a.as_bytes());
    let b = Sha256::digest(b.as_bytes());
    a.ct_eq(&b).into()
}

/// Ids become part of a storage key, so they must be a single segment.
fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && id != "." && id != ".." && !id.contains('/') && !id.contains('\\')
}

// ── Credential store adapter ────────────────────────────────────────

/// Reads and writes credential objects in the blob store.
#[derive(Clone)]
pub struct CredentialStore {
    storage: Arc<dyn StorageBackend>,
}

impl CredentialStore {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    fn key(id: &str) -> String {
        format!("{CREDENTIALS_PREFIX}{id}")
    }

    /// Fetch the secret for `id`, or `None` if no credential exists.
    pub async fn fetch(&self, id: &str) -> anyhow::Result<Option<String>> {
        let Some(object) = self.storage.get(&Self::key(id)).await? else {
            return Ok(None);
        };
        let data = object.into_bytes().await?;
        let secret = String::from_utf8(data.to_vec())
            .map_err(|_| anyhow::anyhow!("credential object for {id} is not valid UTF-8"))?;
        Ok(Some(secret))
    }

    /// Create or replace the secret for `id`.
    pub async fn put(&self, id: &str, secret: &str) -> anyhow::Result<()> {
        if !is_valid_id(id) {
            anyhow::bail!("invalid credential id: {id:?}");
        }
        self.storage
            .put(&Self::key(id), bytes_stream(secret.to_string()))
            .await?;
        Ok(())
    }
}

// ── Authenticator ───────────────────────────────────────────────────

/// Validates request credentials against the credential store.
pub struct Authenticator {
    cache: CredentialCache,
    store: CredentialStore,
    id_header: String,
    secret_header: String,
}

impl Authenticator {
    pub fn new(config: &AuthConfig, storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            cache: CredentialCache::new(config.positive_ttl(), config.negative_ttl()),
            store: CredentialStore::new(storage),
            id_header: config.id_header.to_ascii_lowercase(),
            secret_header: config.secret_header.to_ascii_lowercase(),
        }
    }

    /// Whether the request's credential headers match a stored credential.
    ///
    /// Missing or non-UTF-8 headers, unknown ids and wrong secrets all
    /// yield `Ok(false)`.  Only a failing credential store is an error.
    pub async fn is_authenticated(&self, headers: &HeaderMap) -> anyhow::Result<bool> {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
        let (Some(id), Some(presented)) = (header(&self.id_header), header(&self.secret_header))
        else {
            debug!("Request without credential headers");
            return Ok(false);
        };

        if !is_valid_id(id) {
            debug!("Malformed credential id");
            return Ok(false);
        }

        let stored = self
            .cache
            .retrieve(id, || self.store.fetch(id))
            .await?;

        match stored {
            Some(secret) if constant_time_eq(presented, &secret) => Ok(true),
            Some(_) => {
                debug!("Secret mismatch for credential {}", id);
                Ok(false)
            }
            None => {
                debug!("Unknown credential {}", id);
                Ok(false)
            }
        }
    }

    /// Store a credential and drop any cached result for its id, so the
    /// new secret is accepted by this process immediately.
    pub async fn provision(&self, id: &str, secret: &str) -> anyhow::Result<()> {
        self.store.put(id, secret).await?;
        self.cache.invalidate(id);
        Ok(())
    }

    /// The underlying cache (flush, inspection).
    pub fn cache(&self) -> &CredentialCache {
        &self.cache
    }
}

// ── Tests ───────────────────────────────────────────────────────────
