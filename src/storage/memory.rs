//! In-memory blob store.
//!
//! Objects are held in a `tokio::sync::RwLock<BTreeMap<...>>` so prefix
//! listing comes back ordered.  Nothing is persisted; useful for tests and
//! throwaway deployments.

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use super::backend::{bytes_stream, ByteStream, StorageBackend, StoredObject};

/// In-memory blob store.
#[derive(Default)]
pub struct MemoryBackend {
    /// storage_key -> data.
    objects: tokio::sync::RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    fn compute_content_hash(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }
}

impl StorageBackend for MemoryBackend {
    fn put(
        &self,
        storage_key: &str,
        mut body: ByteStream,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        let storage_key = storage_key.to_string();
        Box::pin(async move {
            // Collect first so a failed stream never replaces the old object.
            let mut buf = BytesMut::new();
            while let Some(chunk) = body.next().await {
                buf.extend_from_slice(&chunk?);
            }
            let data = buf.freeze();
            let hash = Self::compute_content_hash(&data);

            let mut objects = self.objects.write().await;
            objects.insert(storage_key, data);
            Ok(hash)
        })
    }

    fn get(
        &self,
        storage_key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<StoredObject>>> + Send + '_>> {
        let storage_key = storage_key.to_string();
        Box::pin(async move {
            let objects = self.objects.read().await;
            Ok(objects.get(&storage_key).map(|data| StoredObject {
                size: data.len() as u64,
                body: bytes_stream(data.clone()),
            }))
        })
    }

    fn delete_many(
        &self,
        storage_keys: &[String],
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let storage_keys = storage_keys.to_vec();
        Box::pin(async move {
            let mut objects = self.objects.write().await;
            for key in &storage_keys {
                objects.remove(key);
            }
            Ok(())
        })
    }

    fn list(
        &self,
        prefix: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<String>>> + Send + '_>> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            let objects = self.objects.read().await;
            Ok(objects
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&prefix))
                .map(|(k, _)| k.clone())
                .collect())
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
