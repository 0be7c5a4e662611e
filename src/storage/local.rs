//! Local filesystem blob store.
//!
//! Objects are stored as files under a configurable root directory.
//! The storage key is used directly as a relative path (e.g. "cas/abc").
//!
//! All writes follow crash-only design: stream to a temp file, fsync,
//! rename.  A crash mid-write leaves only a stray temp file, never a
//! truncated object.

use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::backend::{ByteStream, StorageBackend, StoredObject};

/// Directory under the root holding in-flight writes.
const TMP_DIR: &str = ".tmp";

/// Stores objects on the local filesystem.
pub struct LocalBackend {
    /// Root directory for all stored objects.
    root: PathBuf,
}

impl LocalBackend {
    /// Create a new `LocalBackend` rooted at `root`.
    ///
    /// The directory will be created if it does not exist.  Temp files
    /// left behind by a previous crash are removed.
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let tmp = root.join(TMP_DIR);
        if tmp.exists() {
            std::fs::remove_dir_all(&tmp)?;
        }
        std::fs::create_dir_all(&tmp)?;
        Ok(Self { root })
    }

    /// Resolve a storage key to a file path under the root.
    ///
    /// Rejects keys that would escape the root or land in the temp area.
    fn resolve(&self, storage_key: &str) -> anyhow::Result<PathBuf> {
        let relative = Path::new(storage_key);
        for component in relative.components() {
            match component {
                std::path::Component::Normal(_) => {}
                _ => anyhow::bail!("Invalid storage key: {storage_key}"),
            }
        }
        if relative.starts_with(TMP_DIR) {
            anyhow::bail!("Invalid storage key: {storage_key}");
        }
        Ok(self.root.join(relative))
    }

    /// Generate a temp file path under .tmp/ for atomic writes.
    fn temp_path(&self) -> PathBuf {
        let id = uuid::Uuid::new_v4();
        self.root.join(TMP_DIR).join(format!("tmp-{id}"))
    }

    async fn write_temp(tmp_path: &Path, mut body: ByteStream) -> anyhow::Result<String> {
        let mut file = tokio::fs::File::create(tmp_path).await?;
        let mut hasher = Sha256::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.sync_all().await?;
        Ok(hex::encode(hasher.finalize()))
    }

    /// Recursively collect keys of regular files under `dir`.
    fn walk(&self, dir: &Path, keys: &mut Vec<String>) -> anyhow::Result<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                if path == self.root.join(TMP_DIR) {
                    continue;
                }
                self.walk(&path, keys)?;
            } else if file_type.is_file() {
                let relative = path.strip_prefix(&self.root)?;
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                keys.push(key);
            }
        }
        Ok(())
    }
}

impl StorageBackend for LocalBackend {
    fn put(
        &self,
        storage_key: &str,
        body: ByteStream,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        let storage_key = storage_key.to_string();
        Box::pin(async move {
            let final_path = self.resolve(&storage_key)?;

            // Ensure parent directory exists (handles keys with '/' separators).
            if let Some(parent) = final_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            let tmp_path = self.temp_path();
            let hash = match Self::write_temp(&tmp_path, body).await {
                Ok(hash) => hash,
                Err(e) => {
                    let _ = tokio::fs::remove_file(&tmp_path).await;
                    return Err(e);
                }
            };

            tokio::fs::rename(&tmp_path, &final_path).await?;
            Ok(hash)
        })
    }

    fn get(
        &self,
        storage_key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<StoredObject>>> + Send + '_>> {
        let storage_key = storage_key.to_string();
        Box::pin(async move {
            let path = self.resolve(&storage_key)?;
            let file = match tokio::fs::File::open(&path).await {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            let size = file.metadata().await?.len();
            Ok(Some(StoredObject {
                body: Box::pin(ReaderStream::new(file)),
                size,
            }))
        })
    }

    fn delete_many(
        &self,
        storage_keys: &[String],
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let storage_keys = storage_keys.to_vec();
        Box::pin(async move {
            for key in &storage_keys {
                // put rejects such keys, so nothing can be stored under them.
                let Ok(path) = self.resolve(key) else {
                    debug!("Skipping unstorable key {:?}", key);
                    continue;
                };
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {}
                    // Idempotent: a dangling index entry has no file.
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
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
            let mut keys = Vec::new();
            self.walk(&self.root, &mut keys)?;
            keys.retain(|k| k.starts_with(&prefix));
            keys.sort();
            Ok(keys)
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────
