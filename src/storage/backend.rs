//! Abstract blob store trait.
//!
//! Every blob store must implement [`StorageBackend`].  Writes consume and
//! reads produce byte streams, so objects never have to be buffered whole.
//! Reads distinguish "absent" (`Ok(None)`) from a failed fetch (`Err`).

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use std::future::Future;
use std::pin::Pin;

/// A stream of object chunks, fed into [`StorageBackend::put`] and
/// returned by [`StorageBackend::get`].
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Wrap an in-memory buffer as a single-chunk [`ByteStream`].
pub fn bytes_stream(data: impl Into<Bytes>) -> ByteStream {
    let data = data.into();
    Box::pin(futures::stream::once(async move { Ok(data) }))
}

/// An object opened for reading.
pub struct StoredObject {
    /// Object bytes, read lazily from the store.
    pub body: ByteStream,
    /// Length of the object in bytes.
    pub size: u64,
}

impl StoredObject {
    /// Read the whole body into memory.  For small objects only
    /// (credentials, tests).
    pub async fn into_bytes(mut self) -> std::io::Result<Bytes> {
        let mut buf = BytesMut::with_capacity(usize::try_from(self.size).unwrap_or(0));
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl std::fmt::Debug for StoredObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredObject")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Async blob store contract.
pub trait StorageBackend: Send + Sync + 'static {
    /// Write the stream to `storage_key`, returning the hex SHA-256 of the
    /// stored bytes.  An existing object is replaced.  A stream error
    /// aborts the write and leaves any previous object in place.
    fn put(
        &self,
        storage_key: &str,
        body: ByteStream,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>>;

    /// Open the object at `storage_key` for streaming, or `None` if it is
    /// absent.
    fn get(
        &self,
        storage_key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<StoredObject>>> + Send + '_>>;

    /// Delete every object in `storage_keys`.  Missing keys are ignored.
    fn delete_many(
        &self,
        storage_keys: &[String],
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// List every stored key starting with `prefix`, in ascending order.
    fn list(
        &self,
        prefix: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<String>>> + Send + '_>>;
}
