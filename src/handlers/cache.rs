//! Upload and retrieval of cache entries.
//!
//! These two operations keep the metadata index a superset of the blob
//! store.  Upload writes the index row before the blob, so a failure in
//! between leaves a dangling row (harmless, swept later) and never an
//! unindexed blob.  Retrieve refreshes the row's last-used time in the
//! background without making the client wait for it.
//!
//! Authentication happens in the router's middleware before either
//! function is reached.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use metrics::counter;
use tracing::{debug, warn};

use crate::errors::CacheError;
use crate::metrics::{CACHE_OPERATIONS_TOTAL, REFRESH_FAILURES_TOTAL};
use crate::storage::backend::ByteStream;
use crate::AppState;

/// Current time as seconds since the Unix epoch.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// `PUT /{ac|cas}/{key}` -- store a blob under `key`.
pub async fn upload(state: Arc<AppState>, key: &str, body: Body) -> Result<Response, CacheError> {
    let now = unix_now();

    // Index first: a crash after this line leaves a dangling row, never an
    // unindexed blob.
    if let Err(e) = state.metadata.upsert(key, now).await {
        counter!(CACHE_OPERATIONS_TOTAL, "operation" => "upload", "outcome" => "error")
            .increment(1);
        return Err(CacheError::Internal(e));
    }

    let exceeded = Arc::new(AtomicBool::new(false));
    let stream = limit_body(
        body.into_data_stream(),
        state.config.server.max_object_size,
        exceeded.clone(),
    );

    match state.storage.put(key, stream).await {
        Ok(content_hash) => {
            counter!(CACHE_OPERATIONS_TOTAL, "operation" => "upload", "outcome" => "created")
                .increment(1);
            debug!("Stored {} (sha256 {})", key, content_hash);
            let mut response = StatusCode::CREATED.into_response();
            if let Ok(etag) = HeaderValue::from_str(&format!("\"{content_hash}\"")) {
                response.headers_mut().insert("etag", etag);
            }
            Ok(response)
        }
        Err(_) if exceeded.load(Ordering::Relaxed) => {
            counter!(CACHE_OPERATIONS_TOTAL, "operation" => "upload", "outcome" => "too_large")
                .increment(1);
            Err(CacheError::PayloadTooLarge)
        }
        Err(e) => {
            counter!(CACHE_OPERATIONS_TOTAL, "operation" => "upload", "outcome" => "error")
                .increment(1);
            Err(CacheError::UploadFailed(e))
        }
    }
}

/// `GET /{ac|cas}/{key}` -- stream back the blob stored under `key`.
pub async fn retrieve(state: Arc<AppState>, key: &str) -> Result<Response, CacheError> {
    schedule_refresh(&state, key);

    let stored = match state.storage.get(key).await {
        Ok(stored) => stored,
        Err(e) => {
            counter!(CACHE_OPERATIONS_TOTAL, "operation" => "retrieve", "outcome" => "error")
                .increment(1);
            return Err(CacheError::Internal(e));
        }
    };

    let Some(object) = stored else {
        counter!(CACHE_OPERATIONS_TOTAL, "operation" => "retrieve", "outcome" => "miss")
            .increment(1);
        return Err(CacheError::NotFound);
    };

    counter!(CACHE_OPERATIONS_TOTAL, "operation" => "retrieve", "outcome" => "hit").increment(1);
    Ok((
        StatusCode::OK,
        [
            ("content-type", "application/octet-stream".to_string()),
            ("content-length", object.size.to_string()),
        ],
        Body::from_stream(object.body),
    )
        .into_response())
}

/// Bump `key`'s last-used time after the response has gone out.  Failures
/// are logged and counted, never retried.
fn schedule_refresh(state: &Arc<AppState>, key: &str) {
    let metadata = state.metadata.clone();
    let key = key.to_string();
    let now = unix_now();
    state.background.spawn(async move {
        match metadata.touch(&key, now).await {
            Ok(true) => {}
            Ok(false) => debug!("No index row to refresh for {}", key),
            Err(e) => {
                counter!(REFRESH_FAILURES_TOTAL).increment(1);
                warn!("Failed to refresh last-used for {}: {:#}", key, e);
            }
        }
    });
}

/// Adapt a request body into a [`ByteStream`] that fails once more than
/// `max` bytes have been read, setting `exceeded` when it does.
fn limit_body<S, E>(stream: S, max: u64, exceeded: Arc<AtomicBool>) -> ByteStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let mut seen = 0u64;
    Box::pin(stream.map(move |chunk| {
        let chunk = chunk.map_err(std::io::Error::other)?;
        seen += chunk.len() as u64;
        if seen > max {
            exceeded.store(true, Ordering::Relaxed);
            return Err(std::io::Error::other(format!(
                "object exceeds maximum size of {max} bytes"
            )));
        }
        Ok(chunk)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::metadata::memory::MemoryMetadataIndex;
    use crate::metadata::store::{CacheEntry, MetadataIndex};
    use crate::storage::backend::{StorageBackend, StoredObject};
    use crate::storage::memory::MemoryBackend;
    use std::future::Future;
    use std::pin::Pin;

    /// Blob store whose every call fails.
    struct BrokenStorage;

    impl StorageBackend for BrokenStorage {
        fn put(
            &self,
            _storage_key: &str,
            _body: ByteStream,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
            Box::pin(async { anyhow::bail!("bucket unavailable") })
        }

        fn get(
            &self,
            _storage_key: &str,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<StoredObject>>> + Send + '_>>
        {
            Box::pin(async { anyhow::bail!("bucket unavailable") })
        }

        fn delete_many(
            &self,
            _storage_keys: &[String],
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
            Box::pin(async { anyhow::bail!("bucket unavailable") })
        }

        fn list(
            &self,
            _prefix: &str,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<String>>> + Send + '_>> {
            Box::pin(async { anyhow::bail!("bucket unavailable") })
        }
    }

    /// Index whose every call fails.
    struct BrokenIndex;

    impl MetadataIndex for BrokenIndex {
        fn upsert(
            &self,
            _key: &str,
            _last_used: i64,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
            Box::pin(async { anyhow::bail!("index unavailable") })
        }

        fn touch(
            &self,
            _key: &str,
            _last_used: i64,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
            Box::pin(async { anyhow::bail!("index unavailable") })
        }

        fn get(
            &self,
            _key: &str,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<CacheEntry>>> + Send + '_>> {
            Box::pin(async { anyhow::bail!("index unavailable") })
        }

        fn list_stale(
            &self,
            _after: &str,
            _stale_before: i64,
            _limit: usize,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<String>>> + Send + '_>> {
            Box::pin(async { anyhow::bail!("index unavailable") })
        }

        fn delete_many(
            &self,
            _keys: &[String],
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>> {
            Box::pin(async { anyhow::bail!("index unavailable") })
        }

        fn count(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>> {
            Box::pin(async { anyhow::bail!("index unavailable") })
        }
    }

    fn state_with(
        config: Config,
        storage: Arc<dyn StorageBackend>,
    ) -> (Arc<MemoryMetadataIndex>, Arc<AppState>) {
        let metadata = Arc::new(MemoryMetadataIndex::new());
        let state = Arc::new(AppState::new(config, metadata.clone(), storage));
        (metadata, state)
    }

    async fn body_bytes(response: Response) -> Bytes {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_upload_then_retrieve() {
        let (_metadata, state) = state_with(Config::default(), Arc::new(MemoryBackend::new()));

        let response = upload(state.clone(), "cas/abc", Body::from("hello"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(response.headers().contains_key("etag"));

        let response = retrieve(state.clone(), "cas/abc").await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, Bytes::from("hello"));
    }

    #[tokio::test]
    async fn test_upload_writes_single_fresh_row() {
        let (metadata, state) = state_with(Config::default(), Arc::new(MemoryBackend::new()));
        metadata.upsert("ac/k", 1).await.unwrap();

        let t0 = unix_now();
        upload(state, "ac/k", Body::from("v2")).await.unwrap();

        assert_eq!(metadata.count().await.unwrap(), 1);
        assert!(metadata.get("ac/k").await.unwrap().unwrap().last_used >= t0);
    }

    #[tokio::test]
    async fn test_failed_blob_write_leaves_dangling_row() {
        let (metadata, state) = state_with(Config::default(), Arc::new(BrokenStorage));

        let err = upload(state, "cas/x", Body::from("data")).await.unwrap_err();
        assert!(matches!(err, CacheError::UploadFailed(_)));
        assert!(metadata.get("cas/x").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_index_upsert_never_writes_blob() {
        let storage = Arc::new(MemoryBackend::new());
        let state = Arc::new(AppState::new(
            Config::default(),
            Arc::new(BrokenIndex),
            storage.clone(),
        ));

        let err = upload(state, "cas/x", Body::from("data")).await.unwrap_err();
        assert!(matches!(err, CacheError::Internal(_)));
        assert!(storage.is_empty().await);
    }

    #[tokio::test]
    async fn test_failed_refresh_does_not_fail_retrieve() {
        let storage = Arc::new(MemoryBackend::new());
        storage
            .put("ac/k", crate::storage::backend::bytes_stream("v"))
            .await
            .unwrap();
        let state = Arc::new(AppState::new(
            Config::default(),
            Arc::new(BrokenIndex),
            storage,
        ));

        let response = retrieve(state.clone(), "ac/k").await.unwrap();
        state.background.settle().await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, Bytes::from("v"));
    }

    #[tokio::test]
    async fn test_oversized_upload_rejected() {
        let mut config = Config::default();
        config.server.max_object_size = 4;
        let storage = Arc::new(MemoryBackend::new());
        let (_metadata, state) = state_with(config, storage.clone());

        let err = upload(state, "cas/big", Body::from("12345")).await.unwrap_err();
        assert!(matches!(err, CacheError::PayloadTooLarge));
        assert!(storage.get("cas/big").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retrieve_refreshes_last_used() {
        let (metadata, state) = state_with(Config::default(), Arc::new(MemoryBackend::new()));
        upload(state.clone(), "ac/r", Body::from("x")).await.unwrap();
        metadata.upsert("ac/r", 10).await.unwrap();

        let t0 = unix_now();
        retrieve(state.clone(), "ac/r").await.unwrap();
        state.background.settle().await;

        assert!(metadata.get("ac/r").await.unwrap().unwrap().last_used >= t0);
    }

    #[tokio::test]
    async fn test_retrieve_missing_blob_is_not_found_even_with_row() {
        let (metadata, state) = state_with(Config::default(), Arc::new(MemoryBackend::new()));
        metadata.upsert("cas/dangling", 10).await.unwrap();

        let err = retrieve(state.clone(), "cas/dangling").await.unwrap_err();
        assert!(matches!(err, CacheError::NotFound));

        let err = retrieve(state.clone(), "cas/never").await.unwrap_err();
        assert!(matches!(err, CacheError::NotFound));

        // Refresh never creates rows.
        state.background.settle().await;
        assert!(metadata.get("cas/never").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retrieve_store_error_is_internal() {
        let (_metadata, state) = state_with(Config::default(), Arc::new(BrokenStorage));
        let err = retrieve(state, "cas/x").await.unwrap_err();
        assert!(matches!(err, CacheError::Internal(_)));
    }

    #[tokio::test]
    async fn test_limit_body_allows_exact_size() {
        let exceeded = Arc::new(AtomicBool::new(false));
        let chunks: Vec<Result<Bytes, std::io::Error>> =
            vec![Ok(Bytes::from("ab")), Ok(Bytes::from("cd"))];
        let mut stream = limit_body(futures::stream::iter(chunks), 4, exceeded.clone());
        while let Some(chunk) = stream.next().await {
            chunk.unwrap();
        }
        assert!(!exceeded.load(Ordering::Relaxed));
    }
}
