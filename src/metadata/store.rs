//! Abstract metadata index trait.
//!
//! Any metadata backend must implement [`MetadataIndex`].  The trait
//! uses `async_trait`-style methods (manual desugaring with pinned
//! futures) so it can be used with both SQLite and in-memory stores.
//!
//! The index must always list at least every `ac/` and `cas/` object
//! present in the blob store.  Rows without a blob ("dangling" entries)
//! are tolerated; the sweeper removes them once they go stale.

use std::future::Future;
use std::pin::Pin;

/// One row of the metadata index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Namespaced object key (`ac/<id>` or `cas/<id>`).
    pub key: String,
    /// Seconds since the Unix epoch of the last upload or read.
    pub last_used: i64,
}

/// Async metadata index contract.
pub trait MetadataIndex: Send + Sync + 'static {
    /// Insert `key` or, if present, overwrite its `last_used`.
    fn upsert(
        &self,
        key: &str,
        last_used: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Set `last_used` on an existing row.  Returns `false` when no row
    /// exists; never creates one.
    fn touch(
        &self,
        key: &str,
        last_used: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    /// Fetch a single row.
    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<CacheEntry>>> + Send + '_>>;

    /// Up to `limit` keys with `key > after` and `last_used <= stale_before`,
    /// ascending by key.
    fn list_stale(
        &self,
        after: &str,
        stale_before: i64,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<String>>> + Send + '_>>;

    /// Delete every row in `keys`, returning how many existed.
    fn delete_many(
        &self,
        keys: &[String],
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>>;

    /// Total number of rows.
    fn count(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>>;
}
