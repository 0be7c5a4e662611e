//! In-memory metadata index.
//!
//! Stores all rows in memory with no persistence. Useful for testing
//! and ephemeral deployments. Uses `RwLock<BTreeMap>` so range scans come
//! back in key order.

use std::collections::BTreeMap;
use std::future::Future;
use std::ops::Bound;
use std::pin::Pin;
use std::sync::RwLock;

use super::store::{CacheEntry, MetadataIndex};

#[derive(Default)]
pub struct MemoryMetadataIndex {
    /// key -> last_used
    rows: RwLock<BTreeMap<String, i64>>,
}

impl MemoryMetadataIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> anyhow::Result<std::sync::RwLockReadGuard<'_, BTreeMap<String, i64>>> {
        self.rows
            .read()
            .map_err(|_| anyhow::anyhow!("metadata rwlock poisoned"))
    }

    fn write(&self) -> anyhow::Result<std::sync::RwLockWriteGuard<'_, BTreeMap<String, i64>>> {
        self.rows
            .write()
            .map_err(|_| anyhow::anyhow!("metadata rwlock poisoned"))
    }
}

impl MetadataIndex for MemoryMetadataIndex {
    fn upsert(
        &self,
        key: &str,
        last_used: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            self.write()?.insert(key, last_used);
            Ok(())
        })
    }

    fn touch(
        &self,
        key: &str,
        last_used: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut rows = self.write()?;
            match rows.get_mut(&key) {
                Some(existing) => {
                    *existing = last_used;
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<CacheEntry>>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let rows = self.read()?;
            Ok(rows.get(&key).map(|&last_used| CacheEntry { key, last_used }))
        })
    }

    fn list_stale(
        &self,
        after: &str,
        stale_before: i64,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<String>>> + Send + '_>> {
        let after = after.to_string();
        Box::pin(async move {
            let rows = self.read()?;
            Ok(rows
                .range::<String, _>((Bound::Excluded(&after), Bound::Unbounded))
                .filter(|(_, last_used)| **last_used <= stale_before)
                .take(limit)
                .map(|(k, _)| k.clone())
                .collect())
        })
    }

    fn delete_many(
        &self,
        keys: &[String],
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>> {
        let keys = keys.to_vec();
        Box::pin(async move {
            let mut rows = self.write()?;
            let deleted = keys.iter().filter(|k| rows.remove(*k).is_some()).count();
            Ok(deleted as u64)
        })
    }

    fn count(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>> {
        Box::pin(async move { Ok(self.read()?.len() as u64) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_does_not_duplicate() {
        let index = MemoryMetadataIndex::new();
        index.upsert("ac/k", 1).await.unwrap();
        index.upsert("ac/k", 2).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 1);
        assert_eq!(index.get("ac/k").await.unwrap().unwrap().last_used, 2);
    }

    #[tokio::test]
    async fn test_touch_never_creates() {
        let index = MemoryMetadataIndex::new();
        assert!(!index.touch("cas/ghost", 9).await.unwrap());
        assert_eq!(index.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_stale_matches_sqlite_semantics() {
        let index = MemoryMetadataIndex::new();
        index.upsert("ac/a", 1).await.unwrap();
        index.upsert("ac/b", 100).await.unwrap();
        index.upsert("cas/a", 10).await.unwrap();
        index.upsert("cas/b", 11).await.unwrap();

        assert_eq!(
            index.list_stale("", 10, 10).await.unwrap(),
            vec!["ac/a", "cas/a"]
        );
        // Cursor is exclusive.
        assert_eq!(index.list_stale("ac/a", 10, 10).await.unwrap(), vec!["cas/a"]);
        assert_eq!(index.list_stale("", 100, 2).await.unwrap(), vec!["ac/a", "ac/b"]);
    }

    #[tokio::test]
    async fn test_delete_many_counts_existing() {
        let index = MemoryMetadataIndex::new();
        index.upsert("ac/1", 1).await.unwrap();
        let deleted = index
            .delete_many(&["ac/1".to_string(), "ac/2".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(index.count().await.unwrap(), 0);
    }
}
