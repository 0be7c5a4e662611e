//! Process-lifetime credential cache.
//!
//! Maps a credential id to the secret fetched from the credential store,
//! or to a negative ("no such credential") result.  Found secrets are kept
//! for the long positive TTL; negative results only for the short negative
//! TTL, so a newly provisioned credential is usable within seconds.
//!
//! There is no size-based eviction: the number of distinct ids is bounded
//! by the size of the team using the cache.

use std::collections::HashMap;
use std::future::Future;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use metrics::counter;

use crate::metrics::CREDENTIAL_CACHE_TOTAL;

#[derive(Debug, Clone)]
struct CachedCredential {
    /// `None` records a lookup that found nothing.
    value: Option<String>,
    expires_at: Instant,
}

impl CachedCredential {
    /// Valid strictly before `expires_at`.
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-memory cache in front of the credential store.
#[derive(Debug)]
pub struct CredentialCache {
    entries: RwLock<HashMap<String, CachedCredential>>,
    positive_ttl: Duration,
    negative_ttl: Duration,
}

impl CredentialCache {
    pub fn new(positive_ttl: Duration, negative_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            positive_ttl,
            negative_ttl,
        }
    }

    /// Return the cached value for `id`, calling `fetch` on a miss or an
    /// expired entry.
    ///
    /// Concurrent misses for the same id may each call `fetch`; the last
    /// result stored wins.  Errors from `fetch` are returned and nothing is
    /// cached.
    pub async fn retrieve<F, Fut>(&self, id: &str, fetch: F) -> anyhow::Result<Option<String>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<String>>>,
    {
        self.retrieve_at(id, Instant::now, fetch).await
    }

    /// [`retrieve`](Self::retrieve) with an explicit clock.
    pub(crate) async fn retrieve_at<C, F, Fut>(
        &self,
        id: &str,
        clock: C,
        fetch: F,
    ) -> anyhow::Result<Option<String>>
    where
        C: Fn() -> Instant,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<String>>>,
    {
        if let Some(hit) = self.lookup(id, clock()) {
            counter!(CREDENTIAL_CACHE_TOTAL, "result" => "hit").increment(1);
            return Ok(hit);
        }
        counter!(CREDENTIAL_CACHE_TOTAL, "result" => "miss").increment(1);

        let value = fetch().await?;
        let ttl = if value.is_some() {
            self.positive_ttl
        } else {
            self.negative_ttl
        };
        let now = clock();
        let entry = CachedCredential {
            value: value.clone(),
            expires_at: now + ttl,
        };
        let mut entries = self.write();
        // Expired entries are dropped on every miss, so the map never
        // outgrows the ids seen within one positive TTL.
        entries.retain(|_, e| e.is_live(now));
        entries.insert(id.to_string(), entry);
        Ok(value)
    }

    fn lookup(&self, id: &str, now: Instant) -> Option<Option<String>> {
        let entries = self.read();
        entries
            .get(id)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone())
    }

    /// Drop the entry for `id` so the next lookup goes to the store.
    pub fn invalidate(&self, id: &str) {
        self.write().remove(id);
    }

    /// Drop every entry.
    pub fn flush(&self) {
        self.write().clear();
    }

    /// Number of cached entries, live or expired.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Every critical section is a single map operation, so a poisoned lock
    // still guards a consistent map.
    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, CachedCredential>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, CachedCredential>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}
