//! SQLite-backed metadata index.
//!
//! Uses `rusqlite` with the `bundled` feature so no system SQLite
//! library is required.  All async trait methods are thin wrappers
//! around synchronous rusqlite calls executed under a `Mutex`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use super::store::{CacheEntry, MetadataIndex};

/// Current schema version. Bumped when migrations are added.
const SCHEMA_VERSION: i64 = 1;

/// SQLite caps bound variables at 999 per statement.
const DELETE_CHUNK: usize = 999;

/// Metadata index backed by a single SQLite database file.
pub struct SqliteMetadataIndex {
    /// The database connection, guarded by a mutex for Send + Sync.
    conn: Mutex<Connection>,
}

impl SqliteMetadataIndex {
    /// Open (or create) the database at `path` and initialize the schema.
    ///
    /// Passing `":memory:"` creates an in-memory database (useful for tests).
    pub fn new(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.apply_pragmas()?;
        store.init_db()?;
        Ok(store)
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("metadata connection mutex poisoned"))
    }

    /// Apply recommended SQLite pragmas for performance and safety.
    fn apply_pragmas(&self) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            ",
        )?;
        Ok(())
    }

    /// Create the required tables if they do not already exist.
    /// This is idempotent -- safe to call on every startup (crash-only design).
    fn init_db(&self) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_version (
                version    INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            );

            -- One row per cached object; the primary key index serves the
            -- sweeper's cursor scan.
            CREATE TABLE IF NOT EXISTS cache_entries (
                key        TEXT PRIMARY KEY,
                last_used  INTEGER NOT NULL
            );
            ",
        )?;

        let existing: Option<i64> = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .optional()?
            .flatten();

        if existing.map_or(true, |v| v < SCHEMA_VERSION) {
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?1, ?2)",
                params![SCHEMA_VERSION, chrono::Utc::now().timestamp()],
            )?;
        }

        Ok(())
    }
}

// ── MetadataIndex implementation ───────────────────────────────────

impl MetadataIndex for SqliteMetadataIndex {
    fn upsert(
        &self,
        key: &str,
        last_used: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO cache_entries (key, last_used) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET last_used = excluded.last_used",
                params![key, last_used],
            )?;
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
            let conn = self.lock()?;
            let changed = conn.execute(
                "UPDATE cache_entries SET last_used = ?1 WHERE key = ?2",
                params![last_used, key],
            )?;
            Ok(changed > 0)
        })
    }

    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<CacheEntry>>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            let entry = conn
                .query_row(
                    "SELECT key, last_used FROM cache_entries WHERE key = ?1",
                    params![key],
                    |row| {
                        Ok(CacheEntry {
                            key: row.get(0)?,
                            last_used: row.get(1)?,
                        })
                    },
                )
                .optional()?;
            Ok(entry)
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
            let conn = self.lock()?;
            let mut stmt = conn.prepare(
                "SELECT key FROM cache_entries
                 WHERE key > ?1 AND last_used <= ?2
                 ORDER BY key ASC
                 LIMIT ?3",
            )?;
            let keys = stmt
                .query_map(params![after, stale_before, limit as i64], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(keys)
        })
    }

    fn delete_many(
        &self,
        keys: &[String],
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>> {
        let keys = keys.to_vec();
        Box::pin(async move {
            let conn = self.lock()?;
            let mut deleted = 0u64;
            for chunk in keys.chunks(DELETE_CHUNK) {
                let placeholders: Vec<String> =
                    (0..chunk.len()).map(|i| format!("?{}", i + 1)).collect();
                let sql = format!(
                    "DELETE FROM cache_entries WHERE key IN ({})",
                    placeholders.join(", ")
                );
                let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                    chunk.iter().map(|k| k as &dyn rusqlite::types::ToSql).collect();
                deleted += conn.execute(&sql, param_refs.as_slice())? as u64;
            }
            Ok(deleted)
        })
    }

    fn count(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| {
                row.get(0)
            })?;
            Ok(n as u64)
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────
