//! SQLite-based storage for persisted query results
//!
//! One row per cache key holding the JSON result array, its media kind, the
//! save timestamp, and the TTL it was written with.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crate::cache::store::{CacheStore, ResultKind, StoredEntry};
use crate::error::CacheError;

/// Schema version - increment to trigger nuke-and-rebuild
const SCHEMA_VERSION: i32 = 1;

type Result<T> = std::result::Result<T, CacheError>;

/// A raw cache row
#[derive(Debug, Clone)]
pub struct CachedRow {
    pub data: String,
    pub kind: ResultKind,
    pub saved_at: i64,
    pub ttl_secs: i64,
}

impl CachedRow {
    /// Freshness judged against the TTL the caller supplies, not the stored one
    pub fn is_fresh_at(&self, now: i64, ttl: Duration) -> bool {
        now - self.saved_at < ttl_secs(ttl)
    }
}

/// TTL in whole seconds, saturating at `i64::MAX`
pub(crate) fn ttl_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX)
}

/// SQLite-backed cache storage
pub struct CacheStorage {
    conn: Connection,
}

impl CacheStorage {
    /// Open or create cache storage at the default XDG cache location
    pub fn open() -> Result<Self> {
        let cache_dir = Self::cache_dir()?;
        Self::open_at(&cache_dir)
    }

    /// Get the cache directory path (~/.cache/mediashelf on Linux)
    pub fn cache_dir() -> Result<PathBuf> {
        let cache_base = dirs::cache_dir().ok_or(CacheError::NoHome)?;
        Ok(cache_base.join("mediashelf"))
    }

    /// Open cache storage at a specific directory
    pub fn open_at(cache_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(cache_dir)
            .map_err(|e| CacheError::Io(format!("Failed to create cache dir: {}", e)))?;

        let db_path = cache_dir.join("cache.db");
        let conn = Connection::open(&db_path)?;

        // Check schema version - nuke if mismatched
        let version: i32 = conn
            .pragma_query_value(None, "user_version", |r| r.get(0))
            .unwrap_or(0);

        if version != 0 && version != SCHEMA_VERSION {
            log::info!(
                "Cache schema version mismatch ({} != {}), rebuilding",
                version,
                SCHEMA_VERSION
            );
            drop(conn);
            Self::nuke(&db_path)?;
            return Self::open_at(cache_dir);
        }

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS query_cache (
                cache_key TEXT PRIMARY KEY NOT NULL,
                data TEXT NOT NULL,
                kind TEXT NOT NULL,
                saved_at INTEGER NOT NULL,
                ttl_secs INTEGER NOT NULL,
                size_bytes INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_kind ON query_cache(kind);
            CREATE INDEX IF NOT EXISTS idx_saved_at ON query_cache(saved_at);
            "#,
        )?;

        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;

        Ok(Self { conn })
    }

    /// Read the raw row for a key regardless of age
    pub fn read_entry(&self, key: &str) -> Result<Option<CachedRow>> {
        let row: Option<(String, String, i64, i64)> = self
            .conn
            .query_row(
                "SELECT data, kind, saved_at, ttl_secs FROM query_cache WHERE cache_key = ?1",
                [key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        match row {
            Some((data, kind, saved_at, ttl_secs)) => Ok(Some(CachedRow {
                data,
                kind: kind.parse()?,
                saved_at,
                ttl_secs,
            })),
            None => Ok(None),
        }
    }

    /// Read an entry with a freshness verdict for the given TTL
    pub fn read_with_freshness(&self, key: &str, ttl: Duration) -> Result<Option<StoredEntry>> {
        let now = Utc::now().timestamp();
        Ok(self.read_entry(key)?.map(|row| StoredEntry {
            is_fresh: row.is_fresh_at(now, ttl),
            data: row.data,
        }))
    }

    /// Store data, stamping it with the current time
    pub fn put(&self, key: &str, data: &str, kind: ResultKind, ttl: Duration) -> Result<()> {
        self.put_at(key, data, kind, ttl, Utc::now().timestamp())
    }

    /// Store data with an explicit save timestamp (unix seconds)
    pub fn put_at(
        &self,
        key: &str,
        data: &str,
        kind: ResultKind,
        ttl: Duration,
        saved_at: i64,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO query_cache
             (cache_key, data, kind, saved_at, ttl_secs, size_bytes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                key,
                data,
                kind.as_str(),
                saved_at,
                ttl_secs(ttl),
                data.len() as i64
            ],
        )?;
        Ok(())
    }

    /// Clear all cache entries
    pub fn clear_all(&self) -> Result<ClearStats> {
        let removed = self.conn.execute("DELETE FROM query_cache", [])?;
        Ok(ClearStats {
            entries_removed: removed,
        })
    }

    /// Delete a specific cache entry by key
    pub fn delete_by_key(&self, key: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM query_cache WHERE cache_key = ?1", [key])?;
        Ok(deleted > 0)
    }

    /// Delete every entry of one media kind
    pub fn delete_by_kind(&self, kind: ResultKind) -> Result<usize> {
        let deleted = self
            .conn
            .execute("DELETE FROM query_cache WHERE kind = ?1", [kind.as_str()])?;
        Ok(deleted)
    }

    /// Delete entries whose key starts with `prefix`
    ///
    /// For example `delete_by_prefix("browse:anime")` drops every cached
    /// anime browse tab regardless of its filters.
    pub fn delete_by_prefix(&self, prefix: &str) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM query_cache WHERE substr(cache_key, 1, length(?1)) = ?1",
            [prefix],
        )?;
        Ok(deleted)
    }

    /// Get cache statistics, judging freshness by each entry's stored TTL
    pub fn stats(&self) -> Result<CacheStats> {
        let now = Utc::now().timestamp();

        let total_entries: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM query_cache", [], |r| r.get(0))?;

        let fresh_entries: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM query_cache WHERE saved_at + ttl_secs > ?1",
            [now],
            |r| r.get(0),
        )?;

        let total_size: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM query_cache",
            [],
            |r| r.get(0),
        )?;

        let (oldest, newest): (Option<i64>, Option<i64>) = self.conn.query_row(
            "SELECT MIN(saved_at), MAX(saved_at) FROM query_cache",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;

        Ok(CacheStats {
            total_entries: total_entries as usize,
            fresh_entries: fresh_entries as usize,
            stale_entries: (total_entries - fresh_entries) as usize,
            total_size_bytes: total_size as usize,
            oldest_entry: oldest,
            newest_entry: newest,
        })
    }

    /// Nuke the cache database
    fn nuke(db_path: &Path) -> Result<()> {
        if db_path.exists() {
            std::fs::remove_file(db_path)
                .map_err(|e| CacheError::Io(format!("Failed to remove cache DB: {}", e)))?;
        }
        Ok(())
    }
}

/// Statistics about cache clear operation
#[derive(Debug)]
pub struct ClearStats {
    pub entries_removed: usize,
}

/// Statistics about cache state
#[derive(Debug)]
pub struct CacheStats {
    pub total_entries: usize,
    pub fresh_entries: usize,
    pub stale_entries: usize,
    pub total_size_bytes: usize,
    pub oldest_entry: Option<i64>,
    pub newest_entry: Option<i64>,
}

/// [`CacheStore`] over a shared SQLite connection.
///
/// The connection is wrapped in a Mutex; it is never held across an await.
pub struct SqliteStore {
    storage: Mutex<CacheStorage>,
}

impl SqliteStore {
    pub fn new(storage: CacheStorage) -> Self {
        Self {
            storage: Mutex::new(storage),
        }
    }

    /// Open the store at `dir`, or at the default cache location
    pub fn open(dir: Option<&Path>) -> Result<Self> {
        let storage = match dir {
            Some(dir) => CacheStorage::open_at(dir)?,
            None => CacheStorage::open()?,
        };
        Ok(Self::new(storage))
    }

    fn with_storage<R>(&self, f: impl FnOnce(&CacheStorage) -> Result<R>) -> Result<R> {
        let guard = self
            .storage
            .lock()
            .map_err(|_| CacheError::Io("Cache lock poisoned".to_string()))?;
        f(&guard)
    }
}

#[async_trait]
impl CacheStore for SqliteStore {
    async fn read_with_freshness(&self, key: &str, ttl: Duration) -> Result<Option<StoredEntry>> {
        self.with_storage(|s| s.read_with_freshness(key, ttl))
    }

    async fn write(&self, key: &str, data: &str, kind: ResultKind, ttl: Duration) -> Result<()> {
        self.with_storage(|s| s.put(key, data, kind, ttl))
    }
}
