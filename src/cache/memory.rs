//! In-memory cache store
//!
//! Same freshness semantics as the SQLite store, without persistence. Used
//! when the on-disk cache is disabled and as a controllable store in tests.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::cache::storage::ttl_secs;
use crate::cache::store::{CacheStore, ResultKind, StoredEntry};
use crate::error::CacheError;

#[derive(Debug, Clone)]
struct MemoryRow {
    data: String,
    kind: ResultKind,
    saved_at: i64,
}

/// Process-local [`CacheStore`]
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<String, MemoryRow>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry saved `age` ago
    pub fn seed(&self, key: &str, data: &str, kind: ResultKind, age: Duration) {
        let saved_at = Utc::now().timestamp().saturating_sub(ttl_secs(age));
        if let Ok(mut rows) = self.rows.lock() {
            rows.insert(
                key.to_string(),
                MemoryRow {
                    data: data.to_string(),
                    kind,
                    saved_at,
                },
            );
        }
    }

    /// Stored data and kind for a key
    pub fn get(&self, key: &str) -> Option<(String, ResultKind)> {
        let rows = self.rows.lock().ok()?;
        rows.get(key).map(|row| (row.data.clone(), row.kind))
    }

    /// Make subsequent reads fail
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent writes fail
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        if let Ok(mut rows) = self.rows.lock() {
            rows.clear();
        }
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn read_with_freshness(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<StoredEntry>, CacheError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(CacheError::Io("read failure".to_string()));
        }

        let now = Utc::now().timestamp();
        let rows = self
            .rows
            .lock()
            .map_err(|_| CacheError::Io("Cache lock poisoned".to_string()))?;

        Ok(rows.get(key).map(|row| StoredEntry {
            data: row.data.clone(),
            is_fresh: now - row.saved_at < ttl_secs(ttl),
        }))
    }

    async fn write(
        &self,
        key: &str,
        data: &str,
        kind: ResultKind,
        _ttl: Duration,
    ) -> Result<(), CacheError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CacheError::Io("write failure".to_string()));
        }

        let mut rows = self
            .rows
            .lock()
            .map_err(|_| CacheError::Io("Cache lock poisoned".to_string()))?;
        rows.insert(
            key.to_string(),
            MemoryRow {
                data: data.to_string(),
                kind,
                saved_at: Utc::now().timestamp(),
            },
        );
        Ok(())
    }
}
