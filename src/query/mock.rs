//! Test doubles for the query engine
//!
//! Provides a simple result item, fetchers that count their calls and can be
//! held back until a test releases them, and a store whose reads for one key
//! can be held back the same way.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

use super::{Fetcher, HasId, ResultPage, fetcher};
use crate::cache::{CacheStore, MemoryStore, ResultKind, StoredEntry};
use crate::error::{CacheError, FetchError};

/// Minimal media item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub title: String,
}

impl Item {
    pub fn new(id: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
        }
    }
}

impl HasId for Item {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Items with the id doubling as title
pub fn items(ids: &[&str]) -> Vec<Item> {
    ids.iter().map(|id| Item::new(id, id)).collect()
}

/// Fetcher that counts calls and waits for a permit on `gate` before answering.
///
/// Construct with [`ScriptedFetcher::ready`] to answer immediately.
pub struct ScriptedFetcher {
    calls: Arc<AtomicUsize>,
    gate: Arc<Semaphore>,
}

impl ScriptedFetcher {
    /// Every call blocks until [`ScriptedFetcher::release`]
    pub fn gated() -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            gate: Arc::new(Semaphore::new(0)),
        }
    }

    /// Calls answer without waiting
    pub fn ready() -> Self {
        let scripted = Self::gated();
        scripted.gate.add_permits(Semaphore::MAX_PERMITS / 2);
        scripted
    }

    /// Let `n` blocked calls proceed
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// A fetcher returning `result` on every call
    pub fn fetcher(&self, result: Result<ResultPage<Item>, FetchError>) -> Fetcher<Item> {
        let calls = Arc::clone(&self.calls);
        let gate = Arc::clone(&self.gate);
        fetcher(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            let gate = Arc::clone(&gate);
            let result = result.clone();
            async move {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
                result
            }
        })
    }
}

/// [`MemoryStore`] whose reads of `held_key` wait for [`GatedStore::release`]
pub struct GatedStore {
    pub inner: MemoryStore,
    held_key: String,
    gate: Semaphore,
    held_reads: AtomicUsize,
}

impl GatedStore {
    pub fn new(held_key: &str) -> Self {
        Self {
            inner: MemoryStore::new(),
            held_key: held_key.to_string(),
            gate: Semaphore::new(0),
            held_reads: AtomicUsize::new(0),
        }
    }

    /// Reads of the held key that have started
    pub fn held_reads(&self) -> usize {
        self.held_reads.load(Ordering::SeqCst)
    }

    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }
}

#[async_trait]
impl CacheStore for GatedStore {
    async fn read_with_freshness(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<StoredEntry>, CacheError> {
        if key == self.held_key {
            self.held_reads.fetch_add(1, Ordering::SeqCst);
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
        }
        self.inner.read_with_freshness(key, ttl).await
    }

    async fn write(
        &self,
        key: &str,
        data: &str,
        kind: ResultKind,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.inner.write(key, data, kind, ttl).await
    }
}
