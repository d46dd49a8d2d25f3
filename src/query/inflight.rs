//! Process-wide map of in-flight fetches
//!
//! At most one fetch runs per cache key. Later callers join the running
//! fetch through a [`Shared`] future and receive the same result. The fetch
//! itself runs on a spawned task, so it completes (and leaves the map) even
//! when every caller has stopped waiting.

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::FetchError;

/// Type-erased fetch result; one map serves queries of every item type
pub type SharedValue = Arc<dyn Any + Send + Sync>;

/// A fetch that any number of callers can await
pub type SharedFetch = Shared<BoxFuture<'static, Result<SharedValue, FetchError>>>;

struct InFlightEntry {
    ticket: u64,
    fetch: SharedFetch,
}

/// Outcome of [`InFlightMap::join_or_start`]
pub struct Joined {
    pub fetch: SharedFetch,
    /// True when this caller started the fetch rather than joining one
    pub started: bool,
}

#[derive(Default)]
pub struct InFlightMap {
    entries: Mutex<HashMap<String, InFlightEntry>>,
    next_ticket: AtomicU64,
}

impl InFlightMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the fetch running for `key`, or start one with `start`.
    ///
    /// The check and the insert happen under one lock, so two callers can
    /// never both start a fetch for the same key.
    pub fn join_or_start<F>(self: &Arc<Self>, key: &str, start: F) -> Joined
    where
        F: FnOnce() -> BoxFuture<'static, Result<SharedValue, FetchError>>,
    {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(entry) = entries.get(key) {
            log::debug!("Joining in-flight fetch: {}", key);
            return Joined {
                fetch: entry.fetch.clone(),
                started: false,
            };
        }

        log::debug!("Starting fetch: {}", key);
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        let fut = start();

        let map = Arc::clone(self);
        let owned_key = key.to_string();
        let handle = tokio::spawn(async move {
            let result = fut.await;
            map.settle(&owned_key, ticket);
            result
        });

        let map = Arc::clone(self);
        let owned_key = key.to_string();
        let fetch = async move {
            match handle.await {
                Ok(result) => result,
                Err(join_err) => {
                    map.settle(&owned_key, ticket);
                    Err(FetchError::Aborted(join_err.to_string()))
                }
            }
        }
        .boxed()
        .shared();

        entries.insert(
            key.to_string(),
            InFlightEntry {
                ticket,
                fetch: fetch.clone(),
            },
        );

        Joined {
            fetch,
            started: true,
        }
    }

    /// Whether a fetch for `key` is currently running
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .map(|entries| entries.contains_key(key))
            .unwrap_or(false)
    }

    /// Number of running fetches
    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every running fetch; they still complete but no longer coalesce
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    /// Remove the entry for `key` if it still belongs to `ticket`
    fn settle(&self, key: &str, ticket: u64) {
        if let Ok(mut entries) = self.entries.lock()
            && entries.get(key).is_some_and(|entry| entry.ticket == ticket)
        {
            entries.remove(key);
        }
    }
}
