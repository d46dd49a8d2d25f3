//! Stale-while-revalidate query engine
//!
//! A [`Query`] shows persisted results for its key as soon as the store has
//! answered, then refreshes them through a caller-supplied [`Fetcher`].
//! Concurrent fetches for one key are coalesced by the [`QueryClient`]'s
//! in-flight map.

pub mod engine;
pub mod inflight;
#[cfg(test)]
pub mod mock;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::ResultKind;
use crate::error::FetchError;

pub use engine::{Query, QueryClient};
pub use inflight::InFlightMap;

/// Items with a stable identity, used for de-duplicating result pages
pub trait HasId {
    fn id(&self) -> &str;
}

/// Bounds every cached result item satisfies
pub trait QueryItem: HasId + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> QueryItem for T where T: HasId + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{}

/// One page of results as returned by a fetcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPage<T> {
    pub results: Vec<T>,
    #[serde(default)]
    pub has_next_page: bool,
}

impl<T> ResultPage<T> {
    pub fn new(results: Vec<T>, has_next_page: bool) -> Self {
        Self {
            results,
            has_next_page,
        }
    }
}

/// Caller-supplied data source for a query
pub type Fetcher<T> =
    Arc<dyn Fn() -> BoxFuture<'static, Result<ResultPage<T>, FetchError>> + Send + Sync>;

/// Build a [`Fetcher`] from an async closure.
///
/// # Example
/// ```ignore
/// let trending = fetcher(move || {
///     let api = api.clone();
///     async move { api.trending(1).await }
/// });
/// ```
pub fn fetcher<T, F, Fut>(f: F) -> Fetcher<T>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ResultPage<T>, FetchError>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Per-query switches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    /// Drop repeated ids from fetched results, keeping the first occurrence
    pub deduplicate_by_id: bool,
    /// A disabled query publishes `loading = false` and does nothing else
    pub enabled: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            deduplicate_by_id: true,
            enabled: true,
        }
    }
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deduplicate_by_id(mut self, dedupe: bool) -> Self {
        self.deduplicate_by_id = dedupe;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Everything needed to run one query
pub struct QueryRequest<T> {
    pub key: String,
    pub fetcher: Fetcher<T>,
    pub ttl: Duration,
    pub kind: ResultKind,
    pub options: QueryOptions,
}

impl<T> QueryRequest<T> {
    pub fn new(key: impl Into<String>, fetcher: Fetcher<T>, ttl: Duration, kind: ResultKind) -> Self {
        Self {
            key: key.into(),
            fetcher,
            ttl,
            kind,
            options: QueryOptions::default(),
        }
    }

    pub fn options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }
}

impl<T> Clone for QueryRequest<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            fetcher: Arc::clone(&self.fetcher),
            ttl: self.ttl,
            kind: self.kind,
            options: self.options,
        }
    }
}

impl<T> fmt::Debug for QueryRequest<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryRequest")
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .field("kind", &self.kind)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Observable state of one query.
///
/// `loading` is only set while nothing displayable exists; once data is
/// shown, refreshes surface as `is_revalidating`. `error` is only set when a
/// fetch failed and there was no data to keep showing.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState<T> {
    pub data: Vec<T>,
    pub loading: bool,
    pub is_revalidating: bool,
    pub error: Option<String>,
    pub has_next_page: bool,
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            loading: false,
            is_revalidating: false,
            error: None,
            has_next_page: false,
        }
    }
}

/// Remove repeated ids, keeping the first occurrence and arrival order
pub fn dedupe_by_id<T: HasId>(items: Vec<T>) -> Vec<T> {
    let mut seen = HashSet::with_capacity(items.len());
    items
        .into_iter()
        .filter(|item| seen.insert(item.id().to_string()))
        .collect()
}
