//! mediashelf - result caching for an anime and manga library
//!
//! Two caches sit between the app and its metadata sources:
//!
//! - [`query`]: a stale-while-revalidate engine for list results (search,
//!   trending, seasonal, genre pages) persisted in SQLite
//! - [`batch`]: a debounced, de-duplicating cache for per-title lookups such
//!   as release state
//!
//! Neither talks to a network; callers supply async fetchers.

pub mod batch;
pub mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod query;

pub use batch::{
    BatchCache, BatchEntity, InvalidationEvent, ReleaseState, ReleaseStateCache, release_cache,
};
pub use cache::{CacheStore, CacheTtl, MemoryStore, ResultKind, SqliteStore, query_key};
pub use error::{Error, FetchError, Result};
pub use fetch::{FetchCategory, RateLimiterSet};
pub use query::{
    Fetcher, HasId, Query, QueryClient, QueryOptions, QueryRequest, QueryState, ResultPage, fetcher,
};
