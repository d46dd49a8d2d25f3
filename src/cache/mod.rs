//! Persistent cache for query results
//!
//! Provides the store collaborator used by the query engine: a SQLite-backed
//! implementation for the application and an in-memory one for embedding.

pub mod key;
pub mod memory;
pub mod storage;
pub mod store;

use std::time::Duration;

/// Cache TTL configuration per list type
///
/// Each cache key carries its own freshness policy; volatile lists expire in
/// minutes while frozen historical data lasts a day.
pub struct CacheTtl;

impl CacheTtl {
    // Volatile lists
    pub const SEARCH: Duration = Duration::from_secs(5 * 60); // 5 min
    pub const TRENDING: Duration = Duration::from_secs(10 * 60); // 10 min
    pub const AIRING_SCHEDULE: Duration = Duration::from_secs(15 * 60); // 15 min

    // Browse tabs
    pub const GENRE_BROWSE: Duration = Duration::from_secs(30 * 60); // 30 min
    pub const CURRENT_SEASON: Duration = Duration::from_secs(60 * 60); // 1 hr
    pub const RECOMMENDATIONS: Duration = Duration::from_secs(60 * 60); // 1 hr
    pub const MEDIA_DETAIL: Duration = Duration::from_secs(60 * 60); // 1 hr

    // Rankings move slowly
    pub const TOP_RATED: Duration = Duration::from_secs(6 * 60 * 60); // 6 hr

    // Past seasons never change
    pub const PAST_SEASON: Duration = Duration::from_secs(24 * 60 * 60); // 24 hr
}

// Re-export main types
pub use key::query_key;
pub use memory::MemoryStore;
pub use storage::{CacheStorage, SqliteStore};
pub use store::{CacheStore, ResultKind, StoredEntry};
