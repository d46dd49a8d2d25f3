//! Store collaborator contract for persisted query results

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::CacheError;

/// Media type tag persisted alongside each cached result set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    Anime,
    Manga,
    Mixed,
}

impl ResultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultKind::Anime => "anime",
            ResultKind::Manga => "manga",
            ResultKind::Mixed => "mixed",
        }
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResultKind {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "anime" => Ok(ResultKind::Anime),
            "manga" => Ok(ResultKind::Manga),
            "mixed" => Ok(ResultKind::Mixed),
            other => Err(CacheError::Serialization(format!(
                "unknown result kind '{}'",
                other
            ))),
        }
    }
}

/// A persisted entry together with the store's freshness verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    /// JSON-encoded array of result items
    pub data: String,
    /// Whether the entry is younger than the TTL supplied at read time
    pub is_fresh: bool,
}

/// Persistent key-value store consulted by the query engine.
///
/// Freshness is decided here, not by the engine: `now - saved_at < ttl`.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Read the entry for `key` and judge its freshness against `ttl`
    async fn read_with_freshness(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<StoredEntry>, CacheError>;

    /// Replace the entry for `key`
    async fn write(
        &self,
        key: &str,
        data: &str,
        kind: ResultKind,
        ttl: Duration,
    ) -> Result<(), CacheError>;
}
