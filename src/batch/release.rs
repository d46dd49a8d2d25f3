//! Per-title release tracking state
//!
//! Served through a [`BatchCache`] so that a library grid rendering hundreds
//! of titles issues one release lookup per debounce window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{BatchCache, BatchEntity, BatchFetcher};
use crate::config::Config;
use crate::fetch::{FetchCategory, RateLimiterSet};

/// Release status normalized across upstream sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    Ongoing,
    Completed,
    Hiatus,
    Upcoming,
    Unknown,
    /// Placeholder for ids the backend does not track
    NotTracked,
}

impl ReleaseStatus {
    /// Map a raw upstream status string onto a normalized status.
    ///
    /// Accepts both enum-style (`RELEASING`) and prose-style
    /// (`Currently Airing`) spellings.
    pub fn normalize(raw: &str) -> Self {
        let lowered = raw.trim().to_lowercase().replace(['_', '-'], " ");
        match lowered.as_str() {
            "releasing" | "ongoing" | "currently airing" | "airing" | "publishing" => {
                ReleaseStatus::Ongoing
            }
            "finished" | "completed" | "finished airing" | "finished publishing" => {
                ReleaseStatus::Completed
            }
            "hiatus" | "on hiatus" => ReleaseStatus::Hiatus,
            "not yet released" | "not yet aired" | "not yet published" | "upcoming" => {
                ReleaseStatus::Upcoming
            }
            _ => ReleaseStatus::Unknown,
        }
    }
}

/// Release tracking state for one title
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseState {
    pub media_id: String,
    pub has_new_release: bool,
    /// Latest released episode or chapter number
    pub latest_number: Option<i64>,
    /// Highest number the user has already been told about
    pub notified_up_to_number: Option<i64>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub normalized_status: ReleaseStatus,
}

impl ReleaseState {
    /// Releases newer than the last notification, when both numbers are known
    pub fn unseen_releases(&self) -> Option<i64> {
        match (self.latest_number, self.notified_up_to_number) {
            (Some(latest), Some(notified)) => Some((latest - notified).max(0)),
            (Some(latest), None) => Some(latest),
            _ => None,
        }
    }
}

impl BatchEntity for ReleaseState {
    fn entity_id(&self) -> &str {
        &self.media_id
    }

    fn placeholder(id: &str) -> Self {
        Self {
            media_id: id.to_string(),
            has_new_release: false,
            latest_number: None,
            notified_up_to_number: None,
            last_checked_at: None,
            normalized_status: ReleaseStatus::NotTracked,
        }
    }

    fn is_placeholder(&self) -> bool {
        self.normalized_status == ReleaseStatus::NotTracked
    }
}

/// Batched release-state lookups
pub type ReleaseStateCache = BatchCache<ReleaseState>;

/// Release cache wired from configuration.
///
/// Lookups are batched over `batch.debounce_ms` and the fetcher waits on the
/// release-check limiter of `limiters`, which is a pass-through when
/// `rate_limit.enabled` is off (see [`RateLimiterSet::from_settings`]).
pub fn release_cache(
    config: &Config,
    limiters: &Arc<RateLimiterSet>,
    fetcher: BatchFetcher<ReleaseState>,
) -> ReleaseStateCache {
    let fetcher = limiters.guard_batch_fetcher(FetchCategory::ReleaseCheck, fetcher);
    BatchCache::from_settings(fetcher, &config.batch)
}
