//! Per-category rate limiting for fetchers
//!
//! Implements reactive rate limiting that only activates after a fetcher
//! reports [`FetchError::RateLimited`]. Each category has its own quota.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::debug;

use crate::batch::{BatchFetcher, batch_fetcher};
use crate::config::RateLimitSettings;
use crate::error::FetchError;
use crate::query::{Fetcher, fetcher};

/// Categories of upstream requests with their rate limits.
///
/// Quotas follow the public metadata APIs the app talks to:
/// - Browse (search, trending, seasonal, genre pages): 90/min
/// - Detail (single title, recommendations): 90/min
/// - Release checks (batched release lookups): 30/min
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchCategory {
    Browse,
    Detail,
    ReleaseCheck,
}

impl FetchCategory {
    /// All categories for initialization.
    pub const ALL: [FetchCategory; 3] = [
        FetchCategory::Browse,
        FetchCategory::Detail,
        FetchCategory::ReleaseCheck,
    ];

    /// Requests per minute once limiting is active.
    pub fn per_minute(&self) -> u32 {
        match self {
            FetchCategory::Browse => 90,
            FetchCategory::Detail => 90,
            FetchCategory::ReleaseCheck => 30,
        }
    }
}

/// Rate limiter state for a single category.
pub struct CategoryRateLimiter {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    active: AtomicBool,
    category: FetchCategory,
}

impl CategoryRateLimiter {
    pub fn new(category: FetchCategory) -> Self {
        let quota = Quota::per_minute(
            NonZeroU32::new(category.per_minute()).unwrap_or(NonZeroU32::MIN),
        );

        Self {
            limiter: RateLimiter::direct(quota),
            active: AtomicBool::new(false),
            category,
        }
    }

    /// Activate rate limiting for this category.
    pub fn activate(&self) {
        let was_active = self.active.swap(true, Ordering::SeqCst);
        if !was_active {
            debug!("Rate limiting activated for {:?}", self.category);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Wait for permission if rate limiting is active.
    pub async fn wait_if_active(&self) {
        if self.is_active() {
            debug!("Waiting for rate limiter {:?}", self.category);
            self.limiter.until_ready().await;
        }
    }
}

/// Collection of rate limiters for all categories.
pub struct RateLimiterSet {
    limiters: HashMap<FetchCategory, CategoryRateLimiter>,
    enabled: bool,
}

impl Default for RateLimiterSet {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiterSet {
    pub fn new() -> Self {
        let limiters = FetchCategory::ALL
            .into_iter()
            .map(|category| (category, CategoryRateLimiter::new(category)))
            .collect();

        Self {
            limiters,
            enabled: true,
        }
    }

    /// A set whose guards pass every call straight through
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new()
        }
    }

    pub fn from_settings(settings: &RateLimitSettings) -> Self {
        if settings.enabled {
            Self::new()
        } else {
            Self::disabled()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Wait for rate limit permission for a category (if active).
    pub async fn wait_for(&self, category: FetchCategory) {
        if let Some(limiter) = self.limiters.get(&category) {
            limiter.wait_if_active().await;
        }
    }

    /// Activate rate limiting for a category.
    pub fn activate(&self, category: FetchCategory) {
        if let Some(limiter) = self.limiters.get(&category) {
            limiter.activate();
        }
    }

    pub fn is_active(&self, category: FetchCategory) -> bool {
        self.limiters
            .get(&category)
            .is_some_and(CategoryRateLimiter::is_active)
    }

    /// Record a fetch outcome, activating the category on a rate-limit error
    fn observe<V>(&self, category: FetchCategory, result: &Result<V, FetchError>) {
        if let Err(FetchError::RateLimited(retry_after)) = result {
            debug!(
                "{:?} fetch was rate limited, retry after {:?}",
                category, retry_after
            );
            self.activate(category);
        }
    }

    /// Wrap a query fetcher so it waits on the category's limiter.
    pub fn guard_fetcher<T>(self: &Arc<Self>, category: FetchCategory, inner: Fetcher<T>) -> Fetcher<T>
    where
        T: Send + 'static,
    {
        if !self.enabled {
            return inner;
        }

        let limiters = Arc::clone(self);
        fetcher(move || {
            let limiters = Arc::clone(&limiters);
            let inner = Arc::clone(&inner);
            async move {
                limiters.wait_for(category).await;
                let result = inner().await;
                limiters.observe(category, &result);
                result
            }
        })
    }

    /// Wrap a batched fetcher so it waits on the category's limiter.
    pub fn guard_batch_fetcher<E>(
        self: &Arc<Self>,
        category: FetchCategory,
        inner: BatchFetcher<E>,
    ) -> BatchFetcher<E>
    where
        E: Send + 'static,
    {
        if !self.enabled {
            return inner;
        }

        let limiters = Arc::clone(self);
        batch_fetcher(move |ids: Vec<String>| {
            let limiters = Arc::clone(&limiters);
            let inner = Arc::clone(&inner);
            async move {
                limiters.wait_for(category).await;
                let result = inner(ids).await;
                limiters.observe(category, &result);
                result
            }
        })
    }
}
