//! Helpers for caller-supplied fetchers
//!
//! The engine never talks to a network itself. Fetchers handed to
//! [`crate::query`] and [`crate::batch`] can be wrapped here with reactive
//! rate limiting.

pub mod rate_limit;

pub use rate_limit::{CategoryRateLimiter, FetchCategory, RateLimiterSet};
