use crate::error::Result;

pub mod backoff;
pub mod cache;
pub mod client;
pub mod rate_limit;
pub mod request;

pub use backoff::RetryPolicy;
pub use cache::ResponseCache;
pub use client::{FetchClient, FetchError, FetchFailure, RawResponse};
pub use rate_limit::RateLimiter;

/// Default global cap on cycles fetching at the same time.
pub const FETCH_CONCURRENCY_LIMIT: usize = 5;

pub type FetchResult<T> = Result<T>;

#[inline]
pub fn ensure_concurrency_limit(limit: usize) -> usize {
    limit.max(1)
}
