//! Stale-tolerant caching
//!
//! [`StaleCache`] answers reads from a fresh TTL, fetches on a miss, and
//! falls back to an older value when the fetch fails, as long as that value
//! is inside its stale-tolerance window.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//!
//! use bulwark_resilience::{Origin, ResilienceError, ResilienceResult, StaleCache};
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let cache: StaleCache<String> = StaleCache::new();
//! let ctx = CancellationToken::new();
//! let (ttl, stale_ttl) = (Duration::ZERO, Duration::from_secs(60));
//!
//! let first: ResilienceResult<_, std::io::Error> =
//!     cache.get_or_fetch(&ctx, "user:1", ttl, stale_ttl, || async { Ok("alice".into()) }).await;
//! assert_eq!(first.unwrap().origin, Origin::Fetched);
//!
//! let fallback = cache
//!     .get_or_fetch(&ctx, "user:1", ttl, stale_ttl, || async {
//!         Err(ResilienceError::NonRetryableDependency {
//!             source: std::io::Error::other("connection refused"),
//!         })
//!     })
//!     .await
//!     .unwrap();
//! assert!(fallback.is_stale());
//! assert_eq!(fallback.value, "alice");
//! # }
//! ```

mod stale;
mod stats;

pub use stale::{Cached, Origin, StaleCache};
pub use stats::CacheStats;
