//! Stale-tolerant cache used as a fallback for failing fetches

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::stats::{CacheStats, MetricsCollector};
use crate::clock::{Clock, SystemClock};
use crate::error::{ResilienceError, ResilienceResult};
use crate::observability::{noop_sink, ResilienceEvent, SharedSink};

/// Where a value returned by [`StaleCache::get_or_fetch`] came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Cached and still within its fresh TTL
    Fresh,
    /// Produced by the fetch made for this request
    Fetched,
    /// Cached past its fresh TTL, served because the fetch failed
    Stale,
}

/// A value together with its provenance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cached<V> {
    pub value: V,
    pub origin: Origin,
    /// Time since the value was stored
    pub age: Duration,
}

impl<V> Cached<V> {
    /// Whether the value is a stale fallback
    pub fn is_stale(&self) -> bool {
        self.origin == Origin::Stale
    }

    /// Drop the provenance
    pub fn into_inner(self) -> V {
        self.value
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
    ttl: Duration,
    /// `None` when the window reaches past what `Instant` can represent
    stale_until: Option<Instant>,
}

impl<V: Clone> CacheEntry<V> {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) < self.ttl
    }

    fn is_usable(&self, now: Instant) -> bool {
        self.stale_until.map_or(true, |end| now < end)
    }

    fn to_cached(&self, origin: Origin, now: Instant) -> Cached<V> {
        let age = now.saturating_duration_since(self.stored_at);
        Cached { value: self.value.clone(), origin, age }
    }
}

/// End of a window of `len` opened at `start`, `None` if it never closes
fn window_end(start: Instant, len: Duration) -> Option<Instant> {
    start.checked_add(len)
}

type Flights = DashMap<String, Arc<AsyncMutex<()>>>;

/// One caller's claim on a key's fetch slot
///
/// Every caller that takes the slot out of the map holds a claim. The last
/// claim dropped removes the map entry, cancelled waiters included.
struct FlightClaim<'a> {
    flights: &'a Flights,
    key: &'a str,
    slot: Arc<AsyncMutex<()>>,
}

impl<'a> FlightClaim<'a> {
    fn join(flights: &'a Flights, key: &'a str) -> Self {
        let slot = Arc::clone(flights.entry(key.to_string()).or_default().value());
        Self { flights, key, slot }
    }
}

impl Drop for FlightClaim<'_> {
    fn drop(&mut self) {
        // map + this claim
        self.flights.remove_if(self.key, |_, current| {
            Arc::ptr_eq(current, &self.slot) && Arc::strong_count(current) <= 2
        });
    }
}

/// Exclusive right to fetch a key; the guard drops before the claim
struct FetchSlot<'a> {
    _guard: OwnedMutexGuard<()>,
    _claim: FlightClaim<'a>,
}

/// Key/value cache with a fresh TTL and a longer stale-tolerance window
///
/// A lookup inside the fresh TTL is answered without fetching. Otherwise the
/// fetch runs exactly once; if it fails and the entry is still inside its
/// stale window, the old value is returned and the window is pushed out to
/// `stale_ttl` from now so the value survives a sustained outage.
///
/// Expiry is lazy. [`StaleCache::purge_expired`] drops entries whose stale
/// window has closed.
pub struct StaleCache<V, C: Clock = SystemClock> {
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
    flights: Option<Flights>,
    clock: C,
    metrics: MetricsCollector,
    sink: SharedSink,
}

impl<V, C: Clock> fmt::Debug for StaleCache<V, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaleCache")
            .field("len", &self.len())
            .field("coalescing", &self.flights.is_some())
            .finish()
    }
}

impl<V, C: Clock> StaleCache<V, C> {
    /// Number of stored entries, including unpurged expired ones
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Get current statistics snapshot
    pub fn stats(&self) -> CacheStats {
        self.metrics.snapshot(self.len())
    }

    #[cfg(test)]
    fn flights_in_use(&self) -> usize {
        self.flights.as_ref().map_or(0, DashMap::len)
    }
}

impl<V> StaleCache<V, SystemClock>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty cache on the system clock
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl<V> Default for StaleCache<V, SystemClock>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V, C> StaleCache<V, C>
where
    V: Clone + Send + Sync + 'static,
    C: Clock,
{
    /// Create an empty cache with a custom clock (useful for testing)
    pub fn with_clock(clock: C) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            flights: None,
            clock,
            metrics: MetricsCollector::default(),
            sink: noop_sink(),
        }
    }

    /// Allow at most one concurrent fetch per key
    ///
    /// Callers missing on a key that is already being fetched wait for that
    /// fetch and re-check freshness before fetching themselves.
    #[must_use]
    pub fn with_coalescing(mut self, enabled: bool) -> Self {
        self.flights = enabled.then(DashMap::new);
        self
    }

    /// Report hits, misses and stale serves to `sink`
    #[must_use]
    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    /// Return the cached value or fetch it, falling back to a stale value
    ///
    /// # Errors
    ///
    /// Propagates the fetch error when there is no value inside its stale
    /// window. Caller cancellation is always propagated.
    pub async fn get_or_set<F, Fut, E>(
        &self,
        ctx: &CancellationToken,
        key: &str,
        ttl: Duration,
        stale_ttl: Duration,
        fetch: F,
    ) -> ResilienceResult<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ResilienceResult<V, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.get_or_fetch(ctx, key, ttl, stale_ttl, fetch).await.map(Cached::into_inner)
    }

    /// Like [`StaleCache::get_or_set`], also reporting where the value came
    /// from
    ///
    /// # Errors
    ///
    /// Same as [`StaleCache::get_or_set`].
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        ctx: &CancellationToken,
        key: &str,
        ttl: Duration,
        stale_ttl: Duration,
        fetch: F,
    ) -> ResilienceResult<Cached<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ResilienceResult<V, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        if let Some(hit) = self.get_fresh(key) {
            self.metrics.record_hit();
            self.sink.record(&ResilienceEvent::CacheHit { key: key.to_string() });
            return Ok(hit);
        }
        self.metrics.record_miss();
        self.sink.record(&ResilienceEvent::CacheMiss { key: key.to_string() });

        let _slot = match &self.flights {
            Some(flights) => {
                let claim = FlightClaim::join(flights, key);
                let guard = tokio::select! {
                    biased;
                    () = ctx.cancelled() => return Err(ResilienceError::Cancelled),
                    guard = Arc::clone(&claim.slot).lock_owned() => guard,
                };
                let fetch_slot = FetchSlot { _guard: guard, _claim: claim };
                // another caller may have refreshed the key while we waited
                if let Some(hit) = self.get_fresh(key) {
                    debug!(key, "coalesced miss answered by concurrent fetch");
                    return Ok(hit);
                }
                Some(fetch_slot)
            }
            None => None,
        };

        match fetch().await {
            Ok(value) => {
                self.store(key, value.clone(), ttl, stale_ttl);
                Ok(Cached { value, origin: Origin::Fetched, age: Duration::ZERO })
            }
            Err(ResilienceError::Cancelled) => Err(ResilienceError::Cancelled),
            Err(error) => match self.stale_fallback(key, stale_ttl) {
                Some(stale) => {
                    warn!(
                        key,
                        age_ms = stale.age.as_millis() as u64,
                        error = %error,
                        "fetch failed, serving stale value"
                    );
                    self.metrics.record_stale_served();
                    let age = stale.age;
                    self.sink.record(&ResilienceEvent::StaleServed { key: key.to_string(), age });
                    Ok(stale)
                }
                None => {
                    self.metrics.record_fetch_failure();
                    Err(error)
                }
            },
        }
    }

    /// Cached value if it is still fresh
    pub fn get_fresh(&self, key: &str) -> Option<Cached<V>> {
        let now = self.clock.now();
        let entries = self.entries.read();
        entries.get(key).filter(|e| e.is_fresh(now)).map(|e| e.to_cached(Origin::Fresh, now))
    }

    /// Cached value if it is fresh or inside its stale window, without
    /// touching statistics or the window
    pub fn peek(&self, key: &str) -> Option<Cached<V>> {
        let now = self.clock.now();
        let entries = self.entries.read();
        entries.get(key).and_then(|entry| {
            if entry.is_fresh(now) {
                Some(entry.to_cached(Origin::Fresh, now))
            } else if entry.is_usable(now) {
                Some(entry.to_cached(Origin::Stale, now))
            } else {
                None
            }
        })
    }

    /// Store `value` as of now
    pub fn insert(&self, key: impl Into<String>, value: V, ttl: Duration, stale_ttl: Duration) {
        let key = key.into();
        self.store(&key, value, ttl, stale_ttl);
    }

    /// Remove `key`; returns whether it was present
    pub fn invalidate(&self, key: &str) -> bool {
        let removed = self.entries.write().remove(key).is_some();
        if removed {
            self.metrics.record_invalidation();
            debug!(key, "cache entry invalidated");
        }
        removed
    }

    /// Drop every entry whose stale window has closed; returns how many
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_fresh(now) || entry.is_usable(now));
        let purged = before - entries.len();
        drop(entries);

        if purged > 0 {
            self.metrics.record_expirations(purged);
            debug!(purged, "purged expired cache entries");
        }
        purged
    }

    fn store(&self, key: &str, value: V, ttl: Duration, stale_ttl: Duration) {
        let now = self.clock.now();
        let mut entries = self.entries.write();
        let stored_at = entries.get(key).map_or(now, |existing| existing.stored_at.max(now));
        let stale_until = window_end(stored_at, ttl.max(stale_ttl));
        entries.insert(key.to_string(), CacheEntry { value, stored_at, ttl, stale_until });
        drop(entries);

        self.metrics.record_insert();
    }

    fn stale_fallback(&self, key: &str, stale_ttl: Duration) -> Option<Cached<V>> {
        let now = self.clock.now();
        let mut entries = self.entries.write();
        let entry = entries.get_mut(key).filter(|e| e.is_usable(now))?;
        // never shrinks; an unbounded end on either side stays unbounded
        entry.stale_until =
            entry.stale_until.zip(window_end(now, stale_ttl)).map(|(old, new)| old.max(new));
        Some(entry.to_cached(Origin::Stale, now))
    }
}
