//! Read-through TTL cache with request coalescing.
//!
//! [`TtlCache`] holds at most one entry (the last successfully fetched value and
//! the instant it was stored) plus at most one in-flight fetch. Callers go
//! through [`TtlCache::get_or_fetch`]:
//!
//! 1. a fresh entry is returned without touching the network;
//! 2. otherwise, if a fetch is already running, the caller awaits that fetch;
//! 3. otherwise the supplied fetcher runs once and every caller that arrives
//!    before it settles shares its result.
//!
//! A failed fetch reaches every attached caller and leaves the previous entry
//! in place. The in-flight marker is cleared whether the fetch succeeds or not.
//!
//! The cache imposes no timeout of its own. A fetcher that never resolves
//! keeps every attached caller pending, so fetchers should bound their own I/O.

use std::error::Error as StdError;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::time::Instant;
use tracing::debug;

/// Default time an entry stays fresh.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Error returned to every caller attached to a failed fetch.
///
/// Cloneable so one failure can be handed to many callers; the fetcher's
/// original error is available through [`std::error::Error::source`].
#[derive(Clone)]
pub struct FetchError(Arc<dyn StdError + Send + Sync>);

impl FetchError {
    fn new(err: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self(Arc::from(err.into()))
    }

    /// Returns the fetcher's original error.
    pub fn inner(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.0
    }
}

impl fmt::Debug for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FetchError").field(&self.0).finish()
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fetch failed: {}", self.0)
    }
}

impl StdError for FetchError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&*self.0)
    }
}

/// A stored value and the instant it was written.
#[derive(Debug)]
pub struct CacheEntry<T> {
    data: Arc<T>,
    stored_at: Instant,
}

impl<T> CacheEntry<T> {
    fn new(data: Arc<T>) -> Self {
        Self {
            data,
            stored_at: Instant::now(),
        }
    }

    /// The cached value.
    pub fn data(&self) -> &Arc<T> {
        &self.data
    }

    /// When the value was stored.
    pub fn stored_at(&self) -> Instant {
        self.stored_at
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        !ttl.is_zero() && self.stored_at.elapsed() <= ttl
    }
}

type InFlight<T> = Shared<BoxFuture<'static, Result<Arc<T>, FetchError>>>;

struct State<T> {
    entry: Option<CacheEntry<T>>,
    in_flight: Option<InFlight<T>>,
}

struct Inner<T> {
    ttl: Duration,
    state: Mutex<State<T>>,
}

impl<T> Inner<T> {
    // The lock guards plain data and is never held across an await point, so
    // a poisoned lock still holds a consistent state.
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Single-entry read-through cache with a time-to-live and request coalescing.
///
/// Cloning is cheap and every clone shares the same entry, so one instance can
/// be created at startup and handed to each route that needs it.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use swapgate::cache::TtlCache;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let cache: TtlCache<Vec<&str>> = TtlCache::new(Duration::from_secs(60));
///
/// let tickers = cache
///     .get_or_fetch(|| async { Ok::<_, std::io::Error>(vec!["USDC", "WETH"]) })
///     .await
///     .unwrap();
/// assert_eq!(*tickers, vec!["USDC", "WETH"]);
///
/// // Fresh: the fetcher is not called again.
/// let again = cache
///     .get_or_fetch(|| async { Err::<Vec<&str>, _>(std::io::Error::other("unreachable")) })
///     .await
///     .unwrap();
/// assert!(std::sync::Arc::ptr_eq(&tickers, &again));
/// # }
/// ```
pub struct TtlCache<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for TtlCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for TtlCache<T> {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl<T> fmt::Debug for TtlCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("TtlCache")
            .field("ttl", &self.inner.ttl)
            .field("has_entry", &state.entry.is_some())
            .field("fetch_in_flight", &state.in_flight.is_some())
            .finish()
    }
}

impl<T> TtlCache<T> {
    /// Creates an empty cache. A zero `ttl` disables caching: every
    /// read-through call after the first fetches again.
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                ttl,
                state: Mutex::new(State {
                    entry: None,
                    in_flight: None,
                }),
            }),
        }
    }

    /// The configured time-to-live.
    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// Returns the entry if it is still fresh, without ever fetching.
    pub fn peek(&self) -> Option<Arc<T>> {
        self.fresh(&self.inner.lock())
    }

    fn fresh(&self, state: &State<T>) -> Option<Arc<T>> {
        state
            .entry
            .as_ref()
            .filter(|entry| entry.is_fresh(self.inner.ttl))
            .map(|entry| Arc::clone(&entry.data))
    }

    /// Replaces the entry and restarts its TTL, bypassing the fetch path.
    pub fn set(&self, data: T) -> Arc<T> {
        let data = Arc::new(data);
        self.inner.lock().entry = Some(CacheEntry::new(Arc::clone(&data)));
        debug!("cache entry seeded directly");
        data
    }

    /// Discards the entry so the next read-through call is a miss.
    ///
    /// A fetch that is already running is not cancelled; its result is still
    /// stored when it settles.
    pub fn clear(&self) {
        self.inner.lock().entry = None;
        debug!("cache entry cleared");
    }

    /// Returns `true` while a fetch is outstanding.
    pub fn is_fetching(&self) -> bool {
        self.inner.lock().in_flight.is_some()
    }
}

impl<T> TtlCache<T>
where
    T: Send + Sync + 'static,
{
    /// Returns the fresh entry, or joins/starts the single fetch for it.
    ///
    /// `fetcher` is invoked only when no fetch is running, and never while
    /// the cache's lock is held, so it may itself call [`peek`](Self::peek),
    /// [`set`](Self::set) or [`is_fetching`](Self::is_fetching). If another
    /// caller starts a fetch or stores an entry in the meantime, the future
    /// `fetcher` returned is dropped without being polled.
    ///
    /// The fetch is owned by the cache rather than the caller: if every
    /// waiting caller is dropped, the next caller resumes the same fetch
    /// instead of starting another one.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] wrapping the fetcher's error. Every caller
    /// attached to the failed fetch receives a clone of the same error, and
    /// the previous entry (if any) stays cached.
    pub async fn get_or_fetch<F, Fut, E>(&self, fetcher: F) -> Result<Arc<T>, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        let running = {
            let state = self.inner.lock();
            if let Some(data) = self.fresh(&state) {
                return Ok(data);
            }
            state.in_flight.clone()
        };
        if let Some(in_flight) = running {
            debug!("cache miss, joining in-flight fetch");
            return in_flight.await;
        }

        let fetch = self.start_fetch(fetcher());

        let pending = {
            let mut state = self.inner.lock();
            if let Some(data) = self.fresh(&state) {
                debug!("entry stored while fetch was being prepared");
                return Ok(data);
            }
            match state.in_flight.clone() {
                Some(in_flight) => {
                    debug!("cache miss, another caller started the fetch first");
                    drop(fetch);
                    in_flight
                }
                None => {
                    debug!("cache miss, starting fetch");
                    state.in_flight = Some(fetch.clone());
                    fetch
                }
            }
        };

        pending.await
    }

    // Wraps the fetcher's future so that settling it updates the cache exactly
    // once, no matter how many callers are awaiting it.
    fn start_fetch<Fut, E>(&self, fut: Fut) -> InFlight<T>
    where
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        let inner = Arc::clone(&self.inner);
        async move {
            let result = fut.await.map(Arc::new).map_err(FetchError::new);

            let mut state = inner.lock();
            state.in_flight = None;
            match &result {
                Ok(data) => {
                    state.entry = Some(CacheEntry::new(Arc::clone(data)));
                    debug!("fetch settled, entry stored");
                }
                Err(e) => debug!(error = %e, "fetch failed, entry left untouched"),
            }
            result
        }
        .boxed()
        .shared()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    struct Ticker {
        symbol: &'static str,
        price: f64,
    }

    fn usdc() -> Vec<Ticker> {
        vec![Ticker {
            symbol: "USDC",
            price: 1.0,
        }]
    }

    // A fetcher that counts the fetches actually run and resolves after `delay`.
    fn counted(
        calls: &Arc<AtomicUsize>,
        delay: Duration,
        result: Result<Vec<Ticker>, &'static str>,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<Vec<Ticker>, io::Error>> + use<> {
        let calls = Arc::clone(calls);
        move || {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                result.map_err(io::Error::other)
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_misses_share_one_fetch() {
        let cache = TtlCache::new(Duration::from_millis(5000));
        let calls = Arc::new(AtomicUsize::new(0));
        let delay = Duration::from_millis(50);
        let start = Instant::now();

        let (a, b, c) = tokio::join!(
            cache.get_or_fetch(counted(&calls, delay, Ok(usdc()))),
            cache.get_or_fetch(counted(&calls, delay, Ok(usdc()))),
            cache.get_or_fetch(counted(&calls, delay, Ok(usdc()))),
        );

        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&a, &b) && Arc::ptr_eq(&b, &c));
        assert_eq!(*a, usdc());
        assert!(start.elapsed() >= delay && start.elapsed() < delay * 2);
        assert!(!cache.is_fetching());
    }

    #[tokio::test(start_paused = true)]
    async fn coalesces_across_spawned_tasks() {
        let cache = TtlCache::new(DEFAULT_TTL);
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let fetcher = counted(&calls, Duration::from_millis(50), Ok(usdc()));
                tokio::spawn(async move { cache.get_or_fetch(fetcher).await })
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test(start_paused = true)]
    async fn entry_is_fresh_until_ttl_elapses() {
        let ttl = Duration::from_millis(5000);
        let cache = TtlCache::new(ttl);
        let calls = Arc::new(AtomicUsize::new(0));

        cache
            .get_or_fetch(counted(&calls, Duration::ZERO, Ok(usdc())))
            .await
            .unwrap();

        tokio::time::advance(ttl - Duration::from_millis(1)).await;
        cache
            .get_or_fetch(counted(&calls, Duration::ZERO, Ok(usdc())))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(2)).await;
        cache
            .get_or_fetch(counted(&calls, Duration::ZERO, Ok(usdc())))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_ttl_always_fetches() {
        let cache = TtlCache::new(Duration::ZERO);
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            cache
                .get_or_fetch(counted(&calls, Duration::ZERO, Ok(usdc())))
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(cache.peek().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failure_reaches_all_callers_and_keeps_stale_entry() {
        let ttl = Duration::from_millis(100);
        let cache = TtlCache::new(ttl);
        let calls = Arc::new(AtomicUsize::new(0));

        let first = cache
            .get_or_fetch(counted(&calls, Duration::ZERO, Ok(usdc())))
            .await
            .unwrap();
        tokio::time::advance(ttl * 2).await;

        let delay = Duration::from_millis(10);
        let (a, b) = tokio::join!(
            cache.get_or_fetch(counted(&calls, delay, Err("rate limited"))),
            cache.get_or_fetch(counted(&calls, delay, Err("rate limited"))),
        );
        let (a, b) = (a.unwrap_err(), b.unwrap_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(a.inner().to_string(), "rate limited");
        assert_eq!(b.to_string(), "fetch failed: rate limited");
        assert!(!cache.is_fetching());

        // The stale entry survived the failed refresh.
        let state = cache.inner.lock();
        let entry = state.entry.as_ref().unwrap();
        assert!(Arc::ptr_eq(entry.data(), &first));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_then_retry_fetches_once_more() {
        let cache: TtlCache<Vec<Ticker>> = TtlCache::default();
        let calls = Arc::new(AtomicUsize::new(0));

        assert!(
            cache
                .get_or_fetch(counted(&calls, Duration::ZERO, Err("boom")))
                .await
                .is_err()
        );
        assert!(cache.peek().is_none());

        let data = cache
            .get_or_fetch(counted(&calls, Duration::ZERO, Ok(usdc())))
            .await
            .unwrap();
        assert_eq!(*data, usdc());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_forces_a_fetch_within_ttl() {
        let cache = TtlCache::new(DEFAULT_TTL);
        let calls = Arc::new(AtomicUsize::new(0));

        cache
            .get_or_fetch(counted(&calls, Duration::ZERO, Ok(usdc())))
            .await
            .unwrap();
        cache.clear();
        assert!(cache.peek().is_none());

        cache
            .get_or_fetch(counted(&calls, Duration::ZERO, Ok(usdc())))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_does_not_cancel_running_fetch() {
        let cache = TtlCache::new(DEFAULT_TTL);
        let calls = Arc::new(AtomicUsize::new(0));

        let running = tokio::spawn({
            let cache = cache.clone();
            let fetcher = counted(&calls, Duration::from_millis(50), Ok(usdc()));
            async move { cache.get_or_fetch(fetcher).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(cache.is_fetching());

        cache.clear();
        running.await.unwrap().unwrap();
        assert_eq!(cache.peek().as_deref(), Some(&usdc()));
    }

    #[tokio::test(start_paused = true)]
    async fn set_seeds_entry_without_fetching() {
        let cache = TtlCache::new(DEFAULT_TTL);
        let calls = Arc::new(AtomicUsize::new(0));

        let seeded = cache.set(usdc());
        let got = cache
            .get_or_fetch(counted(&calls, Duration::ZERO, Err("unreachable")))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&seeded, &got));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn peek_never_fetches_and_honours_ttl() {
        let ttl = Duration::from_secs(1);
        let cache = TtlCache::new(ttl);
        assert!(cache.peek().is_none());

        cache.set(usdc());
        assert_eq!(cache.peek().as_deref(), Some(&usdc()));

        tokio::time::advance(ttl + Duration::from_millis(1)).await;
        assert!(cache.peek().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_fetch_is_resumed_by_next_caller() {
        let cache = TtlCache::new(DEFAULT_TTL);
        let calls = Arc::new(AtomicUsize::new(0));

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            cache.get_or_fetch(counted(&calls, Duration::from_millis(50), Ok(usdc()))),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(cache.is_fetching());

        let data = cache
            .get_or_fetch(counted(&calls, Duration::ZERO, Err("should not run")))
            .await
            .unwrap();
        assert_eq!(*data, usdc());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fetcher_can_inspect_the_cache_it_fills() {
        let cache: TtlCache<Vec<Ticker>> = TtlCache::new(DEFAULT_TTL);
        let observer = cache.clone();

        let data = cache
            .get_or_fetch(move || {
                assert!(observer.peek().is_none());
                assert!(!observer.is_fetching());
                assert!(format!("{observer:?}").contains("fetch_in_flight: false"));
                async { Ok::<_, io::Error>(usdc()) }
            })
            .await
            .unwrap();

        assert_eq!(*data, usdc());
        assert!(!cache.is_fetching());
    }

    #[tokio::test(start_paused = true)]
    async fn entry_stored_by_fetcher_wins_over_its_future() {
        let cache: TtlCache<Vec<Ticker>> = TtlCache::new(DEFAULT_TTL);
        let calls = Arc::new(AtomicUsize::new(0));
        let observer = cache.clone();
        let fetcher = counted(&calls, Duration::ZERO, Err("never polled"));

        let data = cache
            .get_or_fetch(move || {
                observer.set(usdc());
                fetcher()
            })
            .await
            .unwrap();

        assert_eq!(*data, usdc());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!cache.is_fetching());
    }
}
