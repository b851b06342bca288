//! Keyed cache bucket with LRU or TTL eviction and single-flight population.
//!
//! A miss starts exactly one population future per key; concurrent callers
//! for the same key await a shared handle to it. Only successful results are
//! stored. The bucket lock covers map bookkeeping only and is never held
//! while a population future runs.
//!
//! The population runs on the callers' polls. If the caller that started it
//! is dropped first, the population is withdrawn from the in-flight map:
//! callers already waiting still receive its result, nothing is stored, and
//! the next miss starts a fresh population.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use metrics::counter;
use tokio::time::Instant;
use tracing::debug;

use super::lock::{LockSite, mutex_lock};

const SOURCE: &str = "cache::bucket";

pub(crate) const METRIC_CACHE_HIT: &str = "i8gate_cache_hit_total";
pub(crate) const METRIC_CACHE_MISS: &str = "i8gate_cache_miss_total";
pub(crate) const METRIC_CACHE_EVICT: &str = "i8gate_cache_evict_total";
pub(crate) const METRIC_CACHE_EXPIRED: &str = "i8gate_cache_expired_total";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Evict the least-recently accessed entry once `capacity` is exceeded.
    Lru { capacity: NonZeroUsize },
    /// Entries expire `ttl` after insertion; over capacity, the oldest
    /// inserted entry goes first regardless of access.
    Ttl {
        capacity: NonZeroUsize,
        ttl: Duration,
    },
}

impl EvictionPolicy {
    pub fn capacity(&self) -> NonZeroUsize {
        match self {
            EvictionPolicy::Lru { capacity } | EvictionPolicy::Ttl { capacity, .. } => *capacity,
        }
    }

    fn ttl(&self) -> Option<Duration> {
        match self {
            EvictionPolicy::Lru { .. } => None,
            EvictionPolicy::Ttl { ttl, .. } => Some(*ttl),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub created_at: Instant,
    pub last_access: Instant,
}

type Flight<V, E> = Shared<BoxFuture<'static, Result<V, E>>>;

struct InFlight<V, E> {
    id: u64,
    flight: Flight<V, E>,
}

struct Slots<K, V, E> {
    entries: LruCache<K, CacheEntry<V>>,
    in_flight: HashMap<K, InFlight<V, E>>,
    next_flight_id: u64,
}

/// Held by the caller that started a population until it settles.
struct FlightOwner<'a, K: Hash + Eq, V, E> {
    slots: &'a Mutex<Slots<K, V, E>>,
    bucket: &'static str,
    key: Option<K>,
    id: u64,
}

impl<K: Hash + Eq, V, E> FlightOwner<'_, K, V, E> {
    fn disarm(mut self) {
        self.key = None;
    }
}

impl<K: Hash + Eq, V, E> Drop for FlightOwner<'_, K, V, E> {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        let mut slots = mutex_lock(self.slots, LockSite::new(SOURCE, self.bucket, "withdraw"));
        if slots
            .in_flight
            .get(&key)
            .is_some_and(|pending| pending.id == self.id)
        {
            slots.in_flight.remove(&key);
            debug!(bucket = self.bucket, "Withdrew population abandoned by its caller");
        }
    }
}

pub struct CacheBucket<K, V, E> {
    name: &'static str,
    ttl: Option<Duration>,
    slots: Mutex<Slots<K, V, E>>,
}

impl<K, V, E> CacheBucket<K, V, E>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Create a bucket; `name` labels its log lines and metrics.
    pub fn new(name: &'static str, policy: EvictionPolicy) -> Self {
        Self {
            name,
            ttl: policy.ttl(),
            slots: Mutex::new(Slots {
                entries: LruCache::new(policy.capacity()),
                in_flight: HashMap::new(),
                next_flight_id: 0,
            }),
        }
    }

    pub fn lru(name: &'static str, capacity: NonZeroUsize) -> Self {
        Self::new(name, EvictionPolicy::Lru { capacity })
    }

    pub fn ttl(name: &'static str, capacity: NonZeroUsize, ttl: Duration) -> Self {
        Self::new(name, EvictionPolicy::Ttl { capacity, ttl })
    }

    /// Return the cached value for `key`, or populate it.
    ///
    /// `populate` is called at most once per miss episode and should only
    /// build its future; the work happens when the future is awaited. An
    /// `Err` is handed to every caller waiting on that population and is
    /// never stored, so the next access populates again.
    pub async fn get_or_populate<F, Fut>(&self, key: K, populate: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let (flight_id, flight, owner) = {
            let mut guard = self.lock_slots("get_or_populate");
            let slots = &mut *guard;
            if let Some(value) = self.lookup(slots, &key) {
                counter!(METRIC_CACHE_HIT, "bucket" => self.name).increment(1);
                return Ok(value);
            }

            match slots.in_flight.get(&key) {
                Some(pending) => {
                    debug!(bucket = self.name, "Joining in-flight population");
                    (pending.id, pending.flight.clone(), None)
                }
                None => {
                    counter!(METRIC_CACHE_MISS, "bucket" => self.name).increment(1);
                    let id = slots.next_flight_id;
                    slots.next_flight_id = id.wrapping_add(1);
                    let flight = populate().boxed().shared();
                    slots.in_flight.insert(
                        key.clone(),
                        InFlight {
                            id,
                            flight: flight.clone(),
                        },
                    );
                    let owner = FlightOwner {
                        slots: &self.slots,
                        bucket: self.name,
                        key: Some(key.clone()),
                        id,
                    };
                    (id, flight, Some(owner))
                }
            }
        };

        let result = flight.await;
        self.settle(key, flight_id, &result);
        if let Some(owner) = owner {
            owner.disarm();
        }
        result
    }

    /// Resize the bucket, evicting entries if it shrinks.
    pub fn set_capacity(&self, capacity: NonZeroUsize) {
        let mut slots = self.lock_slots("set_capacity");
        if slots.entries.cap() == capacity {
            return;
        }
        let before = slots.entries.len();
        slots.entries.resize(capacity);
        let evicted = before - slots.entries.len();
        if evicted > 0 {
            counter!(METRIC_CACHE_EVICT, "bucket" => self.name).increment(evicted as u64);
            debug!(
                bucket = self.name,
                evicted,
                capacity = capacity.get(),
                "Bucket shrunk"
            );
        }
    }

    pub fn capacity(&self) -> NonZeroUsize {
        self.lock_slots("capacity").entries.cap()
    }

    /// Number of stored entries, including expired ones not yet reclaimed.
    pub fn len(&self) -> usize {
        self.lock_slots("len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` holds a live entry. Does not touch recency.
    pub fn contains(&self, key: &K) -> bool {
        let slots = self.lock_slots("contains");
        match (slots.entries.peek(key), self.ttl) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(entry), Some(ttl)) => Instant::now().duration_since(entry.created_at) < ttl,
        }
    }

    fn lock_slots(&self, op: &'static str) -> MutexGuard<'_, Slots<K, V, E>> {
        mutex_lock(&self.slots, LockSite::new(SOURCE, self.name, op))
    }

    fn lookup(&self, slots: &mut Slots<K, V, E>, key: &K) -> Option<V> {
        let now = Instant::now();
        let Some(ttl) = self.ttl else {
            let entry = slots.entries.get_mut(key)?;
            entry.last_access = now;
            return Some(entry.value.clone());
        };

        let entry = slots.entries.peek_mut(key)?;
        if now.duration_since(entry.created_at) < ttl {
            entry.last_access = now;
            return Some(entry.value.clone());
        }

        slots.entries.pop(key);
        counter!(METRIC_CACHE_EXPIRED, "bucket" => self.name).increment(1);
        None
    }

    fn settle(&self, key: K, flight_id: u64, result: &Result<V, E>) {
        let mut guard = self.lock_slots("settle");
        let slots = &mut *guard;
        let owned = slots
            .in_flight
            .get(&key)
            .is_some_and(|pending| pending.id == flight_id);
        if !owned {
            return;
        }
        slots.in_flight.remove(&key);

        let Ok(value) = result else {
            return;
        };

        let now = Instant::now();
        // Re-inserting must land at the newest position for insertion-order eviction.
        slots.entries.pop(&key);
        let entry = CacheEntry {
            value: value.clone(),
            created_at: now,
            last_access: now,
        };
        if slots.entries.push(key, entry).is_some() {
            counter!(METRIC_CACHE_EVICT, "bucket" => self.name).increment(1);
            debug!(bucket = self.name, "Evicted entry over capacity");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::future::join_all;
    use tokio::sync::oneshot;

    use super::*;

    type Bucket = CacheBucket<&'static str, u32, String>;

    fn cap(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).expect("non-zero")
    }

    async fn fill(bucket: &Bucket, key: &'static str, value: u32) {
        let stored = bucket
            .get_or_populate(key, || async move { Ok(value) })
            .await
            .expect("populate succeeds");
        assert_eq!(stored, value);
    }

    async fn cached(bucket: &Bucket, key: &'static str) -> Option<u32> {
        bucket
            .get_or_populate(key, || async { Err("miss".to_string()) })
            .await
            .ok()
    }

    #[tokio::test]
    async fn lru_evicts_least_recently_accessed() {
        let bucket = Bucket::lru("test", cap(2));
        fill(&bucket, "a", 1).await;
        fill(&bucket, "b", 2).await;

        // Touch `a` so `b` becomes the eviction candidate.
        assert_eq!(cached(&bucket, "a").await, Some(1));
        fill(&bucket, "c", 3).await;

        assert!(bucket.contains(&"a"));
        assert!(!bucket.contains(&"b"));
        assert!(bucket.contains(&"c"));
        assert_eq!(bucket.len(), 2);
    }

    #[tokio::test]
    async fn ttl_evicts_oldest_inserted_regardless_of_access() {
        let bucket = Bucket::ttl("test", cap(2), Duration::from_secs(60));
        fill(&bucket, "a", 1).await;
        fill(&bucket, "b", 2).await;

        assert_eq!(cached(&bucket, "a").await, Some(1));
        fill(&bucket, "c", 3).await;

        assert!(!bucket.contains(&"a"));
        assert!(bucket.contains(&"b"));
        assert!(bucket.contains(&"c"));
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_entry_lives_until_ttl_elapses() {
        let bucket = Bucket::ttl("test", cap(4), Duration::from_secs(60));
        fill(&bucket, "a", 1).await;

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(cached(&bucket, "a").await, Some(1));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cached(&bucket, "a").await, None);
        assert!(bucket.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_is_measured_from_creation_not_access() {
        let bucket = Bucket::ttl("test", cap(4), Duration::from_secs(10));
        fill(&bucket, "a", 1).await;

        for _ in 0..9 {
            tokio::time::advance(Duration::from_secs(1)).await;
            assert_eq!(cached(&bucket, "a").await, Some(1));
        }
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cached(&bucket, "a").await, None);
    }

    #[tokio::test]
    async fn failed_population_is_not_cached() {
        let bucket = Bucket::ttl("test", cap(4), Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        for attempt in 1..=2 {
            let counter = Arc::clone(&calls);
            let result = bucket
                .get_or_populate("a", move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<u32, _>("upstream down".to_string())
                })
                .await;
            assert_eq!(result, Err("upstream down".to_string()));
            assert_eq!(calls.load(Ordering::SeqCst), attempt);
        }
        assert!(bucket.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_misses_share_one_population() {
        let bucket = Bucket::ttl("test", cap(4), Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        let lookups = (0..8).map(|_| {
            let counter = Arc::clone(&calls);
            bucket.get_or_populate("a", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(42)
            })
        });

        let results = join_all(lookups).await;
        assert!(results.iter().all(|r| r == &Ok(42)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bucket.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_failure_is_shared_then_retried() {
        let bucket = Bucket::ttl("test", cap(4), Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        let failing = |calls: Arc<AtomicUsize>| {
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Err::<u32, _>("denied".to_string())
            }
        };

        let results =
            join_all((0..4).map(|_| bucket.get_or_populate("a", failing(calls.clone())))).await;
        assert!(results.iter().all(Result::is_err));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let _ = bucket.get_or_populate("a", failing(calls.clone())).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn slow_population_does_not_block_other_keys() {
        let bucket = Arc::new(Bucket::ttl("test", cap(4), Duration::from_secs(60)));
        let (release, gate) = oneshot::channel::<()>();

        let slow = {
            let bucket = Arc::clone(&bucket);
            tokio::spawn(async move {
                bucket
                    .get_or_populate("slow", move || async move {
                        let _ = gate.await;
                        Ok(1)
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        fill(&bucket, "fast", 2).await;
        assert!(bucket.contains(&"fast"));
        assert!(!slow.is_finished());

        release.send(()).expect("slow population still waiting");
        assert_eq!(slow.await.expect("task joins"), Ok(1));
        assert!(bucket.contains(&"slow"));
    }

    #[tokio::test]
    async fn shrinking_capacity_evicts_entries() {
        let bucket = Bucket::lru("test", cap(3));
        fill(&bucket, "a", 1).await;
        fill(&bucket, "b", 2).await;
        fill(&bucket, "c", 3).await;

        bucket.set_capacity(cap(1));
        assert_eq!(bucket.capacity().get(), 1);
        assert_eq!(bucket.len(), 1);
        assert!(bucket.contains(&"c"));
    }

    fn in_flight_len(bucket: &Bucket) -> usize {
        bucket.lock_slots("test").in_flight.len()
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_population_is_not_replayed() {
        let bucket = Bucket::ttl("resources", cap(4), Duration::from_secs(60));
        let calls = AtomicUsize::new(0);

        let first = tokio::time::timeout(
            Duration::from_millis(10),
            bucket.get_or_populate("k", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(1)
                }
            }),
        )
        .await;
        assert!(first.is_err());
        assert_eq!(in_flight_len(&bucket), 0);

        tokio::time::advance(Duration::from_secs(3600)).await;

        let later = bucket
            .get_or_populate("k", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("revoked".to_string()) }
            })
            .await;
        assert_eq!(later, Err("revoked".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!bucket.contains(&"k"));
        assert_eq!(in_flight_len(&bucket), 0);
    }

    #[tokio::test]
    async fn waiter_outlives_dropped_owner_without_storing() {
        let bucket = Bucket::lru("sites", cap(4));
        let (release, gate) = oneshot::channel::<()>();

        let mut owner = Box::pin(bucket.get_or_populate("k", || async move {
            match gate.await {
                Ok(()) => Ok(7),
                Err(err) => Err(err.to_string()),
            }
        }));
        assert!(futures::poll!(owner.as_mut()).is_pending());

        let mut waiter = Box::pin(
            bucket.get_or_populate("k", || async { Err("not started".to_string()) }),
        );
        assert!(futures::poll!(waiter.as_mut()).is_pending());

        drop(owner);
        assert_eq!(in_flight_len(&bucket), 0);

        release.send(()).expect("population still waiting");
        assert_eq!(waiter.await, Ok(7));
        assert!(!bucket.contains(&"k"));

        fill(&bucket, "k", 9).await;
        assert_eq!(cached(&bucket, "k").await, Some(9));
    }
}
