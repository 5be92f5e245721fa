//! Two-tier query cache with single-flight computation
//!
//! Lookups go memory (moka, per-entry expiry) → durable store (SQLite) →
//! compute. Concurrent misses on one fingerprint share a single computation:
//! the first caller spawns it, later callers await the same shared future.
//! The computation runs as its own task, so a caller that gives up does not
//! cancel the work other callers are waiting on.
//!
//! Invalidation bumps a generation counter. A computation that started before
//! an invalidation still answers its callers but is not written back.

use super::{
    CacheEntry, DurableStore, EntryOptions, Fingerprint, FingerprintPattern, SqliteStore,
    StoreOptions,
};
use crate::error::{CacheError, DegradedState, QueryError};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use moka::future::Cache;
use moka::Expiry;
use serde::Serialize;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

type SharedOutcome = Shared<BoxFuture<'static, Result<Arc<CacheEntry>, QueryError>>>;

/// A computation in progress for one fingerprint
struct Flight {
    id: u64,
    outcome: SharedOutcome,
}

/// Releases the in-flight slot when the computation ends, however it ends
struct FlightGuard<'a> {
    inflight: &'a DashMap<Fingerprint, Flight>,
    fingerprint: Fingerprint,
    id: u64,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.inflight
            .remove_if(&self.fingerprint, |_, flight| flight.id == self.id);
    }
}

/// Memory tier expiry follows each entry's own `expires_at`
struct EntryExpiry;

impl Expiry<Fingerprint, Arc<CacheEntry>> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &Fingerprint,
        value: &Arc<CacheEntry>,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.remaining_ttl(Utc::now()))
    }

    fn expire_after_update(
        &self,
        _key: &Fingerprint,
        value: &Arc<CacheEntry>,
        _updated_at: std::time::Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.remaining_ttl(Utc::now()))
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    computations: AtomicU64,
    write_failures: AtomicU64,
}

struct Inner {
    memory: Cache<Fingerprint, Arc<CacheEntry>>,
    durable: Option<Arc<dyn DurableStore>>,
    degraded: DegradedState,
    inflight: DashMap<Fingerprint, Flight>,
    next_flight: AtomicU64,
    generation: AtomicU64,
    counters: Counters,
}

/// Point-in-time view of the cache, served by the health endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStatus {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_reason: Option<String>,
    pub memory_entries: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub durable_entries: Option<usize>,
    pub in_flight: usize,
    pub hits: u64,
    pub misses: u64,
    pub computations: u64,
    pub write_failures: u64,
}

/// Query cache shared by every request handler (cheap to clone)
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<Inner>,
}

impl QueryCache {
    /// Cache backed by `store`
    pub fn with_store(store: Arc<dyn DurableStore>, memory_capacity: u64) -> Self {
        Self::build(Some(store), DegradedState::Healthy, memory_capacity)
    }

    /// Cache without a durable tier; entries are lost on restart
    pub fn memory_only(memory_capacity: u64, reason: impl Into<String>) -> Self {
        Self::build(
            None,
            DegradedState::MemoryOnly {
                reason: reason.into(),
            },
            memory_capacity,
        )
    }

    /// Open the SQLite store in `cache_dir`, degrading to memory only if it
    /// cannot be opened
    pub fn open(cache_dir: &Path, options: StoreOptions, memory_capacity: u64) -> Self {
        match SqliteStore::open(cache_dir, options) {
            Ok(store) => Self::with_store(Arc::new(store), memory_capacity),
            Err(e) => {
                warn!(
                    path = %cache_dir.display(),
                    error = %e,
                    "Durable cache unavailable, continuing with memory cache only"
                );
                Self::memory_only(memory_capacity, e.to_string())
            }
        }
    }

    fn build(
        durable: Option<Arc<dyn DurableStore>>,
        degraded: DegradedState,
        memory_capacity: u64,
    ) -> Self {
        let memory = Cache::builder()
            .max_capacity(memory_capacity)
            .expire_after(EntryExpiry)
            .support_invalidation_closures()
            .build();

        Self {
            inner: Arc::new(Inner {
                memory,
                durable,
                degraded,
                inflight: DashMap::new(),
                next_flight: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                counters: Counters::default(),
            }),
        }
    }

    pub fn degraded_state(&self) -> &DegradedState {
        &self.inner.degraded
    }

    /// Fresh entry for `fingerprint`, if any
    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<CacheEntry>> {
        let entry = self.lookup(fingerprint, None).await;
        self.record_lookup(entry.is_some());
        entry
    }

    /// Cached entry, or the result of `compute` stored under `fingerprint`
    ///
    /// `compute` runs at most once per fingerprint at a time; every concurrent
    /// caller receives the same entry or the same error. Errors are never
    /// cached. Failing to persist the result only costs the caching.
    pub async fn get_or_compute<F, Fut>(
        &self,
        fingerprint: Fingerprint,
        options: EntryOptions,
        compute: F,
    ) -> Result<Arc<CacheEntry>, QueryError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<String, QueryError>> + Send + 'static,
    {
        if let Some(entry) = self.lookup(&fingerprint, options.source_stamp).await {
            self.record_lookup(true);
            return Ok(entry);
        }
        self.record_lookup(false);

        let outcome = match self.inner.inflight.entry(fingerprint.clone()) {
            Entry::Occupied(flight) => {
                debug!(fingerprint = %fingerprint, "Joining in-flight computation");
                flight.get().outcome.clone()
            }
            Entry::Vacant(slot) => {
                let id = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);
                let cache = self.clone();
                let task_fingerprint = fingerprint.clone();
                let handle = tokio::spawn(async move {
                    cache.run_flight(id, task_fingerprint, options, compute).await
                });

                let outcome = async move {
                    handle.await.unwrap_or_else(|e| {
                        Err(QueryError::internal(format!("Computation task failed: {}", e)))
                    })
                }
                .boxed()
                .shared();

                slot.insert(Flight {
                    id,
                    outcome: outcome.clone(),
                });
                outcome
            }
        };

        outcome.await
    }

    async fn run_flight<F, Fut>(
        self,
        id: u64,
        fingerprint: Fingerprint,
        options: EntryOptions,
        compute: F,
    ) -> Result<Arc<CacheEntry>, QueryError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, QueryError>>,
    {
        let _guard = FlightGuard {
            inflight: &self.inner.inflight,
            fingerprint: fingerprint.clone(),
            id,
        };

        let generation = self.inner.generation.load(Ordering::Acquire);

        // A previous flight may have finished between our lookup and this one
        if let Some(entry) = self.lookup(&fingerprint, options.source_stamp).await {
            return Ok(entry);
        }

        self.inner.counters.computations.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let payload = compute().await?;
        let entry = Arc::new(CacheEntry::new(fingerprint.clone(), payload, &options));

        debug!(
            fingerprint = %fingerprint,
            elapsed_ms = started.elapsed().as_millis() as u64,
            bytes = entry.payload.len(),
            "Computed query result"
        );

        self.publish(Arc::clone(&entry), generation).await;
        Ok(entry)
    }

    /// Write back to the durable tier first, then to memory
    async fn publish(&self, entry: Arc<CacheEntry>, generation: u64) {
        if self.is_stale(generation) {
            debug!(fingerprint = %entry.fingerprint, "Cache invalidated during computation, result not cached");
            return;
        }

        let stored = Arc::clone(&entry);
        if let Some(Err(e)) = self.with_durable(move |store| store.store(&stored)).await {
            self.inner.counters.write_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                fingerprint = %entry.fingerprint,
                error = %e,
                "Cache write-back failed, result served uncached"
            );
            return;
        }

        if self.is_stale(generation) {
            // Invalidated while persisting: undo the write
            let fingerprint = entry.fingerprint.clone();
            if let Some(Err(e)) = self.with_durable(move |store| store.remove(&fingerprint)).await {
                warn!(fingerprint = %entry.fingerprint, error = %e, "Failed to drop invalidated entry");
            }
            return;
        }

        self.insert_unless_stale(entry, generation).await;
    }

    /// Put an entry in the memory tier unless an invalidation came after
    /// `generation`.
    ///
    /// The check runs again after the insert: an invalidation that lands
    /// between check and insert has already swept memory, so the entry is
    /// removed here instead. A newer entry for the same fingerprint can be
    /// dropped along with it, which only costs a miss.
    async fn insert_unless_stale(&self, entry: Arc<CacheEntry>, generation: u64) {
        if self.is_stale(generation) {
            return;
        }
        let fingerprint = entry.fingerprint.clone();
        self.inner.memory.insert(fingerprint.clone(), entry).await;

        if self.is_stale(generation) {
            debug!(fingerprint = %fingerprint, "Cache invalidated during insert, entry dropped");
            self.inner.memory.invalidate(&fingerprint).await;
        }
    }

    async fn lookup(&self, fingerprint: &Fingerprint, stamp: Option<i64>) -> Option<Arc<CacheEntry>> {
        let now = Utc::now();
        if let Some(entry) = self.inner.memory.get(fingerprint).await {
            if entry.is_fresh(now, stamp) {
                return Some(entry);
            }
        }

        let generation = self.inner.generation.load(Ordering::Acquire);
        let key = fingerprint.clone();
        match self.with_durable(move |store| store.load(&key)).await? {
            Ok(Some(entry)) if entry.is_fresh(now, stamp) => {
                let entry = Arc::new(entry);
                self.insert_unless_stale(Arc::clone(&entry), generation).await;
                Some(entry)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(fingerprint = %fingerprint, error = %e, "Cache read failed, treating as miss");
                None
            }
        }
    }

    /// Drop one entry from both tiers
    pub async fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        self.bump_generation();
        let in_memory = self.inner.memory.contains_key(fingerprint);
        self.inner.memory.invalidate(fingerprint).await;

        let key = fingerprint.clone();
        let in_store = match self.with_durable(move |store| store.remove(&key)).await {
            Some(Ok(removed)) => removed,
            Some(Err(e)) => {
                warn!(fingerprint = %fingerprint, error = %e, "Failed to invalidate durable entry");
                false
            }
            None => false,
        };

        info!(fingerprint = %fingerprint, "Cache entry invalidated");
        in_memory || in_store
    }

    /// Drop every entry whose fingerprint matches `pattern`
    pub async fn invalidate_matching(&self, pattern: &FingerprintPattern) -> usize {
        if let Some(fingerprint) = pattern.exact() {
            return usize::from(self.invalidate(&fingerprint).await);
        }

        self.bump_generation();
        let in_memory = self
            .inner
            .memory
            .iter()
            .filter(|(key, _)| pattern.matches(key))
            .count();

        let predicate = pattern.clone();
        if let Err(e) = self
            .inner
            .memory
            .invalidate_entries_if(move |key, _| predicate.matches(key))
        {
            warn!(error = %e, "Selective invalidation unavailable, clearing memory cache");
            self.inner.memory.invalidate_all();
        }

        let store_pattern = pattern.clone();
        let removed = match self
            .with_durable(move |store| store.remove_matching(&store_pattern))
            .await
        {
            Some(Ok(removed)) => removed.max(in_memory),
            Some(Err(e)) => {
                warn!(pattern = pattern.as_str(), error = %e, "Failed to invalidate durable entries");
                in_memory
            }
            None => in_memory,
        };

        info!(pattern = pattern.as_str(), removed, "Cache entries invalidated");
        removed
    }

    /// Drop everything
    pub async fn invalidate_all(&self) -> usize {
        self.bump_generation();
        let in_memory = self.inner.memory.iter().count();
        self.inner.memory.invalidate_all();

        let removed = match self.with_durable(|store| store.clear()).await {
            Some(Ok(removed)) => removed.max(in_memory),
            Some(Err(e)) => {
                warn!(error = %e, "Failed to clear durable cache");
                in_memory
            }
            None => in_memory,
        };

        info!(removed, "Cache cleared");
        removed
    }

    /// Fingerprints with a computation currently running
    pub fn in_flight(&self) -> usize {
        self.inner.inflight.len()
    }

    pub async fn status(&self) -> CacheStatus {
        self.inner.memory.run_pending_tasks().await;

        let durable_entries = match self.with_durable(|store| store.stats()).await {
            Some(Ok(stats)) => Some(stats.total_entries),
            Some(Err(e)) => {
                warn!(error = %e, "Failed to read durable cache statistics");
                None
            }
            None => None,
        };

        let counters = &self.inner.counters;
        CacheStatus {
            healthy: self.inner.degraded.is_healthy(),
            degraded_reason: match &self.inner.degraded {
                DegradedState::Healthy => None,
                DegradedState::MemoryOnly { reason } => Some(reason.clone()),
            },
            memory_entries: self.inner.memory.entry_count(),
            durable_entries,
            in_flight: self.in_flight(),
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            computations: counters.computations.load(Ordering::Relaxed),
            write_failures: counters.write_failures.load(Ordering::Relaxed),
        }
    }

    /// Flush the durable tier
    pub async fn shutdown(&self) {
        self.inner.memory.run_pending_tasks().await;
        if let Some(Err(e)) = self.with_durable(|store| store.flush()).await {
            warn!(error = %e, "Failed to flush durable cache on shutdown");
        } else {
            debug!("Query cache flushed");
        }
    }

    fn record_lookup(&self, hit: bool) {
        let counter = if hit {
            &self.inner.counters.hits
        } else {
            &self.inner.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn bump_generation(&self) {
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn is_stale(&self, generation: u64) -> bool {
        self.inner.generation.load(Ordering::Acquire) != generation
    }

    /// Run a blocking durable-tier operation, `None` without a durable tier
    async fn with_durable<T, F>(&self, op: F) -> Option<Result<T, CacheError>>
    where
        F: FnOnce(&dyn DurableStore) -> Result<T, CacheError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.inner.durable.clone()?;
        let result = tokio::task::spawn_blocking(move || op(store.as_ref()))
            .await
            .unwrap_or_else(|e| {
                Err(CacheError::Task {
                    message: e.to_string(),
                })
            });
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FailingStore;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    fn options() -> EntryOptions {
        EntryOptions::ttl(Duration::from_secs(60))
    }

    fn sqlite_cache(dir: &Path) -> QueryCache {
        QueryCache::open(dir, StoreOptions::default(), 100)
    }

    fn counting(
        calls: &Arc<AtomicUsize>,
        payload: &'static str,
        delay: Duration,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<String, QueryError>> + Send + 'static {
        let calls = Arc::clone(calls);
        move || {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                Ok(payload.to_string())
            }
            .boxed()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_compute_once() {
        let dir = tempdir().unwrap();
        let cache = sqlite_cache(dir.path());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let compute = counting(&calls, r#"{"total_books":3}"#, Duration::from_millis(100));
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute(Fingerprint::statistics(), options(), compute)
                    .await
            }));
        }

        let mut entries = Vec::new();
        for handle in handles {
            entries.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for entry in &entries {
            assert_eq!(entry.payload, entries[0].payload);
            assert_eq!(entry.created_at, entries[0].created_at);
        }
        assert_eq!(cache.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_hit_after_compute() {
        let dir = tempdir().unwrap();
        let cache = sqlite_cache(dir.path());
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let entry = cache
                .get_or_compute(
                    Fingerprint::statistics(),
                    options(),
                    counting(&calls, "{}", Duration::ZERO),
                )
                .await
                .unwrap();
            assert_eq!(entry.payload, "{}");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let status = cache.status().await;
        assert_eq!(status.hits, 2);
        assert_eq!(status.misses, 1);
        assert_eq!(status.durable_entries, Some(1));
    }

    #[tokio::test]
    async fn test_invalidate_forces_recompute() {
        let dir = tempdir().unwrap();
        let cache = sqlite_cache(dir.path());
        let calls = Arc::new(AtomicUsize::new(0));
        let fp = Fingerprint::statistics();

        cache
            .get_or_compute(fp.clone(), options(), counting(&calls, "1", Duration::ZERO))
            .await
            .unwrap();
        assert!(cache.invalidate(&fp).await);
        assert!(cache.get(&fp).await.is_none());

        let entry = cache
            .get_or_compute(fp.clone(), options(), counting(&calls, "2", Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(entry.payload, "2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_matching() {
        let dir = tempdir().unwrap();
        let cache = sqlite_cache(dir.path());
        let calls = Arc::new(AtomicUsize::new(0));

        let dune = Fingerprint::from_pairs("search", [("title", "dune")]);
        let asimov = Fingerprint::from_pairs("search", [("author", "asimov")]);
        for fp in [&dune, &asimov, &Fingerprint::statistics()] {
            cache
                .get_or_compute(fp.clone(), options(), counting(&calls, "[]", Duration::ZERO))
                .await
                .unwrap();
        }

        let pattern = FingerprintPattern::parse("search*").unwrap();
        assert_eq!(cache.invalidate_matching(&pattern).await, 2);
        assert!(cache.get(&dune).await.is_none());
        assert!(cache.get(&asimov).await.is_none());
        assert!(cache.get(&Fingerprint::statistics()).await.is_some());
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let cache = QueryCache::memory_only(100, "test");
        let calls = Arc::new(AtomicUsize::new(0));
        let short = EntryOptions::ttl(Duration::from_millis(50));

        cache
            .get_or_compute(Fingerprint::statistics(), short, counting(&calls, "{}", Duration::ZERO))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(cache.get(&Fingerprint::statistics()).await.is_none());
        cache
            .get_or_compute(Fingerprint::statistics(), short, counting(&calls, "{}", Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_source_stamp_mismatch_recomputes() {
        let cache = QueryCache::memory_only(100, "test");
        let calls = Arc::new(AtomicUsize::new(0));
        let fp = Fingerprint::statistics();

        cache
            .get_or_compute(
                fp.clone(),
                options().with_source_stamp(Some(1)),
                counting(&calls, "old", Duration::ZERO),
            )
            .await
            .unwrap();
        let same = cache
            .get_or_compute(
                fp.clone(),
                options().with_source_stamp(Some(1)),
                counting(&calls, "unused", Duration::ZERO),
            )
            .await
            .unwrap();
        assert_eq!(same.payload, "old");

        let fresh = cache
            .get_or_compute(
                fp,
                options().with_source_stamp(Some(2)),
                counting(&calls, "new", Duration::ZERO),
            )
            .await
            .unwrap();
        assert_eq!(fresh.payload, "new");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_storage_failure_still_returns_result() {
        let cache = QueryCache::with_store(Arc::new(FailingStore), 100);
        let calls = Arc::new(AtomicUsize::new(0));

        let entry = cache
            .get_or_compute(Fingerprint::statistics(), options(), counting(&calls, "{}", Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(entry.payload, "{}");

        // Nothing was cached, so the next call computes again
        cache
            .get_or_compute(Fingerprint::statistics(), options(), counting(&calls, "{}", Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.status().await.write_failures, 2);
    }

    #[tokio::test]
    async fn test_failed_computation_releases_slot() {
        let cache = QueryCache::memory_only(100, "test");

        let err = cache
            .get_or_compute(Fingerprint::statistics(), options(), || async {
                Err(QueryError::SourceUnavailable {
                    message: "locked".into(),
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::SourceUnavailable { .. }));
        assert_eq!(cache.in_flight(), 0);
        assert!(cache.get(&Fingerprint::statistics()).await.is_none());

        let entry = cache
            .get_or_compute(Fingerprint::statistics(), options(), || async { Ok("{}".to_string()) })
            .await
            .unwrap();
        assert_eq!(entry.payload, "{}");
    }

    #[tokio::test]
    async fn test_panicking_computation_is_internal_error() {
        let cache = QueryCache::memory_only(100, "test");

        let err = cache
            .get_or_compute(Fingerprint::statistics(), options(), || async {
                if options().ttl > Duration::ZERO {
                    panic!("boom");
                }
                Ok(String::new())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Internal { .. }));
        assert_eq!(cache.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_caller_does_not_cancel_computation() {
        let cache = QueryCache::memory_only(100, "test");
        let calls = Arc::new(AtomicUsize::new(0));

        let first = {
            let cache = cache.clone();
            let compute = counting(&calls, "{}", Duration::from_millis(100));
            tokio::spawn(async move {
                cache
                    .get_or_compute(Fingerprint::statistics(), options(), compute)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        first.abort();

        let entry = cache
            .get_or_compute(
                Fingerprint::statistics(),
                options(),
                counting(&calls, "unused", Duration::ZERO),
            )
            .await
            .unwrap();
        assert_eq!(entry.payload, "{}");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidation_during_computation_skips_write_back() {
        let cache = QueryCache::memory_only(100, "test");
        let calls = Arc::new(AtomicUsize::new(0));

        let pending = {
            let cache = cache.clone();
            let compute = counting(&calls, "stale", Duration::from_millis(100));
            tokio::spawn(async move {
                cache
                    .get_or_compute(Fingerprint::statistics(), options(), compute)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.invalidate_all().await;

        let entry = pending.await.unwrap().unwrap();
        assert_eq!(entry.payload, "stale");
        assert!(cache.get(&Fingerprint::statistics()).await.is_none());
    }

    #[tokio::test]
    async fn test_entries_survive_restart() {
        let dir = tempdir().unwrap();
        {
            let cache = sqlite_cache(dir.path());
            cache
                .get_or_compute(Fingerprint::statistics(), options(), || async {
                    Ok("persisted".to_string())
                })
                .await
                .unwrap();
            cache.shutdown().await;
        }

        let cache = sqlite_cache(dir.path());
        let entry = cache.get(&Fingerprint::statistics()).await.unwrap();
        assert_eq!(entry.payload, "persisted");
    }

    #[tokio::test]
    async fn test_unopenable_store_degrades_to_memory() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();

        let cache = QueryCache::open(&blocker, StoreOptions::default(), 100);
        assert!(cache.degraded_state().is_degraded());

        let entry = cache
            .get_or_compute(Fingerprint::statistics(), options(), || async { Ok("{}".to_string()) })
            .await
            .unwrap();
        assert_eq!(entry.payload, "{}");
        assert!(cache.get(&Fingerprint::statistics()).await.is_some());

        let status = cache.status().await;
        assert!(!status.healthy);
        assert!(status.degraded_reason.is_some());
        assert_eq!(status.durable_entries, None);
    }

    /// SQLite store that parks one chosen operation until the test lets it go
    struct GatedStore {
        inner: SqliteStore,
        gate_loads: std::sync::atomic::AtomicBool,
        gate_stores: std::sync::atomic::AtomicBool,
        entered: std::sync::Barrier,
        release: std::sync::Barrier,
    }

    impl GatedStore {
        fn open(dir: &Path) -> Arc<Self> {
            Arc::new(Self {
                inner: SqliteStore::open(dir, StoreOptions::default()).unwrap(),
                gate_loads: Default::default(),
                gate_stores: Default::default(),
                entered: std::sync::Barrier::new(2),
                release: std::sync::Barrier::new(2),
            })
        }

        fn pass(&self, gate: &std::sync::atomic::AtomicBool) {
            if gate.swap(false, Ordering::SeqCst) {
                self.entered.wait();
                self.release.wait();
            }
        }

        /// Wait until the gated operation is parked
        async fn wait_entered(self: &Arc<Self>) {
            let store = Arc::clone(self);
            tokio::task::spawn_blocking(move || {
                store.entered.wait();
            })
            .await
            .unwrap();
        }

        async fn open_gate(self: &Arc<Self>) {
            let store = Arc::clone(self);
            tokio::task::spawn_blocking(move || {
                store.release.wait();
            })
            .await
            .unwrap();
        }
    }

    impl DurableStore for GatedStore {
        fn load(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, CacheError> {
            let loaded = self.inner.load(fingerprint);
            self.pass(&self.gate_loads);
            loaded
        }

        fn store(&self, entry: &CacheEntry) -> Result<(), CacheError> {
            self.pass(&self.gate_stores);
            self.inner.store(entry)
        }

        fn remove(&self, fingerprint: &Fingerprint) -> Result<bool, CacheError> {
            self.inner.remove(fingerprint)
        }

        fn remove_matching(&self, pattern: &FingerprintPattern) -> Result<usize, CacheError> {
            self.inner.remove_matching(pattern)
        }

        fn clear(&self) -> Result<usize, CacheError> {
            self.inner.clear()
        }

        fn purge_expired(&self, now: chrono::DateTime<Utc>) -> Result<usize, CacheError> {
            self.inner.purge_expired(now)
        }

        fn stats(&self) -> Result<crate::cache::StoreStats, CacheError> {
            self.inner.stats()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_invalidation_during_write_back_leaves_no_entry() {
        let dir = tempdir().unwrap();
        let store = GatedStore::open(dir.path());
        let cache = QueryCache::with_store(store.clone(), 100);
        store.gate_stores.store(true, Ordering::SeqCst);

        let pending = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute(Fingerprint::statistics(), options(), || async {
                        Ok("computed".to_string())
                    })
                    .await
            })
        };

        // Write-back is parked before the durable write
        store.wait_entered().await;
        assert!(!cache.invalidate(&Fingerprint::statistics()).await);
        store.open_gate().await;

        let entry = pending.await.unwrap().unwrap();
        assert_eq!(entry.payload, "computed");
        assert!(cache.get(&Fingerprint::statistics()).await.is_none());
        assert!(store.inner.load(&Fingerprint::statistics()).unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_invalidation_during_promotion_leaves_no_entry() {
        let dir = tempdir().unwrap();
        let store = GatedStore::open(dir.path());
        store
            .inner
            .store(&CacheEntry::new(Fingerprint::statistics(), "old".to_string(), &options()))
            .unwrap();
        let cache = QueryCache::with_store(store.clone(), 100);
        store.gate_loads.store(true, Ordering::SeqCst);

        let pending = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get(&Fingerprint::statistics()).await })
        };

        // The durable hit is loaded but not yet promoted to memory
        store.wait_entered().await;
        assert!(cache.invalidate(&Fingerprint::statistics()).await);
        store.open_gate().await;

        let stale = pending.await.unwrap().unwrap();
        assert_eq!(stale.payload, "old");
        assert!(cache.get(&Fingerprint::statistics()).await.is_none());
    }
}
