//! Per-instance flag cache.
//!
//! The current snapshot lives in a `watch` channel: readers take a cheap
//! `Arc` clone and never wait on the network, writers swap in a whole new
//! snapshot. At most one fetch is in flight at a time and every concurrent
//! `refresh` awaits that same fetch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use flagsync_core::{CacheSnapshot, CacheState, Clock, FlagRecord, Timestamp};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::gateway::FlagGateway;
use crate::retry::RetryPolicy;

type FetchResult = Result<Arc<CacheSnapshot>, EngineError>;
type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

struct CacheInner {
    gateway: Arc<dyn FlagGateway>,
    clock: Arc<dyn Clock>,
    stale_after: Duration,
    gc_after: Duration,
    retry: RetryPolicy,
    snapshot: watch::Sender<Arc<CacheSnapshot>>,
    last_access: AtomicI64,
    /// Bumped by `mark_stale` and by every commit. A fetch issued under an
    /// older epoch is discarded, never published.
    stale_epoch: AtomicU64,
    fetched_epoch: AtomicU64,
    inflight: Mutex<Option<SharedFetch>>,
    /// Optimistic records whose mutation has not settled yet. They win over
    /// fetched data until committed or rolled back.
    optimistic: Mutex<HashMap<String, FlagRecord>>,
}

#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<CacheInner>,
}

impl CacheStore {
    pub fn new(gateway: Arc<dyn FlagGateway>, clock: Arc<dyn Clock>, config: &EngineConfig) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(CacheSnapshot::empty()));
        let now = clock.now();
        Self {
            inner: Arc::new(CacheInner {
                gateway,
                clock,
                stale_after: config.stale_after(),
                gc_after: config.gc_after(),
                retry: config.retry,
                snapshot,
                last_access: AtomicI64::new(now.as_millis()),
                stale_epoch: AtomicU64::new(0),
                fetched_epoch: AtomicU64::new(0),
                inflight: Mutex::new(None),
                optimistic: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The latest snapshot. Never waits on I/O.
    pub fn get_snapshot(&self) -> Arc<CacheSnapshot> {
        self.touch(self.inner.clock.now());
        Arc::clone(&self.inner.snapshot.borrow())
    }

    /// Notified on every snapshot replacement.
    pub fn subscribe(&self) -> watch::Receiver<Arc<CacheSnapshot>> {
        self.inner.snapshot.subscribe()
    }

    /// Return the cached snapshot if it is still fresh and `force` is false,
    /// otherwise fetch. Concurrent callers share one request, and that request
    /// only settles on data fetched after the latest `mark_stale`.
    pub async fn refresh(&self, force: bool) -> FetchResult {
        let now = self.inner.clock.now();
        self.collect_garbage_at(now);
        self.touch(now);

        if !force && self.is_fresh(now) {
            debug!("flag snapshot fresh, skipping fetch");
            return Ok(self.current());
        }

        let fetch = {
            let mut inflight = self.inner.inflight.lock();
            match inflight.as_ref() {
                Some(fetch) => {
                    debug!(force, "joining in-flight flag fetch");
                    fetch.clone()
                }
                None => {
                    let fetch = self.clone().run_fetch().boxed().shared();
                    *inflight = Some(fetch.clone());
                    fetch
                }
            }
        };
        fetch.await
    }

    /// Declare the current data outdated. The next `refresh` fetches even
    /// inside the staleness window, and a request issued before this call is
    /// thrown away and sent again.
    pub fn mark_stale(&self) {
        self.bump_stale_epoch();
    }

    pub fn is_fetching(&self) -> bool {
        self.inner.inflight.lock().is_some()
    }

    /// Drop the snapshot if nobody has read it for longer than the GC
    /// ceiling. Returns whether anything was dropped.
    pub fn collect_garbage(&self) -> bool {
        self.collect_garbage_at(self.inner.clock.now())
    }

    fn collect_garbage_at(&self, now: Timestamp) -> bool {
        let last = Timestamp::from_millis(self.inner.last_access.load(Ordering::SeqCst));
        if now.duration_since(last) < self.inner.gc_after {
            return false;
        }
        if self.is_fetching() || !self.inner.optimistic.lock().is_empty() {
            return false;
        }
        let dropped = self.inner.snapshot.send_if_modified(|current| {
            if current.fetched_at().is_none() && current.is_empty() {
                return false;
            }
            *current = Arc::new(CacheSnapshot::empty());
            true
        });
        if dropped {
            info!(idle_ms = now.duration_since(last).as_millis() as u64, "dropped idle flag snapshot");
        }
        dropped
    }

    /// Taken under the in-flight lock so a fetch cannot check the epoch and
    /// retire itself around a concurrent bump.
    fn bump_stale_epoch(&self) {
        let _inflight = self.inner.inflight.lock();
        self.inner.stale_epoch.fetch_add(1, Ordering::SeqCst);
    }

    fn touch(&self, now: Timestamp) {
        self.inner.last_access.fetch_max(now.as_millis(), Ordering::SeqCst);
    }

    fn current(&self) -> Arc<CacheSnapshot> {
        Arc::clone(&self.inner.snapshot.borrow())
    }

    fn is_fresh(&self, now: Timestamp) -> bool {
        let epoch_ok = self.inner.fetched_epoch.load(Ordering::SeqCst)
            >= self.inner.stale_epoch.load(Ordering::SeqCst);
        epoch_ok && self.current().is_fresh(now, self.inner.stale_after)
    }

    /// Replace the snapshot with one derived from the current one.
    fn update(&self, derive: impl FnOnce(&CacheSnapshot) -> CacheSnapshot) {
        self.inner.snapshot.send_modify(|current| {
            *current = Arc::new(derive(current));
        });
    }

    async fn run_fetch(self) -> FetchResult {
        loop {
            let epoch = self.inner.stale_epoch.load(Ordering::SeqCst);
            match self.fetch_with_retry().await {
                Ok(records) => match self.apply_fetched(records, epoch) {
                    Some(snapshot) => return Ok(snapshot),
                    None => debug!("flags marked stale during fetch, fetching again"),
                },
                Err(err) => {
                    *self.inner.inflight.lock() = None;
                    return Err(err);
                }
            }
        }
    }

    async fn fetch_with_retry(&self) -> Result<Vec<FlagRecord>, EngineError> {
        let mut retries = 0;
        loop {
            self.update(|current| {
                let state = if current.fetched_at().is_none() {
                    CacheState::Loading
                } else {
                    CacheState::Refreshing
                };
                current.with_state(state)
            });
            debug!(attempt = retries + 1, "fetching flags");

            match self.inner.gateway.fetch_all().await {
                Ok(records) => return Ok(records),
                Err(err) => {
                    // Keep serving the last good data, flagged as errored.
                    self.update(|current| current.with_error(err.to_string()));

                    if !err.is_retryable() || !self.inner.retry.allows(retries) {
                        warn!(error = %err, attempts = retries + 1, "flag fetch failed, giving up");
                        return Err(err.into());
                    }
                    retries += 1;
                    let delay = self.inner.retry.delay_for(retries);
                    warn!(
                        error = %err,
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        "flag fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Publish fetched records, with pending optimistic records laid over
    /// them, and retire the in-flight request. Returns `None` without
    /// publishing if the data was requested before the latest stale mark.
    fn apply_fetched(&self, records: Vec<FlagRecord>, epoch: u64) -> Option<Arc<CacheSnapshot>> {
        let now = self.inner.clock.now();
        let mut published = None;
        self.inner.snapshot.send_if_modified(|current| {
            let mut inflight = self.inner.inflight.lock();
            if self.inner.stale_epoch.load(Ordering::SeqCst) > epoch {
                return false;
            }
            let records = {
                let optimistic = self.inner.optimistic.lock();
                records
                    .into_iter()
                    .map(|r| optimistic.get(&r.key).cloned().unwrap_or(r))
                    .collect::<Vec<_>>()
            };
            let next = Arc::new(CacheSnapshot::fetched(records, now));
            published = Some(Arc::clone(&next));
            *current = next;
            *inflight = None;
            true
        });
        let snapshot = published?;
        self.inner.fetched_epoch.fetch_max(epoch, Ordering::SeqCst);
        debug!(count = snapshot.len(), "flag snapshot replaced");
        Some(snapshot)
    }
}

/// Optimistic mutation support, driven by `MutationCoordinator`.
///
/// Every change to the optimistic map happens inside the same snapshot swap
/// that publishes it, so a fetch landing concurrently never sees one
/// without the other.
impl CacheStore {
    /// Publish `record` in place of the cached record with the same key.
    /// Returns `(previous, applied)` snapshots.
    pub(crate) fn apply_optimistic(
        &self,
        record: FlagRecord,
    ) -> Result<(Arc<CacheSnapshot>, Arc<CacheSnapshot>), EngineError> {
        let key = record.key.clone();
        let mut swapped = None;
        self.inner.snapshot.send_if_modified(|current| {
            let Some(next) = current.with_record(record.clone()) else {
                return false;
            };
            let next = Arc::new(next);
            swapped = Some((Arc::clone(current), Arc::clone(&next)));
            *current = next;
            self.inner.optimistic.lock().insert(record.key.clone(), record);
            true
        });
        swapped.ok_or(EngineError::NotFound(key))
    }

    /// Replace the optimistic record with the confirmed one. Any fetch still
    /// in flight may predate the write, so the cache is marked stale in the
    /// same step.
    pub(crate) fn commit(&self, record: FlagRecord) {
        self.inner.snapshot.send_if_modified(|current| {
            self.bump_stale_epoch();
            self.inner.optimistic.lock().remove(&record.key);
            match current.with_record(record) {
                Some(next) => {
                    *current = Arc::new(next);
                    true
                }
                None => false,
            }
        });
    }

    /// Undo an optimistic apply. If nothing replaced the optimistic snapshot
    /// in the meantime, `previous` is restored wholesale; otherwise only the
    /// key's record is reverted so unrelated updates survive.
    pub(crate) fn rollback(&self, key: &str, previous: &Arc<CacheSnapshot>, applied: &Arc<CacheSnapshot>) {
        let prior = previous.get(key).cloned();
        self.inner.snapshot.send_if_modified(|current| {
            self.inner.optimistic.lock().remove(key);
            if Arc::ptr_eq(current, applied) {
                *current = Arc::clone(previous);
                return true;
            }
            match prior.and_then(|p| current.with_record(p)) {
                Some(next) => {
                    *current = Arc::new(next);
                    true
                }
                None => false,
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use flagsync_core::{FlagCategory, FlagPatch, ManualClock};

    use crate::error::GatewayError;

    struct StubGateway {
        calls: AtomicUsize,
        failures: Mutex<VecDeque<GatewayError>>,
        records: Mutex<Vec<FlagRecord>>,
    }

    impl StubGateway {
        fn new(records: Vec<FlagRecord>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failures: Mutex::new(VecDeque::new()),
                records: Mutex::new(records),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FlagGateway for StubGateway {
        async fn fetch_all(&self) -> Result<Vec<FlagRecord>, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.failures.lock().pop_front() {
                return Err(err);
            }
            Ok(self.records.lock().clone())
        }

        async fn mutate(&self, key: &str, _patch: FlagPatch) -> Result<FlagRecord, GatewayError> {
            Err(GatewayError::NotFound(key.to_string()))
        }
    }

    fn flags() -> Vec<FlagRecord> {
        let t = Timestamp::from_millis(1);
        vec![
            FlagRecord::new("a", "A", FlagCategory::Core, false, t),
            FlagRecord::new("b", "B", FlagCategory::Ui, true, t),
        ]
    }

    fn store(gateway: Arc<StubGateway>) -> (CacheStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(100_000)));
        let cache = CacheStore::new(gateway, clock.clone(), &EngineConfig::default());
        (cache, clock)
    }

    #[tokio::test]
    async fn starts_empty_and_idle() {
        let (cache, _) = store(StubGateway::new(flags()));
        let snap = cache.get_snapshot();
        assert!(snap.is_empty());
        assert_eq!(snap.state(), CacheState::Idle);
        assert_eq!(snap.fetched_at(), None);
    }

    #[tokio::test]
    async fn fresh_snapshot_skips_gateway() {
        let gateway = StubGateway::new(flags());
        let (cache, clock) = store(gateway.clone());

        cache.refresh(false).await.unwrap();
        clock.advance(Duration::from_secs(10));
        cache.refresh(false).await.unwrap();
        assert_eq!(gateway.calls(), 1);

        clock.advance(Duration::from_secs(25));
        cache.refresh(false).await.unwrap();
        assert_eq!(gateway.calls(), 2, "stale after 30s");
    }

    #[tokio::test]
    async fn mark_stale_forces_next_refresh() {
        let gateway = StubGateway::new(flags());
        let (cache, _) = store(gateway.clone());
        cache.refresh(false).await.unwrap();
        cache.mark_stale();
        cache.refresh(false).await.unwrap();
        assert_eq!(gateway.calls(), 2);
        cache.refresh(false).await.unwrap();
        assert_eq!(gateway.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_failure_surfaces_immediately() {
        let gateway = StubGateway::new(flags());
        gateway
            .failures
            .lock()
            .push_back(GatewayError::Permission("signed out".into()));
        let (cache, _) = store(gateway.clone());

        let err = cache.refresh(true).await.unwrap_err();
        assert!(matches!(err, EngineError::Gateway(GatewayError::Permission(_))));
        assert_eq!(gateway.calls(), 1);
        assert_eq!(cache.get_snapshot().state(), CacheState::Error);
        assert!(!cache.is_fetching());
    }

    #[tokio::test]
    async fn garbage_collection_after_inactivity() {
        let gateway = StubGateway::new(flags());
        let (cache, clock) = store(gateway.clone());
        cache.refresh(false).await.unwrap();

        clock.advance(Duration::from_secs(299));
        assert!(!cache.collect_garbage());

        clock.advance(Duration::from_secs(2));
        assert!(cache.collect_garbage());
        assert!(cache.get_snapshot().is_empty());
        assert_eq!(cache.get_snapshot().fetched_at(), None);
    }

    #[tokio::test]
    async fn reads_keep_snapshot_alive() {
        let gateway = StubGateway::new(flags());
        let (cache, clock) = store(gateway.clone());
        cache.refresh(false).await.unwrap();

        for _ in 0..10 {
            clock.advance(Duration::from_secs(60));
            let _ = cache.get_snapshot();
        }
        assert!(!cache.collect_garbage());
        assert_eq!(cache.get_snapshot().len(), 2);
    }

    #[tokio::test]
    async fn optimistic_record_survives_refetch() {
        let gateway = StubGateway::new(flags());
        let (cache, clock) = store(gateway.clone());
        cache.refresh(false).await.unwrap();

        let current = cache.get_snapshot();
        let optimistic = current
            .get("a")
            .unwrap()
            .patched(&FlagPatch::enabled(true), clock.now());
        cache.apply_optimistic(optimistic).unwrap();

        cache.refresh(true).await.unwrap();
        assert!(cache.get_snapshot().get("a").unwrap().enabled, "pending value kept");
    }

    #[tokio::test]
    async fn rollback_restores_previous_snapshot() {
        let (cache, clock) = store(StubGateway::new(flags()));
        cache.refresh(false).await.unwrap();

        let before = cache.get_snapshot();
        let optimistic = before.get("a").unwrap().patched(&FlagPatch::enabled(true), clock.now());
        let (previous, applied) = cache.apply_optimistic(optimistic).unwrap();
        assert!(Arc::ptr_eq(&previous, &before));
        assert!(cache.get_snapshot().get("a").unwrap().enabled);

        cache.rollback("a", &previous, &applied);
        assert!(Arc::ptr_eq(&cache.get_snapshot(), &before));
    }

    #[tokio::test]
    async fn rollback_keeps_unrelated_updates() {
        let (cache, clock) = store(StubGateway::new(flags()));
        cache.refresh(false).await.unwrap();

        let snap = cache.get_snapshot();
        let a = snap.get("a").unwrap().patched(&FlagPatch::enabled(true), clock.now());
        let (previous, applied) = cache.apply_optimistic(a).unwrap();

        let b = snap.get("b").unwrap().patched(&FlagPatch::enabled(false), clock.now());
        cache.apply_optimistic(b).unwrap();

        cache.rollback("a", &previous, &applied);
        let now = cache.get_snapshot();
        assert!(!now.get("a").unwrap().enabled);
        assert!(!now.get("b").unwrap().enabled, "b's optimistic value untouched");
    }

    #[tokio::test]
    async fn commit_marks_the_cache_stale() {
        let gateway = StubGateway::new(flags());
        let (cache, clock) = store(gateway.clone());
        cache.refresh(false).await.unwrap();

        let a = cache.get_snapshot().get("a").unwrap().patched(&FlagPatch::enabled(true), clock.now());
        cache.apply_optimistic(a.clone()).unwrap();
        cache.commit(a);
        assert!(cache.get_snapshot().get("a").unwrap().enabled);

        // Inside the staleness window, yet the next refresh must refetch.
        cache.refresh(false).await.unwrap();
        assert_eq!(gateway.calls(), 2);
    }

    #[tokio::test]
    async fn apply_optimistic_unknown_key() {
        let (cache, clock) = store(StubGateway::new(flags()));
        cache.refresh(false).await.unwrap();
        let ghost = FlagRecord::new("ghost", "Ghost", FlagCategory::Admin, true, clock.now());
        assert!(matches!(cache.apply_optimistic(ghost), Err(EngineError::NotFound(k)) if k == "ghost"));
    }
}
