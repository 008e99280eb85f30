use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use flagsync_core::projection::{self, FlagFilter, FlagStats};
use flagsync_core::{CacheSnapshot, Clock, FlagCategory, FlagPatch, FlagRecord, InstanceId};
use flagsync_storage::KeyValueStore;

use crate::broadcast::{self, Broadcaster, ChangeHandler, ChannelHub, FlagChange, Subscription};
use crate::cache::CacheStore;
use crate::config::EngineConfig;
use crate::coordinator::MutationCoordinator;
use crate::error::EngineError;
use crate::gateway::FlagGateway;

struct ClientInner {
    cache: CacheStore,
    coordinator: MutationCoordinator,
    broadcaster: Arc<dyn Broadcaster>,
    _sibling_changes: Subscription,
}

/// One client instance (a tab or window): its cache, its mutation
/// coordinator and its end of the cross-instance broadcast.
///
/// Everything is injected; nothing here is process-global.
#[derive(Clone)]
pub struct FlagClient {
    inner: Arc<ClientInner>,
}

impl FlagClient {
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: &EngineConfig,
        gateway: Arc<dyn FlagGateway>,
        broadcaster: Arc<dyn Broadcaster>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cache = CacheStore::new(Arc::clone(&gateway), Arc::clone(&clock), config);
        let coordinator = MutationCoordinator::new(
            cache.clone(),
            gateway,
            Arc::clone(&broadcaster),
            clock,
            config.same_key_policy,
        );

        let refresher = cache.clone();
        let on_sibling_change: ChangeHandler = Arc::new(move |change: &FlagChange| {
            debug!(key = %change.key, "sibling changed a flag, refreshing");
            refresher.mark_stale();
            let cache = refresher.clone();
            tokio::spawn(async move {
                if let Err(e) = cache.refresh(true).await {
                    warn!(error = %e, "refresh after sibling change failed");
                }
            });
        });
        let sibling_changes = broadcaster.on_change(on_sibling_change);

        Self {
            inner: Arc::new(ClientInner {
                cache,
                coordinator,
                broadcaster,
                _sibling_changes: sibling_changes,
            }),
        }
    }

    /// Build with the transport selected by `config.transport`.
    pub fn connect(
        config: &EngineConfig,
        gateway: Arc<dyn FlagGateway>,
        hub: &ChannelHub,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let broadcaster = broadcast::connect(config, hub, store, Arc::clone(&clock));
        Self::new(config, gateway, broadcaster, clock)
    }

    pub fn instance_id(&self) -> InstanceId {
        self.inner.broadcaster.instance_id()
    }

    pub fn cache(&self) -> &CacheStore {
        &self.inner.cache
    }

    pub fn coordinator(&self) -> &MutationCoordinator {
        &self.inner.coordinator
    }

    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        self.inner.cache.get_snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<CacheSnapshot>> {
        self.inner.cache.subscribe()
    }

    pub async fn refresh(&self, force: bool) -> Result<Arc<CacheSnapshot>, EngineError> {
        self.inner.cache.refresh(force).await
    }

    pub async fn toggle(&self, key: &str) -> Result<FlagRecord, EngineError> {
        self.inner.coordinator.toggle(key).await
    }

    pub async fn set_enabled(&self, key: &str, enabled: bool) -> Result<FlagRecord, EngineError> {
        self.inner.coordinator.set_enabled(key, enabled).await
    }

    pub async fn set_field(&self, key: &str, patch: FlagPatch) -> Result<FlagRecord, EngineError> {
        self.inner.coordinator.set_field(key, patch).await
    }

    /// `false` for unknown keys.
    pub fn is_enabled(&self, key: &str) -> bool {
        self.snapshot().get(key).is_some_and(|r| r.enabled)
    }

    pub fn filter(&self, criteria: &FlagFilter) -> Vec<FlagRecord> {
        let snapshot = self.snapshot();
        projection::filter(&snapshot, criteria)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> FlagStats {
        projection::stats(&self.snapshot())
    }

    pub fn grouped(&self) -> Vec<(FlagCategory, Vec<FlagRecord>)> {
        let snapshot = self.snapshot();
        projection::group_by_category(&snapshot)
            .into_iter()
            .map(|(category, records)| (category, records.into_iter().cloned().collect()))
            .collect()
    }

    /// Changes this instance itself committed.
    pub fn on_local_change(&self, handler: ChangeHandler) -> Subscription {
        self.inner.broadcaster.on_local_change(handler)
    }

    /// Changes announced by sibling instances.
    pub fn on_sibling_change(&self, handler: ChangeHandler) -> Subscription {
        self.inner.broadcaster.on_change(handler)
    }
}
