//! Optimistic mutations.
//!
//! A mutation is applied to the cache before the gateway is called and then
//! either committed or rolled back when the call settles. Mutations on the
//! same key never overlap; mutations on different keys may.
//!
//! Once applied, a mutation runs to completion on its own task. Dropping the
//! caller's future stops the caller from waiting, not the mutation.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as SlotLock, OwnedMutexGuard};
use tracing::{debug, info, warn};

use flagsync_core::{CacheSnapshot, Clock, FlagPatch, FlagRecord, Timestamp};

use crate::broadcast::Broadcaster;
use crate::cache::CacheStore;
use crate::config::SameKeyPolicy;
use crate::error::EngineError;
use crate::gateway::FlagGateway;

/// The in-flight mutation for one key. Lives only until the gateway call
/// settles.
#[derive(Debug, Clone)]
pub struct PendingMutation {
    pub key: String,
    pub patch: FlagPatch,
    pub previous_snapshot: Arc<CacheSnapshot>,
    pub issued_at: Timestamp,
}

#[derive(Debug, Clone, Copy)]
enum Intent {
    Toggle,
    Set(FlagPatch),
}

impl Intent {
    fn patch_for(&self, record: &FlagRecord) -> FlagPatch {
        match self {
            Self::Toggle => FlagPatch::toggle_of(record),
            Self::Set(patch) => *patch,
        }
    }
}

pub struct MutationCoordinator {
    cache: CacheStore,
    gateway: Arc<dyn FlagGateway>,
    broadcaster: Arc<dyn Broadcaster>,
    clock: Arc<dyn Clock>,
    policy: SameKeyPolicy,
    slots: Mutex<HashMap<String, Arc<SlotLock<()>>>>,
    pending: Arc<Mutex<HashMap<String, PendingMutation>>>,
}

/// Everything the settle step needs, owned so it can outlive the caller.
struct Settle {
    cache: CacheStore,
    gateway: Arc<dyn FlagGateway>,
    broadcaster: Arc<dyn Broadcaster>,
    pending: Arc<Mutex<HashMap<String, PendingMutation>>>,
    key: String,
    patch: FlagPatch,
    base: FlagRecord,
    previous: Arc<CacheSnapshot>,
    applied: Arc<CacheSnapshot>,
}

impl Settle {
    async fn run(self) -> Result<FlagRecord, EngineError> {
        let result = self.gateway.mutate(&self.key, self.patch).await;
        self.pending.lock().remove(&self.key);

        match result {
            Ok(mut confirmed) => {
                confirmed.updated_at = confirmed.updated_at.max(self.base.updated_at.next());
                self.cache.commit(confirmed.clone());
                info!(key = %self.key, enabled = confirmed.enabled, "flag mutation committed");

                // Pick up fields only the server knows, in the background.
                let cache = self.cache.clone();
                tokio::spawn(async move {
                    if let Err(e) = cache.refresh(true).await {
                        warn!(error = %e, "post-commit flag refresh failed");
                    }
                });

                self.broadcaster.notify(&self.key);
                Ok(confirmed)
            }
            Err(err) => {
                self.cache.rollback(&self.key, &self.previous, &self.applied);
                warn!(key = %self.key, error = %err, "flag mutation failed, rolled back");
                Err(err.into())
            }
        }
    }
}

impl MutationCoordinator {
    pub fn new(
        cache: CacheStore,
        gateway: Arc<dyn FlagGateway>,
        broadcaster: Arc<dyn Broadcaster>,
        clock: Arc<dyn Clock>,
        policy: SameKeyPolicy,
    ) -> Self {
        Self {
            cache,
            gateway,
            broadcaster,
            clock,
            policy,
            slots: Mutex::new(HashMap::new()),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn policy(&self) -> SameKeyPolicy {
        self.policy
    }

    /// Flip `enabled` for `key`.
    pub async fn toggle(&self, key: &str) -> Result<FlagRecord, EngineError> {
        self.mutate(key, Intent::Toggle).await
    }

    pub async fn set_enabled(&self, key: &str, enabled: bool) -> Result<FlagRecord, EngineError> {
        self.set_field(key, FlagPatch::enabled(enabled)).await
    }

    pub async fn set_field(&self, key: &str, patch: FlagPatch) -> Result<FlagRecord, EngineError> {
        self.mutate(key, Intent::Set(patch)).await
    }

    pub fn pending(&self, key: &str) -> Option<PendingMutation> {
        self.pending.lock().get(key).cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn lookup(&self, key: &str) -> Result<FlagRecord, EngineError> {
        let snapshot = self.cache.get_snapshot();
        let record = snapshot
            .get(key)
            .ok_or_else(|| EngineError::NotFound(key.to_string()))?;
        if record.is_static {
            return Err(EngineError::StaticFlag(key.to_string()));
        }
        Ok(record.clone())
    }

    fn slot(&self, key: &str) -> Arc<SlotLock<()>> {
        let mut slots = self.slots.lock();
        Arc::clone(slots.entry(key.to_string()).or_default())
    }

    async fn acquire(&self, key: &str) -> Result<OwnedMutexGuard<()>, EngineError> {
        let slot = self.slot(key);
        match self.policy {
            SameKeyPolicy::Reject => slot.try_lock_owned().map_err(|_| {
                debug!(key = %key, "rejecting mutation, another is in flight");
                EngineError::MutationInFlight(key.to_string())
            }),
            SameKeyPolicy::Queue => {
                debug!(key = %key, "waiting for mutation slot");
                Ok(slot.lock_owned().await)
            }
        }
    }

    async fn mutate(&self, key: &str, intent: Intent) -> Result<FlagRecord, EngineError> {
        // Static and unknown flags fail before anything is touched.
        self.lookup(key)?;
        let slot = self.acquire(key).await?;

        // Re-read: a queued caller must build on what the previous mutation left.
        let record = self.lookup(key)?;
        let patch = intent.patch_for(&record);
        if !patch.changes(&record) {
            debug!(key = %key, "patch is a no-op");
            return Ok(record);
        }

        let now = self.clock.now();
        let optimistic = record.patched(&patch, now);
        let (previous, applied) = self.cache.apply_optimistic(optimistic)?;
        self.pending.lock().insert(
            key.to_string(),
            PendingMutation {
                key: key.to_string(),
                patch,
                previous_snapshot: Arc::clone(&previous),
                issued_at: now,
            },
        );
        debug!(key = %key, enabled = patch.enabled, "applied optimistic update");

        let settle = Settle {
            cache: self.cache.clone(),
            gateway: Arc::clone(&self.gateway),
            broadcaster: Arc::clone(&self.broadcaster),
            pending: Arc::clone(&self.pending),
            key: key.to_string(),
            patch,
            base: record,
            previous,
            applied,
        };
        let task = tokio::spawn(async move {
            // The slot stays held until the mutation has settled.
            let _slot = slot;
            settle.run().await
        });
        match task.await {
            Ok(result) => result,
            Err(e) => Err(EngineError::Interrupted(format!("mutation of {key}: {e}"))),
        }
    }
}
