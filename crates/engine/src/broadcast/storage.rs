use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use flagsync_core::{Clock, InstanceId};
use flagsync_storage::KeyValueStore;

use super::{Broadcaster, ChangeHandler, FlagChange, HandlerSet, Subscription};

/// Fallback transport: the change is written under one well-known key of a
/// shared store and cleared again shortly after, so it neither accumulates
/// nor replays to instances that join later.
pub struct StorageBroadcaster {
    id: InstanceId,
    store: Arc<dyn KeyValueStore>,
    key: String,
    clear_after: Duration,
    clock: Arc<dyn Clock>,
    remote: HandlerSet,
    local: HandlerSet,
    listener: JoinHandle<()>,
}

impl StorageBroadcaster {
    pub fn join(
        store: Arc<dyn KeyValueStore>,
        key: &str,
        clear_after: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let id = InstanceId::new();
        let remote = HandlerSet::default();
        let mut rx = store.subscribe();
        let handlers = remote.clone();
        let watched = key.to_string();

        let listener = tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(instance = %id, missed, "storage change listener lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if event.key != watched || event.writer == id {
                    continue;
                }
                // Removals are housekeeping, not changes.
                let Some(value) = event.new_value else {
                    continue;
                };
                match serde_json::from_str::<FlagChange>(&value) {
                    Ok(change) => {
                        debug!(instance = %id, key = %change.key, "received flag change via storage");
                        handlers.dispatch(&change);
                    }
                    Err(e) => warn!(instance = %id, error = %e, "ignoring malformed flag change payload"),
                }
            }
        });

        Self {
            id,
            store,
            key: key.to_string(),
            clear_after,
            clock,
            remote,
            local: HandlerSet::default(),
            listener,
        }
    }

    fn publish(&self, change: &FlagChange) {
        let payload = match serde_json::to_string(change) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to encode flag change");
                return;
            }
        };
        if let Err(e) = self.store.set(&self.key, &payload, self.id) {
            warn!(error = %e, "failed to write flag change");
            return;
        }

        let store = Arc::clone(&self.store);
        let key = self.key.clone();
        let id = self.id;
        let clear_after = self.clear_after;
        tokio::spawn(async move {
            tokio::time::sleep(clear_after).await;
            // A newer write by anyone stays put.
            match store.remove_if(&key, &payload, id) {
                Ok(true) => debug!(instance = %id, "cleared flag change key"),
                Ok(false) => {}
                Err(e) => warn!(instance = %id, error = %e, "failed to clear flag change key"),
            }
        });
    }
}

impl Broadcaster for StorageBroadcaster {
    fn instance_id(&self) -> InstanceId {
        self.id
    }

    fn notify(&self, key: &str) {
        let change = FlagChange {
            key: key.to_string(),
            timestamp: self.clock.now(),
        };
        debug!(instance = %self.id, key = %key, "writing flag change");
        self.publish(&change);
        self.local.dispatch(&change);
    }

    fn on_change(&self, handler: ChangeHandler) -> Subscription {
        self.remote.add(handler)
    }

    fn on_local_change(&self, handler: ChangeHandler) -> Subscription {
        self.local.add(handler)
    }
}

impl Drop for StorageBroadcaster {
    fn drop(&mut self) {
        self.listener.abort();
    }
}
