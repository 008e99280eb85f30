//! Cross-instance change notifications.
//!
//! A notification only says *which* flag changed and when; receivers are
//! expected to refetch rather than trust any implied value. Two transports
//! implement `Broadcaster` and are chosen once, at construction.

mod channel;
mod storage;

pub use channel::{ChannelBroadcaster, ChannelHub};
pub use storage::StorageBroadcaster;

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use flagsync_core::{Clock, InstanceId, Timestamp};
use flagsync_storage::KeyValueStore;

use crate::config::{EngineConfig, TransportKind};

/// Wire payload: `{"key": ..., "timestamp": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlagChange {
    pub key: String,
    pub timestamp: Timestamp,
}

pub type ChangeHandler = Arc<dyn Fn(&FlagChange) + Send + Sync>;

pub trait Broadcaster: Send + Sync {
    fn instance_id(&self) -> InstanceId;

    /// Fire-and-forget. Sibling instances receive it through `on_change`;
    /// this instance receives it through `on_local_change`.
    fn notify(&self, key: &str);

    /// Changes announced by other instances.
    fn on_change(&self, handler: ChangeHandler) -> Subscription;

    /// Changes announced by this instance.
    fn on_local_change(&self, handler: ChangeHandler) -> Subscription;
}

/// Build the transport named by `config.transport`. Must be called from
/// within a Tokio runtime.
pub fn connect(
    config: &EngineConfig,
    hub: &ChannelHub,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
) -> Arc<dyn Broadcaster> {
    match config.transport {
        TransportKind::Channel => Arc::new(ChannelBroadcaster::join(hub, clock)),
        TransportKind::Storage => Arc::new(StorageBroadcaster::join(
            store,
            &config.broadcast_key,
            config.broadcast_clear_after(),
            clock,
        )),
    }
}

#[derive(Default)]
struct Handlers {
    next_id: u64,
    entries: Vec<(u64, ChangeHandler)>,
}

/// Registered handlers for one event path.
#[derive(Clone, Default)]
pub struct HandlerSet {
    inner: Arc<Mutex<Handlers>>,
}

impl HandlerSet {
    pub fn add(&self, handler: ChangeHandler) -> Subscription {
        let mut handlers = self.inner.lock();
        let id = handlers.next_id;
        handlers.next_id += 1;
        handlers.entries.push((id, handler));
        Subscription {
            handlers: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Handlers run outside the lock, so they may subscribe or unsubscribe.
    pub fn dispatch(&self, change: &FlagChange) {
        let handlers: Vec<ChangeHandler> = self
            .inner
            .lock()
            .entries
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in handlers {
            handler(change);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle for a registered handler. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the handler"]
pub struct Subscription {
    handlers: Weak<Mutex<Handlers>>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handlers) = self.handlers.upgrade() {
            handlers.lock().entries.retain(|(id, _)| *id != self.id);
        }
    }
}
