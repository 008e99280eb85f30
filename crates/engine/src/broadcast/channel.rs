use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use flagsync_core::{Clock, InstanceId};

use super::{Broadcaster, ChangeHandler, FlagChange, HandlerSet, Subscription};

const HUB_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
struct ChannelMessage {
    source: InstanceId,
    change: FlagChange,
}

/// The publish/subscribe channel shared by every instance of one origin.
#[derive(Clone)]
pub struct ChannelHub {
    tx: broadcast::Sender<ChannelMessage>,
}

impl Default for ChannelHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(HUB_CAPACITY);
        Self { tx }
    }

    pub fn member_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Primary transport: messages go straight to every other member of the hub.
pub struct ChannelBroadcaster {
    id: InstanceId,
    hub: ChannelHub,
    clock: Arc<dyn Clock>,
    remote: HandlerSet,
    local: HandlerSet,
    listener: JoinHandle<()>,
}

impl ChannelBroadcaster {
    /// Join `hub`. Messages published after this call are delivered even if
    /// the listener task has not been scheduled yet.
    pub fn join(hub: &ChannelHub, clock: Arc<dyn Clock>) -> Self {
        let id = InstanceId::new();
        let remote = HandlerSet::default();
        let mut rx = hub.tx.subscribe();
        let handlers = remote.clone();

        let listener = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) if msg.source == id => {}
                    Ok(msg) => {
                        debug!(instance = %id, key = %msg.change.key, "received flag change");
                        handlers.dispatch(&msg.change);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(instance = %id, missed, "flag change listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Self {
            id,
            hub: hub.clone(),
            clock,
            remote,
            local: HandlerSet::default(),
            listener,
        }
    }
}

impl Broadcaster for ChannelBroadcaster {
    fn instance_id(&self) -> InstanceId {
        self.id
    }

    fn notify(&self, key: &str) {
        let change = FlagChange {
            key: key.to_string(),
            timestamp: self.clock.now(),
        };
        debug!(instance = %self.id, key = %key, "broadcasting flag change");
        // Only this instance listening: nobody to tell.
        let _ = self.hub.tx.send(ChannelMessage {
            source: self.id,
            change: change.clone(),
        });
        self.local.dispatch(&change);
    }

    fn on_change(&self, handler: ChangeHandler) -> Subscription {
        self.remote.add(handler)
    }

    fn on_local_change(&self, handler: ChangeHandler) -> Subscription {
        self.local.add(handler)
    }
}

impl Drop for ChannelBroadcaster {
    fn drop(&mut self) {
        self.listener.abort();
    }
}
