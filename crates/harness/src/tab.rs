use std::sync::Arc;

use flagsync_core::FlagRecord;
use flagsync_engine::FlagClient;

use crate::ScriptedGateway;

/// One client instance of a `TestOrigin`, with its own gateway so calls can
/// be counted and scripted per tab.
pub struct TestTab {
    pub client: FlagClient,
    pub gateway: Arc<ScriptedGateway>,
}

impl TestTab {
    pub fn flag(&self, key: &str) -> Option<FlagRecord> {
        self.client.snapshot().get(key).cloned()
    }

    pub fn is_enabled(&self, key: &str) -> bool {
        self.client.is_enabled(key)
    }
}
