use std::sync::Arc;

use tracing::debug;

use flagsync_core::{Clock, FlagCategory, FlagRecord, ManualClock, StaticCatalog, Timestamp};
use flagsync_engine::{ChannelHub, EngineConfig, FlagClient, ServiceGateway};
use flagsync_storage::{FlagService, KeyValueStore, SqliteFlagStore, SqliteKeyStore, StorageError};

use crate::{ScriptedGateway, TestTab};

pub const START: Timestamp = Timestamp::from_millis(1_700_000_000_000);

/// A same-origin group of client instances: one authoritative service, one
/// broadcast hub, one shared key store.
pub struct TestOrigin {
    pub clock: Arc<ManualClock>,
    pub service: Arc<FlagService>,
    pub hub: ChannelHub,
    pub key_store: Arc<SqliteKeyStore>,
    config: EngineConfig,
}

impl TestOrigin {
    pub fn new(config: EngineConfig) -> Result<Self, StorageError> {
        Self::with_catalog(config, StaticCatalog::default())
    }

    pub fn with_catalog(config: EngineConfig, catalog: StaticCatalog) -> Result<Self, StorageError> {
        crate::init_tracing();
        let clock = Arc::new(ManualClock::new(START));
        let service = Arc::new(FlagService::new(
            SqliteFlagStore::open_in_memory()?,
            catalog,
            clock.clone(),
        ));
        Ok(Self {
            clock,
            service,
            hub: ChannelHub::new(),
            key_store: Arc::new(SqliteKeyStore::open_in_memory()?),
            config,
        })
    }

    /// The flags used across the scenario suites: `fileUpload` and
    /// `analytics` in the store, `darkMode` static.
    pub fn standard(config: EngineConfig) -> Result<Self, StorageError> {
        let catalog = StaticCatalog::new(vec![FlagRecord::new(
            "darkMode",
            "Dark Mode",
            FlagCategory::Ui,
            true,
            START,
        )])?;
        let origin = Self::with_catalog(config, catalog)?;
        origin.seed("fileUpload", "File Upload", FlagCategory::Module, false)?;
        origin.seed("analytics", "Analytics", FlagCategory::Core, false)?;
        origin.seed("betaSearch", "Beta Search", FlagCategory::Experimental, true)?;
        Ok(origin)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn seed(
        &self,
        key: &str,
        name: &str,
        category: FlagCategory,
        enabled: bool,
    ) -> Result<FlagRecord, StorageError> {
        let record = FlagRecord::new(key, name, category, enabled, self.clock.now());
        self.service.create_flag(&record)
    }

    /// Open a new tab using the origin's config. Must run inside a Tokio
    /// runtime.
    pub fn open_tab(&self) -> TestTab {
        self.open_tab_with(&self.config)
    }

    pub fn open_tab_with(&self, config: &EngineConfig) -> TestTab {
        let gateway = Arc::new(ScriptedGateway::new(Arc::new(ServiceGateway::new(
            self.service.clone(),
        ))));
        let store: Arc<dyn KeyValueStore> = self.key_store.clone();
        let clock: Arc<dyn Clock> = self.clock.clone();
        let client = FlagClient::connect(config, gateway.clone(), &self.hub, store, clock);
        debug!(instance = %client.instance_id(), transport = ?config.transport, "opened tab");
        TestTab { client, gateway }
    }
}
