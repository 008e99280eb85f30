use std::sync::Arc;

use async_trait::async_trait;

use flagsync_core::{FlagPatch, FlagRecord};
use flagsync_storage::FlagService;

use crate::error::GatewayError;

/// The remote boundary. Calls are at-most-once from the gateway's point of
/// view; retrying is the caller's business.
#[async_trait]
pub trait FlagGateway: Send + Sync {
    async fn fetch_all(&self) -> Result<Vec<FlagRecord>, GatewayError>;

    async fn mutate(&self, key: &str, patch: FlagPatch) -> Result<FlagRecord, GatewayError>;
}

/// Gateway that talks to an in-process `FlagService`.
pub struct ServiceGateway {
    service: Arc<FlagService>,
}

impl ServiceGateway {
    pub fn new(service: Arc<FlagService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl FlagGateway for ServiceGateway {
    async fn fetch_all(&self) -> Result<Vec<FlagRecord>, GatewayError> {
        Ok(self.service.list_flags()?)
    }

    async fn mutate(&self, key: &str, patch: FlagPatch) -> Result<FlagRecord, GatewayError> {
        Ok(self.service.update_flag(key, &patch)?)
    }
}
