use flagsync_core::{FlagRecord, InstanceId, Timestamp};
use tokio::sync::broadcast;

use crate::error::StorageError;

/// Rows of the authoritative flag table. Static flags never live here.
pub trait FlagStore: Send {
    fn list_flags(&self) -> Result<Vec<FlagRecord>, StorageError>;

    fn get_flag(&self, key: &str) -> Result<Option<FlagRecord>, StorageError>;

    fn insert_flag(&mut self, record: &FlagRecord) -> Result<(), StorageError>;

    /// Fails with `NotFound` if `key` has no row.
    fn update_enabled(
        &mut self,
        key: &str,
        enabled: bool,
        updated_at: Timestamp,
    ) -> Result<FlagRecord, StorageError>;

    /// Returns whether a row was removed.
    fn delete_flag(&mut self, key: &str) -> Result<bool, StorageError>;
}

/// Change notification from a `KeyValueStore`. `new_value` is `None` for
/// removals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    pub new_value: Option<String>,
    pub writer: InstanceId,
}

/// A string key/value store shared by every instance of one origin, with a
/// change feed. Writes that do not change the stored value emit nothing.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set(&self, key: &str, value: &str, writer: InstanceId) -> Result<(), StorageError>;

    /// Remove `key` only if it still holds `expected`. Returns whether it did.
    fn remove_if(&self, key: &str, expected: &str, writer: InstanceId) -> Result<bool, StorageError>;

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent>;
}
