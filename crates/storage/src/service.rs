//! The authoritative read/write path for flags.
//!
//! Every successful write invalidates the server-side cache before the
//! write returns, so a client that refetches after seeing success never
//! reads the pre-write projection.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use flagsync_core::{Clock, FlagPatch, FlagRecord, StaticCatalog};

use crate::error::StorageError;
use crate::sqlite::SqliteFlagStore;
use crate::tagged_cache::{InvalidationHook, TaggedCache};
use crate::traits::FlagStore;

pub const FLAGS_TAG: &str = "feature-flags";
pub const FLAGS_CACHE_KEY: &str = "feature-flags:all";

pub fn flag_tag(key: &str) -> String {
    format!("feature-flag:{key}")
}

pub struct FlagService {
    store: Mutex<SqliteFlagStore>,
    catalog: StaticCatalog,
    cache: Arc<TaggedCache>,
    hook: Arc<dyn InvalidationHook>,
    clock: Arc<dyn Clock>,
}

impl FlagService {
    /// The service's own `TaggedCache` doubles as its invalidation hook.
    pub fn new(store: SqliteFlagStore, catalog: StaticCatalog, clock: Arc<dyn Clock>) -> Self {
        let cache = Arc::new(TaggedCache::new());
        Self {
            store: Mutex::new(store),
            catalog,
            hook: cache.clone(),
            cache,
            clock,
        }
    }

    /// Route invalidations through `hook` instead of straight to the cache.
    pub fn with_invalidation_hook(mut self, hook: Arc<dyn InvalidationHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn cache(&self) -> &Arc<TaggedCache> {
        &self.cache
    }

    pub fn catalog(&self) -> &StaticCatalog {
        &self.catalog
    }

    /// Static flags first, then stored rows. A stored row whose key collides
    /// with a static flag is hidden by it.
    pub fn list_flags(&self) -> Result<Vec<FlagRecord>, StorageError> {
        let stored: Vec<FlagRecord> = self
            .cache
            .get_or_load(FLAGS_CACHE_KEY, &[FLAGS_TAG], || self.store.lock().list_flags())?;

        let mut flags = self.catalog.records().to_vec();
        flags.extend(stored.into_iter().filter(|r| !self.catalog.contains(&r.key)));
        Ok(flags)
    }

    pub fn get_flag(&self, key: &str) -> Result<Option<FlagRecord>, StorageError> {
        if let Some(record) = self.catalog.get(key) {
            return Ok(Some(record.clone()));
        }
        self.store.lock().get_flag(key)
    }

    pub fn update_flag(&self, key: &str, patch: &FlagPatch) -> Result<FlagRecord, StorageError> {
        if self.catalog.contains(key) {
            return Err(StorageError::StaticFlag(key.to_string()));
        }
        let now = self.clock.now();
        let record = self.store.lock().update_enabled(key, patch.enabled, now)?;
        info!(key = %key, enabled = record.enabled, "flag updated");
        self.invalidate_after_write(key);
        Ok(record)
    }

    pub fn create_flag(&self, record: &FlagRecord) -> Result<FlagRecord, StorageError> {
        if self.catalog.contains(&record.key) {
            return Err(StorageError::StaticFlag(record.key.clone()));
        }
        let mut record = record.clone();
        record.is_static = false;
        self.store.lock().insert_flag(&record)?;
        info!(key = %record.key, "flag created");
        self.invalidate_after_write(&record.key);
        Ok(record)
    }

    pub fn delete_flag(&self, key: &str) -> Result<(), StorageError> {
        if self.catalog.contains(key) {
            return Err(StorageError::StaticFlag(key.to_string()));
        }
        if !self.store.lock().delete_flag(key)? {
            return Err(StorageError::NotFound(key.to_string()));
        }
        info!(key = %key, "flag deleted");
        self.invalidate_after_write(key);
        Ok(())
    }

    /// The write has already committed; a failed invalidation is logged and
    /// left to the clients' staleness window.
    fn invalidate_after_write(&self, key: &str) {
        let tags = [FLAGS_TAG.to_string(), flag_tag(key)];
        match self.hook.invalidate(&tags) {
            Ok(()) => debug!(key = %key, "invalidated flag cache"),
            Err(e) => warn!(key = %key, error = %e, "flag cache invalidation failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use flagsync_core::{FlagCategory, ManualClock, Timestamp};

    fn service() -> Result<FlagService, StorageError> {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(10_000)));
        let catalog = StaticCatalog::new(vec![FlagRecord::new(
            "darkMode",
            "Dark mode",
            FlagCategory::Ui,
            true,
            Timestamp::EPOCH,
        )])?;
        let service = FlagService::new(SqliteFlagStore::open_in_memory()?, catalog, clock);
        service.create_flag(&FlagRecord::new(
            "fileUpload",
            "File upload",
            FlagCategory::Module,
            false,
            Timestamp::from_millis(1_000),
        ))?;
        Ok(service)
    }

    struct FailingHook {
        calls: AtomicUsize,
    }

    impl InvalidationHook for FailingHook {
        fn invalidate(&self, _tags: &[String]) -> Result<(), StorageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::Invalidation("cache unreachable".into()))
        }
    }

    #[test]
    fn list_merges_static_first() -> Result<(), StorageError> {
        let service = service()?;
        let flags = service.list_flags()?;
        let keys: Vec<&str> = flags.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(keys, vec!["darkMode", "fileUpload"]);
        assert!(flags[0].is_static);
        assert!(!flags[1].is_static);
        Ok(())
    }

    #[test]
    fn update_invalidates_exactly_once_before_returning() -> Result<(), StorageError> {
        let service = service()?;
        service.list_flags()?;
        assert!(service.cache().contains(FLAGS_CACHE_KEY));
        let before = service.cache().invalidation_count();

        let record = service.update_flag("fileUpload", &FlagPatch::enabled(true))?;
        assert!(record.enabled);
        assert_eq!(record.updated_at, Timestamp::from_millis(10_000));
        assert_eq!(service.cache().invalidation_count(), before + 1);
        assert!(!service.cache().contains(FLAGS_CACHE_KEY));

        let flags = service.list_flags()?;
        assert!(flags.iter().any(|f| f.key == "fileUpload" && f.enabled));
        Ok(())
    }

    #[test]
    fn reads_are_cached_between_writes() -> Result<(), StorageError> {
        let service = service()?;
        let loads = service.cache().load_count();
        service.list_flags()?;
        service.list_flags()?;
        assert_eq!(service.cache().load_count(), loads + 1);
        Ok(())
    }

    #[test]
    fn static_and_unknown_flags_are_rejected() -> Result<(), StorageError> {
        let service = service()?;
        let invalidations = service.cache().invalidation_count();
        assert!(matches!(
            service.update_flag("darkMode", &FlagPatch::enabled(false)),
            Err(StorageError::StaticFlag(k)) if k == "darkMode"
        ));
        assert!(matches!(
            service.update_flag("ghost", &FlagPatch::enabled(true)),
            Err(StorageError::NotFound(k)) if k == "ghost"
        ));
        assert_eq!(service.cache().invalidation_count(), invalidations, "failed writes never invalidate");
        Ok(())
    }

    #[test]
    fn invalidation_failure_does_not_undo_write() -> Result<(), StorageError> {
        let hook = Arc::new(FailingHook { calls: AtomicUsize::new(0) });
        let service = service()?.with_invalidation_hook(hook.clone());

        let record = service.update_flag("fileUpload", &FlagPatch::enabled(true))?;
        assert!(record.enabled);
        assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
        assert!(service.get_flag("fileUpload")?.is_some_and(|f| f.enabled));
        Ok(())
    }

    #[test]
    fn delete_unknown_flag() -> Result<(), StorageError> {
        let service = service()?;
        service.delete_flag("fileUpload")?;
        assert!(matches!(service.delete_flag("fileUpload"), Err(StorageError::NotFound(_))));
        Ok(())
    }
}
