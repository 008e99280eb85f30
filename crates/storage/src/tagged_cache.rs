use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::StorageError;

/// Called by the authoritative write path after a successful write.
pub trait InvalidationHook: Send + Sync {
    fn invalidate(&self, tags: &[String]) -> Result<(), StorageError>;
}

struct CacheEntry {
    payload: String,
    tags: BTreeSet<String>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// Bumped each time a tag is invalidated.
    generations: HashMap<String, u64>,
}

impl CacheState {
    fn generation_of(&self, tags: &[&str]) -> u64 {
        tags.iter()
            .map(|t| self.generations.get(*t).copied().unwrap_or(0))
            .sum()
    }
}

/// Server-side read cache. Entries are stored serialized and carry tags;
/// invalidating a tag drops every entry that has it, including loads that
/// were still running when the tag was invalidated.
#[derive(Default)]
pub struct TaggedCache {
    state: Mutex<CacheState>,
    invalidations: AtomicU64,
    loads: AtomicU64,
}

impl TaggedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached value for `key`, or run `loader` and cache its
    /// result under `tags`. Loader errors are not cached.
    pub fn get_or_load<T, F>(&self, key: &str, tags: &[&str], loader: F) -> Result<T, StorageError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T, StorageError>,
    {
        let generation = {
            let state = self.state.lock();
            if let Some(entry) = state.entries.get(key) {
                return Ok(serde_json::from_str(&entry.payload)?);
            }
            state.generation_of(tags)
        };

        let value = loader()?;
        self.loads.fetch_add(1, Ordering::Relaxed);
        let payload = serde_json::to_string(&value)?;

        let mut state = self.state.lock();
        if state.generation_of(tags) != generation {
            debug!(key = %key, "tags invalidated during load, not caching");
            return Ok(value);
        }
        state.entries.insert(
            key.to_string(),
            CacheEntry {
                payload,
                tags: tags.iter().map(|t| t.to_string()).collect(),
            },
        );
        Ok(value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `invalidate` calls so far.
    pub fn invalidation_count(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }

    /// Number of loader runs (cache misses) so far.
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }
}

impl InvalidationHook for TaggedCache {
    fn invalidate(&self, tags: &[String]) -> Result<(), StorageError> {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        for tag in tags {
            *state.generations.entry(tag.clone()).or_default() += 1;
        }
        let before = state.entries.len();
        state
            .entries
            .retain(|_, entry| !tags.iter().any(|t| entry.tags.contains(t)));
        debug!(?tags, evicted = before - state.entries.len(), "invalidated cache tags");
        Ok(())
    }
}
