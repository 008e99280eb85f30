use std::sync::Arc;
use std::time::Duration;

use crate::clock::Timestamp;
use crate::flag::FlagRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Idle,
    Loading,
    Refreshing,
    Error,
}

impl CacheState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Refreshing => "refreshing",
            Self::Error => "error",
        }
    }
}

/// An immutable, ordered copy of the flag list.
///
/// Snapshots are never edited in place. Every `with_*` method returns a new
/// snapshot; the record list is shared between snapshots that only differ in
/// their state.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSnapshot {
    records: Arc<[FlagRecord]>,
    fetched_at: Option<Timestamp>,
    state: CacheState,
    error: Option<String>,
}

impl Default for CacheSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

impl CacheSnapshot {
    pub fn empty() -> Self {
        Self {
            records: Arc::from(Vec::new()),
            fetched_at: None,
            state: CacheState::Idle,
            error: None,
        }
    }

    pub fn fetched(records: Vec<FlagRecord>, fetched_at: Timestamp) -> Self {
        Self {
            records: Arc::from(records),
            fetched_at: Some(fetched_at),
            state: CacheState::Idle,
            error: None,
        }
    }

    pub fn records(&self) -> &[FlagRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&FlagRecord> {
        self.records.iter().find(|r| r.key == key)
    }

    pub fn fetched_at(&self) -> Option<Timestamp> {
        self.fetched_at
    }

    pub fn state(&self) -> CacheState {
        self.state
    }

    /// Message of the last failed fetch while `state == Error`.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// A snapshot that has never been fetched is never fresh.
    pub fn is_fresh(&self, now: Timestamp, window: Duration) -> bool {
        match self.fetched_at {
            Some(at) => now.duration_since(at) < window,
            None => false,
        }
    }

    pub fn with_state(&self, state: CacheState) -> Self {
        Self {
            records: Arc::clone(&self.records),
            fetched_at: self.fetched_at,
            state,
            error: None,
        }
    }

    pub fn with_error(&self, message: String) -> Self {
        Self {
            records: Arc::clone(&self.records),
            fetched_at: self.fetched_at,
            state: CacheState::Error,
            error: Some(message),
        }
    }

    /// Replace the record with the same key. Returns `None` if the key is absent.
    pub fn with_record(&self, record: FlagRecord) -> Option<Self> {
        let pos = self.records.iter().position(|r| r.key == record.key)?;
        let mut records = self.records.to_vec();
        records[pos] = record;
        Some(Self {
            records: Arc::from(records),
            fetched_at: self.fetched_at,
            state: self.state,
            error: self.error.clone(),
        })
    }

    /// True when both snapshots share the same record list allocation.
    pub fn shares_records(&self, other: &CacheSnapshot) -> bool {
        Arc::ptr_eq(&self.records, &other.records)
    }
}
