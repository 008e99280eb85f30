use std::time::Duration;

use serde::Deserialize;

use crate::error::EngineError;
use crate::retry::RetryPolicy;

/// What to do when a flag is mutated while a mutation for the same key is
/// still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SameKeyPolicy {
    /// Fail fast with `MutationInFlight`.
    #[default]
    Reject,
    /// Wait for the in-flight mutation, then derive the new value from the
    /// settled snapshot.
    Queue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// In-process publish/subscribe channel.
    #[default]
    Channel,
    /// Shared persistent key with a change feed.
    Storage,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub stale_after_ms: u64,
    pub gc_after_ms: u64,
    pub retry: RetryPolicy,
    pub same_key_policy: SameKeyPolicy,
    pub transport: TransportKind,
    pub broadcast_clear_after_ms: u64,
    pub broadcast_key: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stale_after_ms: 30_000,
            gc_after_ms: 300_000,
            retry: RetryPolicy::default(),
            same_key_policy: SameKeyPolicy::default(),
            transport: TransportKind::default(),
            broadcast_clear_after_ms: 100,
            broadcast_key: "feature-flags-update".to_string(),
        }
    }
}

impl EngineConfig {
    /// Parse a JSON object; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        let config: Self = serde_json::from_str(json).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.broadcast_key.is_empty() {
            return Err(EngineError::Config("broadcast_key must not be empty".into()));
        }
        if self.retry.factor == 0 {
            return Err(EngineError::Config("retry.factor must be at least 1".into()));
        }
        if self.gc_after_ms < self.stale_after_ms {
            return Err(EngineError::Config("gc_after_ms must not be shorter than stale_after_ms".into()));
        }
        Ok(())
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn gc_after(&self) -> Duration {
        Duration::from_millis(self.gc_after_ms)
    }

    pub fn broadcast_clear_after(&self) -> Duration {
        Duration::from_millis(self.broadcast_clear_after_ms)
    }
}
