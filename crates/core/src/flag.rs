use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagCategory {
    Core,
    Module,
    Experimental,
    Admin,
    Ui,
}

impl FlagCategory {
    pub const ALL: [FlagCategory; 5] = [
        Self::Core,
        Self::Module,
        Self::Experimental,
        Self::Admin,
        Self::Ui,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Core => "core",
            Self::Module => "module",
            Self::Experimental => "experimental",
            Self::Admin => "admin",
            Self::Ui => "ui",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "core" => Ok(Self::Core),
            "module" => Ok(Self::Module),
            "experimental" => Ok(Self::Experimental),
            "admin" => Ok(Self::Admin),
            "ui" => Ok(Self::Ui),
            _ => Err(CoreError::UnknownCategory(s.to_string())),
        }
    }
}

impl FromStr for FlagCategory {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for FlagCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One named toggle. `key` is the identity; everything except `enabled`
/// and `updated_at` passes through the engine untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagRecord {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub enabled: bool,
    pub category: FlagCategory,
    #[serde(default)]
    pub is_static: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl FlagRecord {
    pub fn new(key: &str, name: &str, category: FlagCategory, enabled: bool, now: Timestamp) -> Self {
        Self {
            key: key.to_string(),
            name: name.to_string(),
            description: String::new(),
            enabled,
            category,
            is_static: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn into_static(mut self) -> Self {
        self.is_static = true;
        self
    }

    /// Produce the patched record. `updated_at` always moves strictly forward,
    /// even when the clock has not ticked since the last write.
    pub fn patched(&self, patch: &FlagPatch, now: Timestamp) -> Self {
        let mut next = self.clone();
        next.enabled = patch.enabled;
        next.updated_at = now.max(self.updated_at.next());
        next
    }
}

/// The single-field change a client may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagPatch {
    pub enabled: bool,
}

impl FlagPatch {
    pub fn enabled(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn toggle_of(record: &FlagRecord) -> Self {
        Self {
            enabled: !record.enabled,
        }
    }

    pub fn changes(&self, record: &FlagRecord) -> bool {
        self.enabled != record.enabled
    }
}
