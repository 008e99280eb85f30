use std::collections::HashSet;

use serde::Deserialize;

use crate::clock::Timestamp;
use crate::flag::{FlagCategory, FlagRecord};
use crate::CoreError;

#[derive(Debug, Deserialize)]
struct StaticFlagDef {
    key: String,
    name: String,
    #[serde(default)]
    description: String,
    enabled: bool,
    category: FlagCategory,
}

/// Flags fixed at build time. They show up in listings like any other flag
/// but can never be written.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    records: Vec<FlagRecord>,
}

impl StaticCatalog {
    pub fn new(records: Vec<FlagRecord>) -> Result<Self, CoreError> {
        let mut seen = HashSet::new();
        for record in &records {
            if !seen.insert(record.key.as_str()) {
                return Err(CoreError::DuplicateKey(record.key.clone()));
            }
        }
        let records = records.into_iter().map(FlagRecord::into_static).collect();
        Ok(Self { records })
    }

    /// Parse a JSON array of `{key, name, description?, enabled, category}`.
    /// `built_at` becomes both `createdAt` and `updatedAt`.
    pub fn from_json(json: &str, built_at: Timestamp) -> Result<Self, CoreError> {
        let defs: Vec<StaticFlagDef> = serde_json::from_str(json)?;
        let records = defs
            .into_iter()
            .map(|d| FlagRecord {
                key: d.key,
                name: d.name,
                description: d.description,
                enabled: d.enabled,
                category: d.category,
                is_static: true,
                created_at: built_at,
                updated_at: built_at,
            })
            .collect();
        Self::new(records)
    }

    pub fn records(&self) -> &[FlagRecord] {
        &self.records
    }

    pub fn get(&self, key: &str) -> Option<&FlagRecord> {
        self.records.iter().find(|r| r.key == key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
