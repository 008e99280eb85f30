//! Derived views over a snapshot.
//!
//! Everything here is a pure function of its arguments: no I/O, no caching,
//! no mutation of the input. Views are recomputed whenever a new snapshot is
//! published.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::flag::{FlagCategory, FlagRecord};
use crate::snapshot::CacheSnapshot;
use crate::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagStatus {
    Enabled,
    Disabled,
}

impl FlagStatus {
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "enabled" => Ok(Self::Enabled),
            "disabled" => Ok(Self::Disabled),
            _ => Err(CoreError::UnknownStatus(s.to_string())),
        }
    }

    fn matches(&self, enabled: bool) -> bool {
        match self {
            Self::Enabled => enabled,
            Self::Disabled => !enabled,
        }
    }
}

impl FromStr for FlagStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Filter criteria. `None` on a dimension matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlagFilter {
    pub search: Option<String>,
    pub category: Option<FlagCategory>,
    pub status: Option<FlagStatus>,
}

impl FlagFilter {
    pub fn search(mut self, term: &str) -> Self {
        self.search = Some(term.to_string());
        self
    }

    pub fn category(mut self, category: FlagCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn status(mut self, status: FlagStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Build a filter from raw UI parameters, where an empty string or
    /// `"all"` means "no constraint".
    pub fn from_params(search: &str, category: &str, status: &str) -> Result<Self, CoreError> {
        let category = match category {
            "" | "all" => None,
            other => Some(FlagCategory::parse(other)?),
        };
        let status = match status {
            "" | "all" => None,
            other => Some(FlagStatus::parse(other)?),
        };
        let search = (!search.is_empty()).then(|| search.to_string());
        Ok(Self {
            search,
            category,
            status,
        })
    }

    pub fn matches(&self, record: &FlagRecord) -> bool {
        if let Some(category) = self.category
            && record.category != category
        {
            return false;
        }
        if let Some(status) = self.status
            && !status.matches(record.enabled)
        {
            return false;
        }
        match self.search.as_deref() {
            None | Some("") => true,
            Some(term) => {
                let needle = term.to_lowercase();
                record.name.to_lowercase().contains(&needle)
                    || record.key.to_lowercase().contains(&needle)
                    || record.description.to_lowercase().contains(&needle)
            }
        }
    }
}

/// Records matching `criteria`, in snapshot order.
pub fn filter<'a>(snapshot: &'a CacheSnapshot, criteria: &FlagFilter) -> Vec<&'a FlagRecord> {
    snapshot
        .records()
        .iter()
        .filter(|r| criteria.matches(r))
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CategoryStats {
    pub total: usize,
    pub enabled: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagStats {
    pub total: usize,
    pub enabled: usize,
    pub disabled: usize,
    /// Every category appears, including empty ones.
    pub by_category: BTreeMap<FlagCategory, CategoryStats>,
}

pub fn stats(snapshot: &CacheSnapshot) -> FlagStats {
    let mut by_category: BTreeMap<FlagCategory, CategoryStats> = FlagCategory::ALL
        .iter()
        .map(|c| (*c, CategoryStats::default()))
        .collect();
    let mut enabled = 0;

    for record in snapshot.records() {
        let entry = by_category.entry(record.category).or_default();
        entry.total += 1;
        if record.enabled {
            entry.enabled += 1;
            enabled += 1;
        }
    }

    FlagStats {
        total: snapshot.len(),
        enabled,
        disabled: snapshot.len() - enabled,
        by_category,
    }
}

/// Non-empty category groups in `FlagCategory::ALL` order; records keep
/// snapshot order within a group.
pub fn group_by_category(snapshot: &CacheSnapshot) -> Vec<(FlagCategory, Vec<&FlagRecord>)> {
    FlagCategory::ALL
        .iter()
        .filter_map(|category| {
            let members: Vec<&FlagRecord> = snapshot
                .records()
                .iter()
                .filter(|r| r.category == *category)
                .collect();
            (!members.is_empty()).then_some((*category, members))
        })
        .collect()
}
