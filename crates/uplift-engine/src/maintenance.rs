use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uplift_store::InstanceState;

/// Batch sizes used while rebuilding the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchThresholds {
    pub threshold: u32,
    pub pg_threshold: u32,
}

impl BatchThresholds {
    /// Wide batches used for a full rebuild after an upgrade.
    pub fn full_rebuild() -> Self {
        Self {
            threshold: 2000,
            pg_threshold: 300,
        }
    }
}

impl Default for BatchThresholds {
    fn default() -> Self {
        Self {
            threshold: 200,
            pg_threshold: 0,
        }
    }
}

pub trait Reindexer {
    fn thresholds(&self) -> BatchThresholds;

    fn set_thresholds(&mut self, thresholds: BatchThresholds);

    fn refresh_index(&mut self, state: &mut InstanceState, clear: bool) -> Result<()>;
}

pub trait RoleMapper {
    fn recompute_role_mappings(&mut self, state: &mut InstanceState) -> Result<()>;
}

/// Indexes property values by lower-cased word token.
#[derive(Debug, Clone, Default)]
pub struct PropertyIndexer {
    thresholds: BatchThresholds,
}

impl PropertyIndexer {
    pub fn new(thresholds: BatchThresholds) -> Self {
        Self { thresholds }
    }
}

impl Reindexer for PropertyIndexer {
    fn thresholds(&self) -> BatchThresholds {
        self.thresholds
    }

    fn set_thresholds(&mut self, thresholds: BatchThresholds) {
        self.thresholds = thresholds;
    }

    fn refresh_index(&mut self, state: &mut InstanceState, clear: bool) -> Result<()> {
        if self.thresholds.threshold == 0 {
            bail!("index batch threshold must be positive");
        }

        let mut index = if clear {
            BTreeMap::new()
        } else {
            std::mem::take(&mut state.index)
        };
        let batch = self.thresholds.threshold as usize;
        for (position, (key, value)) in state.properties.iter().enumerate() {
            for token in tokenize(value) {
                index
                    .entry(token)
                    .or_insert_with(BTreeSet::new)
                    .insert(key.clone());
            }
            if (position + 1) % batch == 0 {
                debug!(indexed = position + 1, "index batch complete");
            }
        }

        state.index = index;
        Ok(())
    }
}

fn tokenize(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
}

/// Builds permission-to-role mappings from `role.<name>` properties whose
/// values list permissions separated by commas.
#[derive(Debug, Clone, Copy, Default)]
pub struct PropertyRoleMapper;

impl RoleMapper for PropertyRoleMapper {
    fn recompute_role_mappings(&mut self, state: &mut InstanceState) -> Result<()> {
        let mut role_map: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (key, value) in &state.properties {
            let Some(role) = key.strip_prefix("role.") else {
                continue;
            };
            if role.is_empty() {
                bail!("role property '{key}' names no role");
            }
            for permission in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                role_map
                    .entry(permission.to_string())
                    .or_default()
                    .insert(role.to_string());
            }
        }

        state.role_map = role_map;
        Ok(())
    }
}
