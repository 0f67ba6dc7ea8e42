use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uplift_core::VersionId;

/// Everything the orchestrator persists about an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceState {
    #[serde(default = "state_format_version")]
    pub format: u32,
    /// Bumped on every commit; used to detect concurrent writers.
    #[serde(default)]
    pub serial: u64,
    #[serde(default)]
    pub version: Option<VersionId>,
    #[serde(default)]
    pub needs_reindex: bool,
    #[serde(default)]
    pub needs_role_remap: bool,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Search index: lower-cased value token to the property keys holding it.
    #[serde(default)]
    pub index: BTreeMap<String, BTreeSet<String>>,
    /// Role mappings: permission to the roles granted it.
    #[serde(default)]
    pub role_map: BTreeMap<String, BTreeSet<String>>,
}

impl Default for InstanceState {
    fn default() -> Self {
        Self {
            format: state_format_version(),
            serial: 0,
            version: None,
            needs_reindex: false,
            needs_role_remap: false,
            properties: BTreeMap::new(),
            index: BTreeMap::new(),
            role_map: BTreeMap::new(),
        }
    }
}

impl InstanceState {
    /// Compares persisted content, ignoring the commit serial.
    pub fn same_content(&self, other: &Self) -> bool {
        self.version == other.version
            && self.needs_reindex == other.needs_reindex
            && self.needs_role_remap == other.needs_role_remap
            && self.properties == other.properties
            && self.index == other.index
            && self.role_map == other.role_map
    }
}

pub fn state_format_version() -> u32 {
    1
}
