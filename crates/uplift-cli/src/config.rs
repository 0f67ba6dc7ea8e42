use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use uplift_core::VersionId;
use uplift_engine::BatchThresholds;
use uplift_registry::{registry_from_plans, StepPlan, UpgradeRegistry};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct UpliftConfig {
    #[serde(default = "config_file_version")]
    pub(crate) version: u32,
    #[serde(default)]
    pub(crate) codebase: CodebaseSection,
    #[serde(default)]
    pub(crate) run: RunSection,
    #[serde(default)]
    pub(crate) reindex: ReindexSection,
    #[serde(default)]
    pub(crate) steps: Vec<StepPlan>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct CodebaseSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) version: Option<VersionId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RunSection {
    #[serde(default = "default_swallow_errors")]
    pub(crate) swallow_errors: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ReindexSection {
    #[serde(default = "default_rebuild_threshold")]
    pub(crate) threshold: u32,
    #[serde(default = "default_rebuild_pg_threshold")]
    pub(crate) pg_threshold: u32,
}

/// Files written before the `version` key existed carried only the codebase
/// version and the step list.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UpliftConfigLegacy {
    #[serde(default)]
    codebase_version: Option<VersionId>,
    #[serde(default)]
    steps: Vec<StepPlan>,
}

impl Default for UpliftConfig {
    fn default() -> Self {
        Self {
            version: config_file_version(),
            codebase: CodebaseSection::default(),
            run: RunSection::default(),
            reindex: ReindexSection::default(),
            steps: Vec::new(),
        }
    }
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            swallow_errors: default_swallow_errors(),
        }
    }
}

impl Default for ReindexSection {
    fn default() -> Self {
        Self {
            threshold: default_rebuild_threshold(),
            pg_threshold: default_rebuild_pg_threshold(),
        }
    }
}

impl ReindexSection {
    pub(crate) fn thresholds(&self) -> BatchThresholds {
        BatchThresholds {
            threshold: self.threshold,
            pg_threshold: self.pg_threshold,
        }
    }
}

impl UpliftConfig {
    pub(crate) fn registry(&self) -> Result<UpgradeRegistry> {
        registry_from_plans(self.steps.iter().cloned())
    }

    /// Source versions declared by more than one step; the last one wins.
    pub(crate) fn duplicate_sources(&self) -> Vec<VersionId> {
        let mut counts: BTreeMap<&VersionId, usize> = BTreeMap::new();
        for step in &self.steps {
            *counts.entry(&step.from).or_default() += 1;
        }
        counts
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(version, _)| version.clone())
            .collect()
    }
}

pub(crate) fn load_config(path: &Path) -> Result<UpliftConfig> {
    if !path.exists() {
        return Ok(UpliftConfig::default());
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("failed reading config: {}", path.display()))?;
    parse_config(&content).with_context(|| format!("invalid config: {}", path.display()))
}

/// Top-level keys that only the versioned layout knows about.
const VERSIONED_KEYS: [&str; 4] = ["version", "codebase", "run", "reindex"];

pub(crate) fn parse_config(content: &str) -> Result<UpliftConfig> {
    let value = toml::from_str::<toml::Value>(content)?;
    let versioned = VERSIONED_KEYS.iter().any(|key| value.get(key).is_some());
    let mut config = if versioned {
        let parsed = value
            .try_into::<UpliftConfig>()
            .context("failed parsing versioned config")?;
        let expected = config_file_version();
        if parsed.version != expected {
            anyhow::bail!(
                "unsupported config version {} (expected {}): update uplift.toml to version {}",
                parsed.version,
                expected,
                expected
            );
        }
        parsed
    } else {
        let parsed = value
            .try_into::<UpliftConfigLegacy>()
            .context("failed parsing legacy config")?;
        UpliftConfig {
            codebase: CodebaseSection {
                version: parsed.codebase_version,
            },
            steps: parsed.steps,
            ..UpliftConfig::default()
        }
    };

    for (index, step) in config.steps.iter().enumerate() {
        step.validate()
            .with_context(|| format!("invalid upgrade step #{}", index + 1))?;
    }
    if config.reindex.threshold == 0 {
        anyhow::bail!("reindex threshold must be positive");
    }
    config.version = config_file_version();
    Ok(config)
}

pub(crate) fn write_config(path: &Path, config: &UpliftConfig) -> Result<()> {
    let content = toml::to_string(config).context("failed serializing config")?;
    fs::write(path, content).with_context(|| format!("failed writing config: {}", path.display()))
}

pub(crate) fn config_file_version() -> u32 {
    1
}

fn default_swallow_errors() -> bool {
    true
}

fn default_rebuild_threshold() -> u32 {
    BatchThresholds::full_rebuild().threshold
}

fn default_rebuild_pg_threshold() -> u32 {
    BatchThresholds::full_rebuild().pg_threshold
}
