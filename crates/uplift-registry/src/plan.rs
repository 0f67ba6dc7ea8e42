use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use uplift_core::{StepMessage, VersionId};

use crate::{UpgradeRegistry, UpgradeStep};

/// A step described as data, as found in `[[steps]]` tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepPlan {
    pub from: VersionId,
    pub to: VersionId,
    #[serde(default)]
    pub messages: Vec<StepMessage>,
    #[serde(default)]
    pub set_properties: BTreeMap<String, String>,
    #[serde(default)]
    pub remove_properties: Vec<String>,
    #[serde(default)]
    pub needs_reindex: bool,
    #[serde(default)]
    pub needs_role_remap: bool,
    /// Makes the step fail after applying its edits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail: Option<String>,
}

impl StepPlan {
    pub fn validate(&self) -> Result<()> {
        if self.from.is_empty() || self.to.is_empty() {
            bail!("upgrade step versions must not be empty");
        }
        if self.from == self.to {
            bail!("upgrade step '{}' must not target its own version", self.from);
        }
        for key in self.set_properties.keys().chain(self.remove_properties.iter()) {
            if key.trim().is_empty() {
                return Err(anyhow!(
                    "upgrade step '{}' -> '{}' names an empty property",
                    self.from,
                    self.to
                ));
            }
        }
        Ok(())
    }

    pub fn into_step(self) -> UpgradeStep {
        let from = self.from.clone();
        let to = self.to.clone();
        UpgradeStep::new(from, to, move |ctx| {
            for (key, value) in &self.set_properties {
                ctx.set_property(key.clone(), value.clone());
            }
            for key in &self.remove_properties {
                ctx.remove_property(key);
            }
            if self.needs_reindex {
                ctx.request_reindex();
            }
            if self.needs_role_remap {
                ctx.request_role_remap();
            }
            if let Some(reason) = &self.fail {
                bail!("{reason}");
            }
            Ok(self.messages.clone())
        })
    }
}

/// Validates every plan and registers them in declaration order.
pub fn registry_from_plans(plans: impl IntoIterator<Item = StepPlan>) -> Result<UpgradeRegistry> {
    let mut registry = UpgradeRegistry::new();
    for (index, plan) in plans.into_iter().enumerate() {
        plan.validate()
            .with_context(|| format!("invalid upgrade step #{}", index + 1))?;
        registry.register_step(plan.into_step());
    }
    Ok(registry)
}
