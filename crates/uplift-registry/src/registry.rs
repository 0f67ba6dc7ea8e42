use std::collections::{BTreeSet, HashMap, HashSet};

use uplift_core::{StepMessage, VersionId};

use crate::{StepContext, UpgradeStep};

#[derive(Debug)]
pub enum Lookup<'a> {
    Found(&'a UpgradeStep),
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEnd {
    /// No step is registered for this version.
    Terminal(VersionId),
    /// The walk came back to this version.
    Cycle(VersionId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainWalk {
    /// Every version the walk stood on, starting version first.
    pub path: Vec<VersionId>,
    pub end: ChainEnd,
}

impl ChainWalk {
    pub fn step_count(&self) -> usize {
        self.path.len().saturating_sub(1)
    }
}

/// Mapping from a source version to the single step that leaves it.
///
/// Built once at startup and shared read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct UpgradeRegistry {
    steps: HashMap<VersionId, UpgradeStep>,
}

impl UpgradeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> UpgradeRegistryBuilder {
        UpgradeRegistryBuilder::default()
    }

    /// Registers every step in order; later steps for the same source win.
    pub fn initialize(steps: impl IntoIterator<Item = UpgradeStep>) -> Self {
        let mut registry = Self::new();
        for step in steps {
            registry.register_step(step);
        }
        registry
    }

    pub fn register<F>(
        &mut self,
        from: impl Into<VersionId>,
        to: impl Into<VersionId>,
        run: F,
    ) -> Option<UpgradeStep>
    where
        F: Fn(&mut StepContext<'_>) -> anyhow::Result<Vec<StepMessage>> + Send + Sync + 'static,
    {
        self.register_step(UpgradeStep::new(from, to, run))
    }

    /// Returns the step that was replaced, if any.
    pub fn register_step(&mut self, step: UpgradeStep) -> Option<UpgradeStep> {
        self.steps.insert(step.from.clone(), step)
    }

    pub fn lookup(&self, version: &VersionId) -> Lookup<'_> {
        match self.steps.get(version) {
            Some(step) => Lookup::Found(step),
            None => Lookup::NotFound,
        }
    }

    pub fn versions(&self) -> BTreeSet<VersionId> {
        self.steps.keys().cloned().collect()
    }

    pub fn known_versions(&self, current: &VersionId) -> BTreeSet<VersionId> {
        self.steps
            .keys()
            .filter(|version| *version != current)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Follows the registered chain without running any step.
    pub fn chain_from(&self, start: &VersionId) -> ChainWalk {
        let mut path = vec![start.clone()];
        let mut seen = HashSet::from([start.clone()]);
        let mut current = start.clone();

        loop {
            let Lookup::Found(step) = self.lookup(&current) else {
                return ChainWalk {
                    path,
                    end: ChainEnd::Terminal(current),
                };
            };
            if !seen.insert(step.to.clone()) {
                return ChainWalk {
                    path,
                    end: ChainEnd::Cycle(step.to.clone()),
                };
            }
            path.push(step.to.clone());
            current = step.to.clone();
        }
    }

    /// Registered versions whose chain never terminates.
    pub fn find_cycles(&self) -> BTreeSet<VersionId> {
        self.steps
            .keys()
            .filter(|version| matches!(self.chain_from(version).end, ChainEnd::Cycle(_)))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct UpgradeRegistryBuilder {
    steps: Vec<UpgradeStep>,
}

impl UpgradeRegistryBuilder {
    pub fn register<F>(mut self, from: impl Into<VersionId>, to: impl Into<VersionId>, run: F) -> Self
    where
        F: Fn(&mut StepContext<'_>) -> anyhow::Result<Vec<StepMessage>> + Send + Sync + 'static,
    {
        self.steps.push(UpgradeStep::new(from, to, run));
        self
    }

    pub fn step(mut self, step: UpgradeStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn build(self) -> UpgradeRegistry {
        UpgradeRegistry::initialize(self.steps)
    }
}
