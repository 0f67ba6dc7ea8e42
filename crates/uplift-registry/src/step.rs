use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use uplift_core::{StepMessage, VersionId};
use uplift_store::InstanceState;

pub type StepFn =
    Arc<dyn Fn(&mut StepContext<'_>) -> anyhow::Result<Vec<StepMessage>> + Send + Sync>;

/// One registered transformation from `from` to `to`.
#[derive(Clone)]
pub struct UpgradeStep {
    pub from: VersionId,
    pub to: VersionId,
    run: StepFn,
}

impl UpgradeStep {
    pub fn new<F>(from: impl Into<VersionId>, to: impl Into<VersionId>, run: F) -> Self
    where
        F: Fn(&mut StepContext<'_>) -> anyhow::Result<Vec<StepMessage>> + Send + Sync + 'static,
    {
        Self {
            from: from.into(),
            to: to.into(),
            run: Arc::new(run),
        }
    }

    pub fn apply(&self, ctx: &mut StepContext<'_>) -> anyhow::Result<Vec<StepMessage>> {
        (self.run)(ctx)
    }
}

impl fmt::Debug for UpgradeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradeStep")
            .field("from", &self.from)
            .field("to", &self.to)
            .finish_non_exhaustive()
    }
}

/// What a running step may see and change.
///
/// The version stamp is deliberately absent: the engine owns it.
pub struct StepContext<'a> {
    root: &'a Path,
    from: &'a VersionId,
    to: &'a VersionId,
    state: &'a mut InstanceState,
}

impl<'a> StepContext<'a> {
    pub fn new(
        root: &'a Path,
        from: &'a VersionId,
        to: &'a VersionId,
        state: &'a mut InstanceState,
    ) -> Self {
        Self {
            root,
            from,
            to,
            state,
        }
    }

    pub fn root(&self) -> &Path {
        self.root
    }

    pub fn from_version(&self) -> &VersionId {
        self.from
    }

    pub fn to_version(&self) -> &VersionId {
        self.to
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.state.properties
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.state.properties.get(key).map(String::as_str)
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.state.properties.insert(key.into(), value.into())
    }

    pub fn remove_property(&mut self, key: &str) -> Option<String> {
        self.state.properties.remove(key)
    }

    pub fn request_reindex(&mut self) {
        self.state.needs_reindex = true;
    }

    pub fn request_role_remap(&mut self) {
        self.state.needs_role_remap = true;
    }
}
