use uplift_core::{VersionId, VersionTuple};
use uplift_store::{StateStore, StoreError};

/// Reads and writes the instance version stamp against a fixed codebase version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionAccessor {
    codebase: VersionId,
}

impl VersionAccessor {
    pub fn new(codebase: impl Into<VersionId>) -> Self {
        Self {
            codebase: codebase.into(),
        }
    }

    pub fn codebase_version(&self) -> &VersionId {
        &self.codebase
    }

    /// Returns the persisted stamp. An instance that was never stamped is
    /// stamped with the codebase version first.
    pub fn current_version(&self, store: &mut dyn StateStore) -> Result<VersionId, StoreError> {
        if let Some(version) = &store.state().version {
            return Ok(version.clone());
        }

        store.state_mut().version = Some(self.codebase.clone());
        store.commit()?;
        tracing::debug!(version = %self.codebase, "stamped unversioned instance");
        Ok(self.codebase.clone())
    }

    /// Stages a new stamp; it is persisted by the next commit.
    pub fn set_version(&self, store: &mut dyn StateStore, version: &VersionId) {
        store.state_mut().version = Some(version.clone());
    }

    pub fn needs_upgrade(&self, store: &mut dyn StateStore) -> Result<bool, StoreError> {
        Ok(self.current_version(store)? != self.codebase)
    }

    pub fn as_tuple(version: &str) -> anyhow::Result<VersionTuple> {
        VersionTuple::parse(version)
    }
}
