use std::fmt;

use thiserror::Error;
use uplift_core::VersionId;
use uplift_store::{ConflictError, StoreError};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaintenanceAction {
    Reindex,
    RoleRemap,
}

impl MaintenanceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reindex => "reindex",
            Self::RoleRemap => "role_remap",
        }
    }

    pub(crate) fn activity(&self) -> &'static str {
        match self {
            Self::Reindex => "reindexing",
            Self::RoleRemap => "updating role mappings",
        }
    }
}

impl fmt::Display for MaintenanceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("not inside an initialized instance: run `uplift init` first")]
    NotInSite,
    #[error(transparent)]
    Conflict(ConflictError),
    #[error("upgrade from {from} to {to} failed")]
    StepFailed {
        from: VersionId,
        to: VersionId,
        #[source]
        source: BoxError,
    },
    #[error("{action} maintenance failed")]
    MaintenanceFailed {
        action: MaintenanceAction,
        #[source]
        source: BoxError,
    },
    #[error("upgrade chain revisits version {version} (path: {})", join_versions(.path))]
    CycleDetected {
        version: VersionId,
        path: Vec<VersionId>,
    },
    #[error(transparent)]
    Store(StoreError),
}

impl MigrationError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<StoreError> for MigrationError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Conflict(conflict) => Self::Conflict(conflict),
            other => Self::Store(other),
        }
    }
}

impl From<ConflictError> for MigrationError {
    fn from(value: ConflictError) -> Self {
        Self::Conflict(value)
    }
}

/// Finds a persistence conflict anywhere in an error chain.
pub(crate) fn find_conflict(err: &anyhow::Error) -> Option<ConflictError> {
    err.chain().find_map(|cause| {
        cause
            .downcast_ref::<ConflictError>()
            .cloned()
            .or_else(|| {
                cause
                    .downcast_ref::<StoreError>()
                    .and_then(StoreError::as_conflict)
                    .cloned()
            })
    })
}

fn join_versions(path: &[VersionId]) -> String {
    path.iter()
        .map(VersionId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}
