use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Another writer changed the persisted state since it was loaded.
///
/// Conflicts are never handled by the upgrade engine; callers restart the
/// whole run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("concurrent modification of {resource}: expected serial {expected}, found {found}")]
pub struct ConflictError {
    pub resource: String,
    pub expected: u64,
    pub found: u64,
}

impl ConflictError {
    pub fn new(resource: impl Into<String>, expected: u64, found: u64) -> Self {
        Self {
            resource: resource.into(),
            expected,
            found,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Conflict(#[from] ConflictError),
    #[error("failed to {action} {}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse instance state {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported instance state format {found} (expected {expected})")]
    UnsupportedFormat { found: u32, expected: u32 },
}

impl StoreError {
    pub fn as_conflict(&self) -> Option<&ConflictError> {
        match self {
            Self::Conflict(conflict) => Some(conflict),
            _ => None,
        }
    }

    pub(crate) fn io(action: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            action,
            path: path.into(),
            source,
        }
    }
}
