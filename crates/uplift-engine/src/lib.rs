//! Upgrade engine and migration run controller.
//!
//! The [`UpgradeEngine`] walks the registered step chain starting at some
//! version, one committed step at a time, until no further step is
//! registered. The [`MigrationController`] wraps a run with precondition
//! checks, the post-chain reindex and role remap, dry-run rollback and report
//! flushing.

mod accessor;
mod controller;
mod engine;
mod error;
mod flags;
mod maintenance;
mod sink;

pub use accessor::VersionAccessor;
pub use controller::{
    InstanceContext, MigrationController, MigrationControllerBuilder, RunOptions, RunOutcome,
    StaticContext, StatusSummary,
};
pub use engine::{EngineOutcome, HaltReason, NoopObserver, RunObserver, UpgradeEngine};
pub use error::{MaintenanceAction, MigrationError};
pub use flags::MaintenanceFlags;
pub use maintenance::{
    BatchThresholds, PropertyIndexer, PropertyRoleMapper, Reindexer, RoleMapper,
};
pub use sink::{flush_report, MemorySink, ReportSink, TracingSink};
