use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};
use uplift_core::{RunReport, VersionId};
use uplift_registry::UpgradeRegistry;
use uplift_store::{InstanceLayout, StateStore};

use crate::engine::record_failure;
use crate::error::find_conflict;
use crate::{
    flush_report, BatchThresholds, EngineOutcome, HaltReason, MaintenanceAction,
    MaintenanceFlags, MigrationError, Reindexer, ReportSink, RoleMapper, RunObserver,
    TracingSink, UpgradeEngine, VersionAccessor,
};

/// Where a run happens. Without an addressable root nothing may be migrated.
pub trait InstanceContext {
    fn addressable_root(&self) -> Option<&Path>;
}

impl InstanceContext for InstanceLayout {
    fn addressable_root(&self) -> Option<&Path> {
        self.is_initialized().then(|| self.root())
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticContext {
    root: Option<PathBuf>,
}

impl StaticContext {
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    pub fn detached() -> Self {
        Self { root: None }
    }
}

impl InstanceContext for StaticContext {
    fn addressable_root(&self) -> Option<&Path> {
        self.root.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Start from this version instead of the persisted stamp.
    pub force_start_version: Option<VersionId>,
    /// Discard every persisted effect once the report is built.
    pub dry_run: bool,
    /// Record step and maintenance failures in the report instead of
    /// returning them. On by default so unattended runs always finish with a
    /// report.
    pub swallow_errors: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            force_start_version: None,
            dry_run: false,
            swallow_errors: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub report: RunReport,
    pub up_to_date: bool,
    pub dry_run: bool,
    pub started_from: VersionId,
    pub stopped_at: VersionId,
    pub steps_applied: usize,
    pub halted: Option<HaltReason>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub instance_version: VersionId,
    pub codebase_version: VersionId,
    pub needs_upgrade: bool,
    pub maintenance: MaintenanceFlags,
    pub known_versions: BTreeSet<VersionId>,
}

pub struct MigrationController {
    context: Box<dyn InstanceContext>,
    registry: Arc<UpgradeRegistry>,
    versions: VersionAccessor,
    reindexer: Option<Box<dyn Reindexer>>,
    role_mapper: Option<Box<dyn RoleMapper>>,
    rebuild_thresholds: BatchThresholds,
    sink: Arc<dyn ReportSink>,
}

impl MigrationController {
    pub fn builder(
        registry: Arc<UpgradeRegistry>,
        codebase_version: impl Into<VersionId>,
    ) -> MigrationControllerBuilder {
        MigrationControllerBuilder {
            context: None,
            registry,
            versions: VersionAccessor::new(codebase_version),
            reindexer: None,
            role_mapper: None,
            rebuild_thresholds: BatchThresholds::full_rebuild(),
            sink: None,
        }
    }

    pub fn versions(&self) -> &VersionAccessor {
        &self.versions
    }

    pub fn registry(&self) -> &UpgradeRegistry {
        &self.registry
    }

    pub fn needs_upgrade(&self, store: &mut dyn StateStore) -> Result<bool, MigrationError> {
        Ok(self.versions.needs_upgrade(store)?)
    }

    pub fn needs_reindex(&self, store: &dyn StateStore) -> bool {
        store.state().needs_reindex
    }

    pub fn needs_role_remap(&self, store: &dyn StateStore) -> bool {
        store.state().needs_role_remap
    }

    pub fn known_versions(
        &self,
        store: &mut dyn StateStore,
    ) -> Result<BTreeSet<VersionId>, MigrationError> {
        let current = self.versions.current_version(store)?;
        Ok(self.registry.known_versions(&current))
    }

    pub fn status(&self, store: &mut dyn StateStore) -> Result<StatusSummary, MigrationError> {
        let instance_version = self.versions.current_version(store)?;
        Ok(StatusSummary {
            needs_upgrade: instance_version != *self.versions.codebase_version(),
            known_versions: self.registry.known_versions(&instance_version),
            instance_version,
            codebase_version: self.versions.codebase_version().clone(),
            maintenance: MaintenanceFlags::load(store.state()),
        })
    }

    /// Runs the upgrade chain followed by any owed maintenance.
    pub fn upgrade(
        &mut self,
        store: &mut dyn StateStore,
        options: &RunOptions,
        observer: &mut dyn RunObserver,
    ) -> Result<RunOutcome, MigrationError> {
        let Some(root) = self.context.addressable_root().map(Path::to_path_buf) else {
            return Err(MigrationError::NotInSite);
        };

        let mut report = RunReport::new();
        if options.dry_run {
            report.info("Dry run selected.");
        }
        store.begin_run(options.dry_run)?;

        match self.run_chain(store, options, &root, &mut report, observer) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                if let Err(abort_err) = store.abort() {
                    warn!(error = %abort_err, "failed to abort pending changes after a failed run");
                }
                if let Err(finish_err) = store.finish_run() {
                    warn!(error = %finish_err, "failed to close the run after a failed run");
                }
                if matches!(
                    err,
                    MigrationError::Conflict(_) | MigrationError::Store(_)
                ) {
                    flush_report(self.sink.as_ref(), &report);
                }
                Err(err)
            }
        }
    }

    fn run_chain(
        &mut self,
        store: &mut dyn StateStore,
        options: &RunOptions,
        root: &Path,
        report: &mut RunReport,
        observer: &mut dyn RunObserver,
    ) -> Result<RunOutcome, MigrationError> {
        let started_from = match &options.force_start_version {
            Some(forced) => forced.clone(),
            None => self.versions.current_version(store)?,
        };
        report.info(format!("Starting the migration from version: {started_from}"));
        info!(from = %started_from, dry_run = options.dry_run, "starting migration run");

        let engine = UpgradeEngine::new(
            &self.registry,
            &self.versions,
            root,
            self.sink.as_ref(),
        );
        let EngineOutcome {
            stopped_at,
            steps_applied,
            halted,
        } = engine.run(
            store,
            &started_from,
            options.swallow_errors,
            report,
            observer,
        )?;
        report.info("End of upgrade path, migration has finished");

        let up_to_date = !self.versions.needs_upgrade(store)?;
        if up_to_date {
            report.info("Your instance and codebase are now up-to-date.");
        } else {
            report.error("The upgrade path did NOT reach current version");
            report.error("Migration has failed");
        }

        self.run_maintenance(store, MaintenanceAction::Reindex, options, report, observer)?;
        self.run_maintenance(store, MaintenanceAction::RoleRemap, options, report, observer)?;

        if options.dry_run {
            report.info("Dry run selected, transaction aborted");
            store.rollback_run()?;
        } else {
            store.finish_run()?;
        }

        flush_report(self.sink.as_ref(), report);
        Ok(RunOutcome {
            report: report.clone(),
            up_to_date,
            dry_run: options.dry_run,
            started_from,
            stopped_at,
            steps_applied,
            halted,
        })
    }

    fn run_maintenance(
        &mut self,
        store: &mut dyn StateStore,
        action: MaintenanceAction,
        options: &RunOptions,
        report: &mut RunReport,
        observer: &mut dyn RunObserver,
    ) -> Result<(), MigrationError> {
        if !MaintenanceFlags::is_set(store.state(), action) {
            return Ok(());
        }

        let result = match action {
            MaintenanceAction::Reindex => match self.reindexer.as_deref_mut() {
                Some(reindexer) => {
                    rebuild_index(reindexer, self.rebuild_thresholds, store)
                }
                None => {
                    report.warning("No reindex collaborator configured; reindex is still owed");
                    return Ok(());
                }
            },
            MaintenanceAction::RoleRemap => match self.role_mapper.as_deref_mut() {
                Some(mapper) => mapper.recompute_role_mappings(store.state_mut()),
                None => {
                    report.warning(
                        "No role mapping collaborator configured; role remap is still owed",
                    );
                    return Ok(());
                }
            },
        };

        match result {
            Ok(()) => {
                MaintenanceFlags::clear(store.state_mut(), action);
                store.commit()?;
                report.info(format!("Finished {}", action.activity()));
                observer.maintenance_finished(action, true);
                Ok(())
            }
            Err(err) => {
                if let Some(conflict) = find_conflict(&err) {
                    return Err(MigrationError::Conflict(conflict));
                }

                store.abort()?;
                record_failure(
                    report,
                    &format!("Exception was thrown while {}", action.activity()),
                    &err,
                );
                observer.maintenance_finished(action, false);
                warn!(action = %action, error = %err, "maintenance failed");
                if !options.swallow_errors {
                    flush_report(self.sink.as_ref(), report);
                    return Err(MigrationError::MaintenanceFailed {
                        action,
                        source: err.into(),
                    });
                }
                Ok(())
            }
        }
    }
}

/// Full index refresh with widened batches; previous batch sizes are restored
/// whether or not the refresh succeeds.
pub(crate) fn rebuild_index(
    reindexer: &mut dyn Reindexer,
    widened: BatchThresholds,
    store: &mut dyn StateStore,
) -> anyhow::Result<()> {
    let previous = reindexer.thresholds();
    reindexer.set_thresholds(widened);
    let result = reindexer.refresh_index(store.state_mut(), true);
    reindexer.set_thresholds(previous);
    result
}

pub struct MigrationControllerBuilder {
    context: Option<Box<dyn InstanceContext>>,
    registry: Arc<UpgradeRegistry>,
    versions: VersionAccessor,
    reindexer: Option<Box<dyn Reindexer>>,
    role_mapper: Option<Box<dyn RoleMapper>>,
    rebuild_thresholds: BatchThresholds,
    sink: Option<Arc<dyn ReportSink>>,
}

impl MigrationControllerBuilder {
    pub fn context(mut self, context: impl InstanceContext + 'static) -> Self {
        self.context = Some(Box::new(context));
        self
    }

    pub fn reindexer(mut self, reindexer: impl Reindexer + 'static) -> Self {
        self.reindexer = Some(Box::new(reindexer));
        self
    }

    pub fn role_mapper(mut self, mapper: impl RoleMapper + 'static) -> Self {
        self.role_mapper = Some(Box::new(mapper));
        self
    }

    pub fn rebuild_thresholds(mut self, thresholds: BatchThresholds) -> Self {
        self.rebuild_thresholds = thresholds;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> MigrationController {
        MigrationController {
            context: self
                .context
                .unwrap_or_else(|| Box::new(StaticContext::detached())),
            registry: self.registry,
            versions: self.versions,
            reindexer: self.reindexer,
            role_mapper: self.role_mapper,
            rebuild_thresholds: self.rebuild_thresholds,
            sink: self.sink.unwrap_or_else(|| Arc::new(TracingSink)),
        }
    }
}
