use std::backtrace::{Backtrace, BacktraceStatus};
use std::path::Path;

use tracing::{debug, warn};
use uplift_core::{RunReport, VersionId};
use uplift_registry::{Lookup, StepContext, UpgradeRegistry, UpgradeStep};
use uplift_store::StateStore;

use crate::error::find_conflict;
use crate::{flush_report, MaintenanceAction, MigrationError, ReportSink, VersionAccessor};

/// Progress callbacks for a run, e.g. to keep a journal.
pub trait RunObserver {
    fn step_applied(&mut self, _from: &VersionId, _to: &VersionId) {}

    fn step_failed(&mut self, _from: &VersionId, _to: &VersionId, _reason: &str) {}

    fn maintenance_finished(&mut self, _action: MaintenanceAction, _succeeded: bool) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RunObserver for NoopObserver {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    StepFailed { from: VersionId, to: VersionId },
    CycleDetected { version: VersionId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOutcome {
    /// Version the chain stopped on.
    pub stopped_at: VersionId,
    pub steps_applied: usize,
    pub halted: Option<HaltReason>,
}

pub struct UpgradeEngine<'a> {
    registry: &'a UpgradeRegistry,
    versions: &'a VersionAccessor,
    root: &'a Path,
    sink: &'a dyn ReportSink,
}

impl<'a> UpgradeEngine<'a> {
    pub fn new(
        registry: &'a UpgradeRegistry,
        versions: &'a VersionAccessor,
        root: &'a Path,
        sink: &'a dyn ReportSink,
    ) -> Self {
        Self {
            registry,
            versions,
            root,
            sink,
        }
    }

    /// Applies registered steps from `start` until no step is registered for
    /// the current version.
    ///
    /// Every applied step is committed before the next one is looked up. A
    /// failing step halts the chain: with `swallow_errors` the store is
    /// aborted and the outcome records the halt, otherwise the report is
    /// flushed and the error returned. Persistence conflicts are always
    /// returned.
    pub fn run(
        &self,
        store: &mut dyn StateStore,
        start: &VersionId,
        swallow_errors: bool,
        report: &mut RunReport,
        observer: &mut dyn RunObserver,
    ) -> Result<EngineOutcome, MigrationError> {
        let mut current = start.clone();
        let mut visited = vec![current.clone()];
        let mut steps_applied = 0;

        loop {
            report.info(format!("Attempting to upgrade from: {current}"));
            let step = match self.registry.lookup(&current) {
                Lookup::NotFound => {
                    report.info(format!("Migration completed at version {current}"));
                    return Ok(EngineOutcome {
                        stopped_at: current,
                        steps_applied,
                        halted: None,
                    });
                }
                Lookup::Found(step) => step,
            };

            if visited.contains(&step.to) {
                report.error("Upgrade aborted");
                report.error(format!(
                    "Upgrade chain loops back from {} to already visited version {}",
                    step.from, step.to
                ));
                observer.step_failed(&step.from, &step.to, "cycle detected");
                warn!(from = %step.from, to = %step.to, "upgrade chain cycle detected");
                if !swallow_errors {
                    flush_report(self.sink, report);
                    return Err(MigrationError::CycleDetected {
                        version: step.to.clone(),
                        path: visited,
                    });
                }
                return Ok(EngineOutcome {
                    stopped_at: current,
                    steps_applied,
                    halted: Some(HaltReason::CycleDetected {
                        version: step.to.clone(),
                    }),
                });
            }

            debug!(from = %step.from, to = %step.to, "applying upgrade step");
            match self.apply_step(store, step, report) {
                Ok(()) => {
                    report.info(format!("Upgrade to: {}, completed", step.to));
                    observer.step_applied(&step.from, &step.to);
                    steps_applied += 1;
                    current = step.to.clone();
                    visited.push(current.clone());
                }
                Err(err) => {
                    if let Some(conflict) = find_conflict(&err) {
                        return Err(MigrationError::Conflict(conflict));
                    }

                    record_failure(report, "Upgrade aborted", &err);
                    observer.step_failed(&step.from, &step.to, &err.to_string());
                    warn!(from = %step.from, to = %step.to, error = %err, "upgrade step failed");
                    if !swallow_errors {
                        flush_report(self.sink, report);
                        return Err(MigrationError::StepFailed {
                            from: step.from.clone(),
                            to: step.to.clone(),
                            source: err.into(),
                        });
                    }

                    store.abort()?;
                    return Ok(EngineOutcome {
                        stopped_at: current,
                        steps_applied,
                        halted: Some(HaltReason::StepFailed {
                            from: step.from.clone(),
                            to: step.to.clone(),
                        }),
                    });
                }
            }
        }
    }

    fn apply_step(
        &self,
        store: &mut dyn StateStore,
        step: &UpgradeStep,
        report: &mut RunReport,
    ) -> anyhow::Result<()> {
        let messages = {
            let mut ctx = StepContext::new(self.root, &step.from, &step.to, store.state_mut());
            step.apply(&mut ctx)?
        };
        report.extend_from_step(messages);
        self.versions.set_version(store, &step.to);
        store.commit()?;
        Ok(())
    }
}

/// Appends the error, its causes and a stack trace at error severity. The
/// trace is taken at the failure site when the error carries none.
pub(crate) fn record_failure(report: &mut RunReport, headline: &str, err: &anyhow::Error) {
    report.error(headline);
    report.error(format!("Error value: {err}"));
    report.error(format!("Error detail: {:?}", err.root_cause()));
    for cause in err.chain().skip(1) {
        report.error(format!("Caused by: {cause}"));
    }
    let captured = err.backtrace();
    let trace = if captured.status() == BacktraceStatus::Captured {
        captured.to_string()
    } else {
        Backtrace::force_capture().to_string()
    };
    for line in trace.lines() {
        report.error(line.to_string());
    }
}
