use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tracing::{debug, warn};
use uplift_core::{RunReport, VersionId};
use uplift_engine::{
    HaltReason, MaintenanceAction, MigrationController, PropertyIndexer, PropertyRoleMapper,
    RunObserver, RunOptions, RunOutcome, StatusSummary,
};
use uplift_registry::{ChainEnd, ChainWalk, UpgradeRegistry};
use uplift_store::{
    begin_run_transaction, clear_active_run, current_unix_timestamp, default_instance_root,
    read_active_run, read_run_metadata, update_run_status, FileStateStore, InstanceLayout,
    RunJournal, RunStatus, StateStore,
};

use crate::config::{load_config, write_config, UpliftConfig};

/// Instance layout plus the configuration and codebase version that apply to it.
#[derive(Debug, Clone)]
pub(crate) struct InstanceSession {
    pub(crate) layout: InstanceLayout,
    pub(crate) config_path: PathBuf,
    pub(crate) config: UpliftConfig,
    pub(crate) codebase_version: Option<VersionId>,
}

pub(crate) fn open_session(
    instance: Option<&Path>,
    config: Option<&Path>,
    codebase_override: Option<&str>,
) -> Result<InstanceSession> {
    let root = match instance {
        Some(root) => root.to_path_buf(),
        None => default_instance_root()?,
    };
    let layout = InstanceLayout::new(root);
    let config_path = config
        .map(Path::to_path_buf)
        .unwrap_or_else(|| layout.config_path());
    let config = load_config(&config_path)?;
    let codebase_version = codebase_override
        .map(VersionId::new)
        .or_else(|| config.codebase.version.clone());

    Ok(InstanceSession {
        layout,
        config_path,
        config,
        codebase_version,
    })
}

impl InstanceSession {
    pub(crate) fn codebase_version(&self) -> Result<VersionId> {
        self.codebase_version.clone().ok_or_else(|| {
            anyhow!(
                "no codebase version configured: set [codebase] version in {} or pass --codebase-version",
                self.config_path.display()
            )
        })
    }

    pub(crate) fn ensure_initialized(&self) -> Result<()> {
        if !self.layout.is_initialized() {
            anyhow::bail!(
                "instance at {} is not initialized: run `uplift init` first",
                self.layout.root().display()
            );
        }
        Ok(())
    }

    pub(crate) fn controller(&self) -> Result<MigrationController> {
        let registry = self.config.registry()?;
        Ok(
            MigrationController::builder(Arc::new(registry), self.codebase_version()?)
                .context(self.layout.clone())
                .reindexer(PropertyIndexer::default())
                .role_mapper(PropertyRoleMapper)
                .rebuild_thresholds(self.config.reindex.thresholds())
                .build(),
        )
    }

    fn stamped_version(&self) -> Result<Option<VersionId>> {
        if !self.layout.is_initialized() {
            return Ok(None);
        }
        let store = FileStateStore::open(&self.layout)?;
        Ok(store.committed().version.clone())
    }
}

/// Runs `run` inside a claimed run transaction. The closure returns the final
/// status to record; errors mark the run failed. The active marker is released
/// either way because every applied step is already durable.
pub(crate) fn execute_with_run_transaction<T, F>(
    layout: &InstanceLayout,
    operation: &str,
    from_version: Option<&VersionId>,
    run: F,
) -> Result<T>
where
    F: FnOnce(&mut RunJournal) -> Result<(T, RunStatus)>,
{
    let started_at_unix = current_unix_timestamp()?;
    let tx = begin_run_transaction(layout, operation, from_version, started_at_unix)?;
    debug!(txid = %tx.txid, operation, "run transaction started");
    let mut journal = RunJournal::new(layout.clone(), tx.txid.clone());

    let run_result = (|| -> Result<T> {
        update_run_status(layout, &tx.txid, RunStatus::Applying)?;
        let (value, status) = run(&mut journal)?;
        update_run_status(layout, &tx.txid, status)?;
        clear_active_run(layout)?;
        Ok(value)
    })();

    match run_result {
        Ok(value) => Ok(value),
        Err(err) => {
            let current_status = read_run_metadata(layout, &tx.txid)
                .ok()
                .flatten()
                .map(|metadata| metadata.status);
            if !current_status.is_some_and(|status| status.is_final()) {
                if let Err(status_err) = update_run_status(layout, &tx.txid, RunStatus::Failed) {
                    warn!(txid = %tx.txid, error = %status_err, "failed to mark run as failed");
                }
            }
            if let Err(clear_err) = clear_active_run(layout) {
                warn!(txid = %tx.txid, error = %clear_err, "failed to clear active run marker");
            }
            warn!(txid = %tx.txid, error = %err, "run transaction failed");
            Err(err)
        }
    }
}

/// Mirrors engine progress into the run journal. The first write error is
/// kept and reported once the run returns.
pub(crate) struct JournalObserver<'a> {
    journal: &'a mut RunJournal,
    error: Option<anyhow::Error>,
}

impl<'a> JournalObserver<'a> {
    pub(crate) fn new(journal: &'a mut RunJournal) -> Self {
        Self {
            journal,
            error: None,
        }
    }

    pub(crate) fn finish(self) -> Result<()> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn record(&mut self, step: String, state: &str, detail: Option<String>) {
        if self.error.is_some() {
            return;
        }
        if let Err(err) = self.journal.record(&step, state, detail) {
            self.error = Some(err);
        }
    }
}

impl RunObserver for JournalObserver<'_> {
    fn step_applied(&mut self, from: &VersionId, to: &VersionId) {
        self.record(format!("apply_step:{from}->{to}"), "done", None);
    }

    fn step_failed(&mut self, from: &VersionId, to: &VersionId, reason: &str) {
        self.record(
            format!("apply_step:{from}->{to}"),
            "failed",
            Some(reason.to_string()),
        );
    }

    fn maintenance_finished(&mut self, action: MaintenanceAction, succeeded: bool) {
        let state = if succeeded { "done" } else { "failed" };
        self.record(format!("maintenance:{}", action.as_str()), state, None);
    }
}

pub(crate) fn final_run_status(outcome: &RunOutcome) -> RunStatus {
    if outcome.dry_run {
        RunStatus::RolledBack
    } else if outcome.halted.is_some() {
        RunStatus::Failed
    } else {
        RunStatus::Committed
    }
}

pub(crate) fn run_init_command(session: &InstanceSession, version: Option<&str>) -> Result<Vec<String>> {
    session.layout.ensure_base_dirs()?;
    let mut lines = vec![format!(
        "initialized instance at {}",
        session.layout.root().display()
    )];

    if !session.config_path.exists() {
        let mut config = session.config.clone();
        config.codebase.version = session.codebase_version.clone();
        write_config(&session.config_path, &config)?;
        lines.push(format!("wrote config {}", session.config_path.display()));
    }

    if let Some(version) = version {
        let version = VersionId::new(version);
        let mut store = FileStateStore::open(&session.layout)?;
        store.state_mut().version = Some(version.clone());
        store
            .commit()
            .with_context(|| format!("failed stamping instance version {version}"))?;
        lines.push(format!("stamped instance version {version}"));
    }

    Ok(lines)
}

pub(crate) fn run_status_command(session: &InstanceSession) -> Result<Vec<String>> {
    session.ensure_initialized()?;
    let controller = session.controller()?;
    let mut store = FileStateStore::open(&session.layout)?;
    let summary = controller.status(&mut store)?;
    let active = read_active_run(&session.layout)?;
    Ok(format_status_lines(
        session.layout.root(),
        &summary,
        active.as_deref(),
    ))
}

pub(crate) fn format_status_lines(
    root: &Path,
    summary: &StatusSummary,
    active_run: Option<&str>,
) -> Vec<String> {
    vec![
        format!("instance: {}", root.display()),
        format!("instance version: {}", describe_version(&summary.instance_version)),
        format!("codebase version: {}", describe_version(&summary.codebase_version)),
        format!("needs upgrade: {}", yes_no(summary.needs_upgrade)),
        format!("needs reindex: {}", yes_no(summary.maintenance.needs_reindex)),
        format!("needs role remap: {}", yes_no(summary.maintenance.needs_role_remap)),
        format!("active run: {}", active_run.unwrap_or("none")),
    ]
}

pub(crate) fn run_versions_command(session: &InstanceSession) -> Result<Vec<String>> {
    let registry = session.config.registry()?;
    let current = session.stamped_version()?;
    Ok(format_versions_lines(&registry, current.as_ref()))
}

pub(crate) fn format_versions_lines(
    registry: &UpgradeRegistry,
    current: Option<&VersionId>,
) -> Vec<String> {
    let known = match current {
        Some(current) => registry.known_versions(current),
        None => registry.versions(),
    };
    let mut lines = vec![format!("known versions: {}", known.len())];
    lines.extend(known.iter().map(|version| format!("- {version}")));

    match current {
        Some(current) => {
            lines.push(format!("upgrade path: {}", describe_chain(&registry.chain_from(current))))
        }
        None => lines.push("upgrade path: instance is not stamped".to_string()),
    }
    lines
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FindingLevel {
    Ok,
    Warning,
    Problem,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CheckFinding {
    pub(crate) level: FindingLevel,
    pub(crate) message: String,
}

impl CheckFinding {
    fn new(level: FindingLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }

    pub(crate) fn status(&self) -> &'static str {
        match self.level {
            FindingLevel::Ok => "ok",
            FindingLevel::Warning => "warn",
            FindingLevel::Problem => "err",
        }
    }
}

pub(crate) fn run_check_command(session: &InstanceSession) -> Result<Vec<CheckFinding>> {
    let registry = session.config.registry()?;
    let current = session.stamped_version()?;
    Ok(check_registry(
        &session.config,
        &registry,
        session.codebase_version.as_ref(),
        current.as_ref(),
    ))
}

pub(crate) fn check_registry(
    config: &UpliftConfig,
    registry: &UpgradeRegistry,
    codebase: Option<&VersionId>,
    current: Option<&VersionId>,
) -> Vec<CheckFinding> {
    let mut findings = vec![CheckFinding::new(
        FindingLevel::Ok,
        format!("{} upgrade steps registered", registry.len()),
    )];

    for version in config.duplicate_sources() {
        findings.push(CheckFinding::new(
            FindingLevel::Warning,
            format!("multiple steps upgrade from {version}; the last one wins"),
        ));
    }

    for version in registry.find_cycles() {
        findings.push(CheckFinding::new(
            FindingLevel::Problem,
            format!(
                "upgrade chain from {version} never ends: {}",
                describe_chain(&registry.chain_from(&version))
            ),
        ));
    }

    let Some(codebase) = codebase else {
        findings.push(CheckFinding::new(
            FindingLevel::Problem,
            "no codebase version configured",
        ));
        return findings;
    };
    if registry.versions().contains(codebase) {
        findings.push(CheckFinding::new(
            FindingLevel::Warning,
            format!("a step upgrades away from codebase version {codebase}"),
        ));
    }

    let Some(current) = current else {
        findings.push(CheckFinding::new(
            FindingLevel::Ok,
            format!("instance is not stamped; it will start at {codebase}"),
        ));
        return findings;
    };
    let walk = registry.chain_from(current);
    match &walk.end {
        ChainEnd::Terminal(end) if end == codebase => findings.push(CheckFinding::new(
            FindingLevel::Ok,
            format!(
                "upgrade path from {current} reaches {codebase} in {} steps",
                walk.step_count()
            ),
        )),
        ChainEnd::Terminal(end) => findings.push(CheckFinding::new(
            FindingLevel::Problem,
            format!("upgrade path from {current} stops at {end}, not codebase version {codebase}"),
        )),
        ChainEnd::Cycle(_) => findings.push(CheckFinding::new(
            FindingLevel::Problem,
            format!("upgrade path from {current} loops: {}", describe_chain(&walk)),
        )),
    }
    findings
}

pub(crate) struct UpgradeRequest {
    pub(crate) force_version: Option<String>,
    pub(crate) dry_run: bool,
    pub(crate) strict: bool,
}

pub(crate) fn run_upgrade_command(
    session: &InstanceSession,
    request: &UpgradeRequest,
) -> Result<RunOutcome> {
    session.ensure_initialized()?;
    let mut controller = session.controller()?;
    let mut store = FileStateStore::open(&session.layout)?;
    let options = RunOptions {
        force_start_version: request.force_version.as_deref().map(VersionId::new),
        dry_run: request.dry_run,
        swallow_errors: !request.strict && session.config.run.swallow_errors,
    };
    let operation = if request.dry_run { "dry-run" } else { "upgrade" };
    let from_version = store.committed().version.clone();

    execute_with_run_transaction(
        &session.layout,
        operation,
        from_version.as_ref(),
        |journal| {
            let mut observer = JournalObserver::new(journal);
            let outcome = controller.upgrade(&mut store, &options, &mut observer);
            observer.finish()?;
            let outcome = outcome?;
            let status = final_run_status(&outcome);
            Ok((outcome, status))
        },
    )
}

#[derive(Debug, Serialize)]
pub(crate) struct UpgradeSummary<'a> {
    pub(crate) up_to_date: bool,
    pub(crate) dry_run: bool,
    pub(crate) started_from: &'a VersionId,
    pub(crate) stopped_at: &'a VersionId,
    pub(crate) steps_applied: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) halted: Option<String>,
    pub(crate) report: &'a RunReport,
}

impl<'a> From<&'a RunOutcome> for UpgradeSummary<'a> {
    fn from(outcome: &'a RunOutcome) -> Self {
        Self {
            up_to_date: outcome.up_to_date,
            dry_run: outcome.dry_run,
            started_from: &outcome.started_from,
            stopped_at: &outcome.stopped_at,
            steps_applied: outcome.steps_applied,
            halted: outcome.halted.as_ref().map(describe_halt),
            report: &outcome.report,
        }
    }
}

pub(crate) fn format_upgrade_footer(outcome: &RunOutcome) -> Vec<String> {
    let mut lines = vec![format!(
        "{} from {} to {} ({} steps applied)",
        if outcome.dry_run { "simulated upgrade" } else { "upgraded" },
        outcome.started_from,
        outcome.stopped_at,
        outcome.steps_applied
    )];
    if let Some(halted) = &outcome.halted {
        lines.push(format!("halted: {}", describe_halt(halted)));
    }
    lines
}

fn describe_halt(halted: &HaltReason) -> String {
    match halted {
        HaltReason::StepFailed { from, to } => format!("step {from} -> {to} failed"),
        HaltReason::CycleDetected { version } => format!("chain loops back to {version}"),
    }
}

fn describe_chain(walk: &ChainWalk) -> String {
    let path = walk
        .path
        .iter()
        .map(VersionId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ");
    match &walk.end {
        ChainEnd::Terminal(_) => path,
        ChainEnd::Cycle(version) => format!("{path} -> {version} (cycle)"),
    }
}

fn describe_version(version: &VersionId) -> String {
    match version.as_tuple() {
        Ok(tuple) => format!("{version} {tuple}"),
        Err(_) => version.to_string(),
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}
