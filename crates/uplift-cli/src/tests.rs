use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use clap::error::ErrorKind;
use clap::Parser;
use uplift_core::VersionId;
use uplift_registry::UpgradeRegistry;
use uplift_store::{
    read_active_run, read_run_journal, read_run_metadata, set_active_run, FileStateStore,
    InstanceLayout, RunStatus, StateStore,
};

use super::*;
use crate::completion::{write_completions_script, CliCompletionShell};
use crate::config::{parse_config, UpliftConfig};
use crate::flows::{
    check_registry, execute_with_run_transaction, format_versions_lines, open_session,
    run_init_command, run_upgrade_command, FindingLevel, InstanceSession, UpgradeRequest,
    UpgradeSummary,
};
use crate::render::{output_style_for, render_report_lines, render_status_line, OutputStyle};

const THREE_STEP_CONFIG: &str = r#"
version = 1

[codebase]
version = "3.0"

[[steps]]
from = "1.0"
to = "2.0"
messages = ["A ran"]
set_properties = { title = "Front Page" }
needs_reindex = true

[[steps]]
from = "2.0"
to = "3.0"
messages = [{ text = "B needs attention", severity = "warning" }]
"#;

fn test_root() -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("uplift-cli-test-{}-{n}", std::process::id()))
}

fn seeded_session(config: &str, stamp: Option<&str>) -> InstanceSession {
    let root = test_root();
    let layout = InstanceLayout::new(&root);
    layout.ensure_base_dirs().expect("must create dirs");
    std::fs::write(layout.config_path(), config).expect("must write config");
    let session = open_session(Some(&root), None, None).expect("must open session");
    run_init_command(&session, stamp).expect("must init");
    session
}

fn only_txid(layout: &InstanceLayout) -> String {
    let mut txids = std::fs::read_dir(layout.transactions_dir())
        .expect("must list transactions")
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_suffix(".json"))
                .map(str::to_string)
        })
        .collect::<Vec<_>>();
    assert_eq!(txids.len(), 1, "expected exactly one run: {txids:?}");
    txids.remove(0)
}

#[test]
fn cli_parses_upgrade_flags() {
    let cli = Cli::try_parse_from([
        "uplift",
        "--instance",
        "/srv/site",
        "upgrade",
        "--force-version",
        "2.0",
        "--dry-run",
        "--strict",
        "--json",
    ])
    .expect("must parse");

    assert_eq!(cli.instance, Some(PathBuf::from("/srv/site")));
    match cli.command {
        Commands::Upgrade {
            force_version,
            dry_run,
            strict,
            json,
        } => {
            assert_eq!(force_version.as_deref(), Some("2.0"));
            assert!(dry_run && strict && json);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn cli_accepts_global_flags_after_subcommand() {
    let cli = Cli::try_parse_from(["uplift", "status", "--codebase-version", "4.0"])
        .expect("must parse");
    assert_eq!(cli.codebase_version.as_deref(), Some("4.0"));
    assert!(matches!(cli.command, Commands::Status));
}

#[test]
fn cli_rejects_unknown_completion_shell() {
    let err = Cli::try_parse_from(["uplift", "completions", "tcsh"])
        .expect_err("unknown shell must be rejected");
    assert_eq!(err.kind(), ErrorKind::InvalidValue);
}

#[test]
fn versioned_config_parses_every_section() {
    let config = parse_config(
        r#"
version = 1

[codebase]
version = "3.0"

[run]
swallow_errors = false

[reindex]
threshold = 500
pg_threshold = 50
"#,
    )
    .expect("must parse");

    assert_eq!(config.codebase.version, Some(VersionId::new("3.0")));
    assert!(!config.run.swallow_errors);
    assert_eq!(config.reindex.thresholds().threshold, 500);
    assert_eq!(config.reindex.thresholds().pg_threshold, 50);
    assert!(config.steps.is_empty());
}

#[test]
fn config_defaults_swallow_errors_and_rebuild_thresholds() {
    let config = parse_config("version = 1\n").expect("must parse");
    assert!(config.run.swallow_errors);
    assert_eq!(config.reindex.threshold, 2000);
    assert_eq!(config.reindex.pg_threshold, 300);
    assert_eq!(config, UpliftConfig::default());
}

#[test]
fn legacy_config_without_version_is_upgraded() {
    let config = parse_config(
        r#"
codebase_version = "2.0"

[[steps]]
from = "1.0"
to = "2.0"
"#,
    )
    .expect("must parse legacy config");

    assert_eq!(config.version, 1);
    assert_eq!(config.codebase.version, Some(VersionId::new("2.0")));
    assert_eq!(config.steps.len(), 1);
}

#[test]
fn config_without_version_key_keeps_sectioned_settings() {
    let config = parse_config(
        r#"
[codebase]
version = "3.0"

[run]
swallow_errors = false
"#,
    )
    .expect("must parse sectioned config");

    assert_eq!(config.version, 1);
    assert_eq!(config.codebase.version, Some(VersionId::new("3.0")));
    assert!(!config.run.swallow_errors);
}

#[test]
fn legacy_config_rejects_unknown_keys() {
    let err = parse_config("codebase_version = \"2.0\"\nswallow_errors = false\n")
        .expect_err("unknown legacy key must be rejected");
    assert!(
        format!("{err:#}").contains("failed parsing legacy config"),
        "unexpected error: {err:#}"
    );
}

#[test]
fn config_step_messages_accept_severity_aliases() {
    let config = parse_config(
        r#"
version = 1

[[steps]]
from = "1.0"
to = "2.0"
messages = [
    { text = "careful", severity = "warn" },
    { text = "loud", severity = "Warning" },
    { text = "broken", severity = "ERROR" },
]
"#,
    )
    .expect("severity aliases must parse");

    assert_eq!(config.steps.len(), 1);
}

#[test]
fn config_rejects_unsupported_version() {
    let err = parse_config("version = 2\n").expect_err("version 2 must be rejected");
    assert!(
        err.to_string().contains("unsupported config version 2 (expected 1)"),
        "unexpected error: {err}"
    );
}

#[test]
fn config_rejects_self_targeting_step() {
    let err = parse_config(
        r#"
version = 1

[[steps]]
from = "2.0"
to = "2.0"
"#,
    )
    .expect_err("self-targeting step must be rejected");
    assert!(
        format!("{err:#}").contains("invalid upgrade step #1"),
        "unexpected error: {err:#}"
    );
}

#[test]
fn config_rejects_unknown_step_keys() {
    parse_config(
        r#"
version = 1

[[steps]]
from = "1.0"
to = "2.0"
reindex = true
"#,
    )
    .expect_err("unknown step key must be rejected");
}

#[test]
fn duplicate_step_sources_are_reported() {
    let config = parse_config(
        r#"
version = 1

[[steps]]
from = "1.0"
to = "2.0"

[[steps]]
from = "1.0"
to = "2.1"
"#,
    )
    .expect("must parse");

    assert_eq!(config.duplicate_sources(), vec![VersionId::new("1.0")]);
    let registry = config.registry().expect("must build registry");
    assert_eq!(registry.len(), 1);
}

#[test]
fn render_status_line_plain_is_unadorned() {
    assert_eq!(
        render_status_line(OutputStyle::Plain, "ok", "upgraded from 1.0 to 3.0"),
        "upgraded from 1.0 to 3.0"
    );
}

#[test]
fn render_status_line_rich_includes_ascii_badge() {
    let failed = render_status_line(OutputStyle::Rich, "err", "Migration has failed");
    assert!(failed.contains("[ERR]"), "missing badge: {failed:?}");
    assert!(failed.ends_with(" Migration has failed"));

    let info = render_status_line(OutputStyle::Rich, "info", "Upgrade to: 2.0, completed");
    assert!(info.contains("[..]"), "missing badge: {info:?}");
    assert!(info.ends_with(" Upgrade to: 2.0, completed"));
}

#[test]
fn no_color_forces_plain_output() {
    assert_eq!(output_style_for(true, false), OutputStyle::Rich);
    assert_eq!(output_style_for(true, true), OutputStyle::Plain);
    assert_eq!(output_style_for(false, false), OutputStyle::Plain);
}

#[test]
fn check_reports_cycles_as_problems() {
    let config = parse_config(
        r#"
version = 1

[[steps]]
from = "1.0"
to = "2.0"

[[steps]]
from = "2.0"
to = "1.0"
"#,
    )
    .expect("must parse");
    let registry = config.registry().expect("must build registry");

    let findings = check_registry(&config, &registry, Some(&VersionId::new("3.0")), None);
    let problems = findings
        .iter()
        .filter(|finding| finding.level == FindingLevel::Problem)
        .map(|finding| finding.message.as_str())
        .collect::<Vec<_>>();
    assert_eq!(
        problems,
        vec![
            "upgrade chain from 1.0 never ends: 1.0 -> 2.0 -> 1.0 (cycle)",
            "upgrade chain from 2.0 never ends: 2.0 -> 1.0 -> 2.0 (cycle)",
        ]
    );
}

#[test]
fn check_confirms_path_to_codebase_version() {
    let config = parse_config(THREE_STEP_CONFIG).expect("must parse");
    let registry = config.registry().expect("must build registry");

    let reaching = check_registry(
        &config,
        &registry,
        Some(&VersionId::new("3.0")),
        Some(&VersionId::new("1.0")),
    );
    assert!(reaching
        .iter()
        .all(|finding| finding.level == FindingLevel::Ok));
    assert!(reaching
        .iter()
        .any(|finding| finding.message == "upgrade path from 1.0 reaches 3.0 in 2 steps"));

    let short = check_registry(
        &config,
        &registry,
        Some(&VersionId::new("4.0")),
        Some(&VersionId::new("1.0")),
    );
    assert!(short.iter().any(|finding| finding.level == FindingLevel::Problem
        && finding.message == "upgrade path from 1.0 stops at 3.0, not codebase version 4.0"));
}

#[test]
fn check_requires_codebase_version() {
    let config = UpliftConfig::default();
    let findings = check_registry(&config, &UpgradeRegistry::new(), None, None);
    assert!(findings
        .iter()
        .any(|finding| finding.level == FindingLevel::Problem
            && finding.message == "no codebase version configured"));
}

#[test]
fn versions_lists_known_versions_and_path() {
    let config = parse_config(THREE_STEP_CONFIG).expect("must parse");
    let registry = config.registry().expect("must build registry");

    let lines = format_versions_lines(&registry, Some(&VersionId::new("2.0")));
    assert_eq!(
        lines,
        vec!["known versions: 1", "- 1.0", "upgrade path: 2.0 -> 3.0"]
    );
}

#[test]
fn run_transaction_records_final_status_and_releases_marker() {
    let layout = InstanceLayout::new(test_root());
    layout.ensure_base_dirs().expect("must create dirs");

    let value = execute_with_run_transaction(&layout, "upgrade", None, |journal| {
        journal
            .record("apply_step:1.0->2.0", "done", None)
            .expect("must journal");
        Ok((42, RunStatus::Committed))
    })
    .expect("run must succeed");

    assert_eq!(value, 42);
    let txid = only_txid(&layout);
    let metadata = read_run_metadata(&layout, &txid)
        .expect("must read metadata")
        .expect("metadata must exist");
    assert_eq!(metadata.status, RunStatus::Committed);
    assert_eq!(metadata.operation, "upgrade");
    assert_eq!(read_active_run(&layout).expect("must read marker"), None);
    assert_eq!(
        read_run_journal(&layout, &txid).expect("must read journal").len(),
        1
    );

    let _ = std::fs::remove_dir_all(layout.root());
}

#[test]
fn failed_run_transaction_is_marked_failed() {
    let layout = InstanceLayout::new(test_root());
    layout.ensure_base_dirs().expect("must create dirs");

    let err = execute_with_run_transaction::<(), _>(&layout, "upgrade", None, |_journal| {
        Err(anyhow::anyhow!("step exploded"))
    })
    .expect_err("run must fail");
    assert_eq!(err.to_string(), "step exploded");

    let txid = only_txid(&layout);
    let metadata = read_run_metadata(&layout, &txid)
        .expect("must read metadata")
        .expect("metadata must exist");
    assert_eq!(metadata.status, RunStatus::Failed);
    assert_eq!(read_active_run(&layout).expect("must read marker"), None);

    let _ = std::fs::remove_dir_all(layout.root());
}

#[test]
fn active_run_blocks_a_second_upgrade() {
    let session = seeded_session(THREE_STEP_CONFIG, Some("1.0"));
    set_active_run(&session.layout, "run-existing").expect("must seed marker");

    let err = run_upgrade_command(
        &session,
        &UpgradeRequest {
            force_version: None,
            dry_run: false,
            strict: false,
        },
    )
    .expect_err("active marker must block the run");
    assert!(
        err.to_string()
            .contains("another migration run is active (txid=run-existing)"),
        "unexpected error: {err}"
    );

    let store = FileStateStore::open(&session.layout).expect("must open store");
    assert_eq!(store.committed().version, Some(VersionId::new("1.0")));

    let _ = std::fs::remove_dir_all(session.layout.root());
}

#[test]
fn upgrade_walks_configured_steps_and_journals_them() {
    let session = seeded_session(THREE_STEP_CONFIG, Some("1.0"));

    let outcome = run_upgrade_command(
        &session,
        &UpgradeRequest {
            force_version: None,
            dry_run: false,
            strict: false,
        },
    )
    .expect("upgrade must succeed");

    assert!(outcome.up_to_date);
    assert_eq!(outcome.steps_applied, 2);
    let rendered = render_report_lines(outcome.report.lines(), OutputStyle::Plain);
    assert!(rendered.contains(&"A ran".to_string()));
    assert!(rendered.contains(&"Finished reindexing".to_string()));
    let rich = render_report_lines(outcome.report.lines(), OutputStyle::Rich);
    assert!(rich
        .iter()
        .any(|line| line.contains("[WARN]") && line.ends_with(" B needs attention")));

    let store = FileStateStore::open(&session.layout).expect("must open store");
    let state = store.committed();
    assert_eq!(state.version, Some(VersionId::new("3.0")));
    assert!(!state.needs_reindex);
    assert!(state.index["front"].contains("title"));

    let txid = only_txid(&session.layout);
    let journal = read_run_journal(&session.layout, &txid).expect("must read journal");
    let steps = journal
        .iter()
        .map(|entry| format!("{}={}", entry.step, entry.state))
        .collect::<Vec<_>>();
    assert_eq!(
        steps,
        vec![
            "apply_step:1.0->2.0=done",
            "apply_step:2.0->3.0=done",
            "maintenance:reindex=done",
        ]
    );
    let metadata = read_run_metadata(&session.layout, &txid)
        .expect("must read metadata")
        .expect("metadata must exist");
    assert_eq!(metadata.status, RunStatus::Committed);
    assert_eq!(metadata.from_version, Some(VersionId::new("1.0")));

    let _ = std::fs::remove_dir_all(session.layout.root());
}

#[test]
fn dry_run_upgrade_leaves_instance_state_untouched() {
    let session = seeded_session(THREE_STEP_CONFIG, Some("1.0"));
    let before = std::fs::read(session.layout.instance_state_path()).expect("must read state");

    let outcome = run_upgrade_command(
        &session,
        &UpgradeRequest {
            force_version: None,
            dry_run: true,
            strict: false,
        },
    )
    .expect("dry run must succeed");

    assert!(outcome.dry_run);
    assert!(outcome.up_to_date);
    let after = std::fs::read(session.layout.instance_state_path()).expect("must read state");
    assert_eq!(before, after);

    let txid = only_txid(&session.layout);
    let metadata = read_run_metadata(&session.layout, &txid)
        .expect("must read metadata")
        .expect("metadata must exist");
    assert_eq!(metadata.status, RunStatus::RolledBack);
    assert_eq!(metadata.operation, "dry-run");

    let _ = std::fs::remove_dir_all(session.layout.root());
}

#[test]
fn strict_upgrade_surfaces_step_failure() {
    let session = seeded_session(
        r#"
version = 1

[codebase]
version = "2.0"

[[steps]]
from = "1.0"
to = "2.0"
set_properties = { half = "done" }
fail = "schema mismatch"
"#,
        Some("1.0"),
    );

    let err = run_upgrade_command(
        &session,
        &UpgradeRequest {
            force_version: None,
            dry_run: false,
            strict: true,
        },
    )
    .expect_err("strict run must fail");
    assert!(
        format!("{err:#}").contains("schema mismatch"),
        "unexpected error: {err:#}"
    );

    let store = FileStateStore::open(&session.layout).expect("must open store");
    assert_eq!(store.committed().version, Some(VersionId::new("1.0")));
    assert!(!store.committed().properties.contains_key("half"));
    let txid = only_txid(&session.layout);
    let metadata = read_run_metadata(&session.layout, &txid)
        .expect("must read metadata")
        .expect("metadata must exist");
    assert_eq!(metadata.status, RunStatus::Failed);

    let _ = std::fs::remove_dir_all(session.layout.root());
}

#[test]
fn upgrade_summary_serializes_halt_reason() {
    let session = seeded_session(
        r#"
version = 1

[codebase]
version = "2.0"

[[steps]]
from = "1.0"
to = "2.0"
fail = "schema mismatch"
"#,
        Some("1.0"),
    );

    let outcome = run_upgrade_command(
        &session,
        &UpgradeRequest {
            force_version: None,
            dry_run: false,
            strict: false,
        },
    )
    .expect("swallowed failure must not raise");
    assert!(!outcome.up_to_date);

    let rendered = serde_json::to_value(UpgradeSummary::from(&outcome)).expect("must serialize");
    assert_eq!(rendered["up_to_date"], false);
    assert_eq!(rendered["halted"], "step 1.0 -> 2.0 failed");
    assert_eq!(rendered["started_from"], "1.0");
    assert!(rendered["report"]
        .as_array()
        .expect("report must be a list")
        .iter()
        .any(|line| line["message"] == "Upgrade aborted" && line["severity"] == "error"));

    let _ = std::fs::remove_dir_all(session.layout.root());
}

#[test]
fn init_writes_config_and_stamps_version() {
    let root = test_root();
    let session = open_session(Some(&root), None, Some("5.0")).expect("must open session");

    let lines = run_init_command(&session, Some("4.2")).expect("must init");
    assert_eq!(lines.len(), 3);

    let reloaded = open_session(Some(&root), None, None).expect("must reopen session");
    assert_eq!(reloaded.codebase_version, Some(VersionId::new("5.0")));
    let mut store = FileStateStore::open(&reloaded.layout).expect("must open store");
    assert_eq!(store.state().version, Some(VersionId::new("4.2")));
    store.commit().expect("unchanged commit must be a no-op");

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn completions_script_names_the_binary() {
    let mut output = Vec::new();
    write_completions_script(CliCompletionShell::Bash, &mut output).expect("must render");
    let script = String::from_utf8(output).expect("script must be utf-8");
    assert!(script.contains("uplift"));
    assert!(script.contains("upgrade"));
}
