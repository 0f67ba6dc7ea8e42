use std::process::ExitCode;

use anyhow::{Context, Result};

use crate::completion::write_completions_script;
use crate::flows::{
    format_upgrade_footer, open_session, run_check_command, run_init_command, run_status_command,
    run_upgrade_command, run_versions_command, FindingLevel, UpgradeRequest, UpgradeSummary,
};
use crate::render::{OutputStyle, TerminalRenderer};
use crate::{Cli, Commands};

pub(crate) fn run_cli(cli: Cli) -> Result<ExitCode> {
    let session = || {
        open_session(
            cli.instance.as_deref(),
            cli.config.as_deref(),
            cli.codebase_version.as_deref(),
        )
    };
    let renderer = TerminalRenderer::current();

    match &cli.command {
        Commands::Init { version } => {
            for line in run_init_command(&session()?, version.as_deref())? {
                renderer.print_status("ok", &line);
            }
        }
        Commands::Status => {
            for line in run_status_command(&session()?)? {
                renderer.print_status("info", &line);
            }
        }
        Commands::Versions => {
            for line in run_versions_command(&session()?)? {
                renderer.print_status("info", &line);
            }
        }
        Commands::Check => {
            let findings = run_check_command(&session()?)?;
            for finding in &findings {
                renderer.print_status(finding.status(), &finding.message);
            }
            if findings
                .iter()
                .any(|finding| finding.level == FindingLevel::Problem)
            {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Upgrade {
            force_version,
            dry_run,
            strict,
            json,
        } => {
            let request = UpgradeRequest {
                force_version: force_version.clone(),
                dry_run: *dry_run,
                strict: *strict,
            };
            let json = *json;
            let renderer = if json {
                TerminalRenderer::from_style(OutputStyle::Plain)
            } else {
                renderer
            };

            let session = session()?;
            let spinner = renderer.start_spinner(if request.dry_run { "dry-run" } else { "upgrade" });
            let outcome = match run_upgrade_command(&session, &request) {
                Ok(outcome) => {
                    spinner.finish();
                    outcome
                }
                Err(err) => {
                    spinner.abandon();
                    return Err(err);
                }
            };

            if json {
                let summary = UpgradeSummary::from(&outcome);
                let rendered = serde_json::to_string_pretty(&summary)
                    .context("failed serializing upgrade summary")?;
                println!("{rendered}");
            } else {
                renderer.print_section("Migration report");
                renderer.print_report(outcome.report.lines());
                renderer.print_section("Summary");
                let status = if outcome.up_to_date { "ok" } else { "err" };
                for line in format_upgrade_footer(&outcome) {
                    renderer.print_status(status, &line);
                }
            }

            if !outcome.up_to_date {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Completions { shell } => {
            let mut stdout = std::io::stdout();
            write_completions_script(*shell, &mut stdout)?;
        }
    }

    Ok(ExitCode::SUCCESS)
}
