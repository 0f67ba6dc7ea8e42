use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod completion;
mod config;
mod dispatch;
mod flows;
mod render;

use completion::CliCompletionShell;

#[derive(Parser, Debug)]
#[command(name = "uplift")]
#[command(about = "Walks an instance through its registered upgrade steps", long_about = None)]
struct Cli {
    /// Instance root (defaults to $UPLIFT_INSTANCE or ~/.uplift).
    #[arg(long, global = true)]
    instance: Option<PathBuf>,
    /// Configuration file (defaults to <instance>/uplift.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Overrides the codebase version from the configuration file.
    #[arg(long, global = true)]
    codebase_version: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the instance layout, optionally stamping a version.
    Init {
        #[arg(long)]
        version: Option<String>,
    },
    Status,
    /// List registered versions and the chain from the current version.
    Versions,
    /// Validate the configured upgrade steps.
    Check,
    Upgrade {
        /// Start from this version instead of the stamped one.
        #[arg(long)]
        force_version: Option<String>,
        #[arg(long)]
        dry_run: bool,
        /// Stop and fail on the first step or maintenance error.
        #[arg(long)]
        strict: bool,
        #[arg(long)]
        json: bool,
    },
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
}

fn main() -> ExitCode {
    init_tracing();

    match dispatch::run_cli(Cli::parse()) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("UPLIFT_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let ansi = std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(ansi)
        .try_init();
}

#[cfg(test)]
mod tests;
