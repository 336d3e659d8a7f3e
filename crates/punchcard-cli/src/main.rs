use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use punchcard_core::DEFAULT_CONFIG_FILE;
use tracing_subscriber::EnvFilter;

mod dispatch;
mod envelope;
mod render;

use dispatch::{run_cli, write_completions};
use render::{current_output_style, TerminalRenderer};

const LOG_ENV_VAR: &str = "PUNCHCARD_LOG";

#[derive(Parser, Debug)]
#[command(name = "punchcard", version)]
#[command(
    about = "Self-update manager for the time-clock administration application",
    long_about = None
)]
struct Cli {
    /// Updater configuration file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Print a {success, message, data} JSON envelope instead of text.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ask the release feed whether a newer version exists.
    Check {
        /// Ignore the check interval.
        #[arg(long)]
        force: bool,
    },
    /// Show installed version, check schedule and feature toggles.
    Info,
    #[command(subcommand)]
    Backup(BackupCommands),
    /// Check for a newer release and install it.
    Install {
        /// Confirm the install when require_confirmation is enabled.
        #[arg(long)]
        yes: bool,
        /// Query the registry even if the last check is recent.
        #[arg(long)]
        force_check: bool,
    },
    /// Unattended check-and-install; requires features.auto_update.
    Auto,
    /// Show the current or last pipeline run.
    Status,
    /// Print a shell completion script.
    Completions { shell: Shell },
}

#[derive(Subcommand, Debug)]
enum BackupCommands {
    Create {
        #[arg(long, default_value = "manual backup")]
        description: String,
    },
    List,
    Verify {
        id: String,
    },
    Restore {
        id: String,
    },
    Delete {
        id: String,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        return match write_completions(shell, &mut std::io::stdout()) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("failed to write completions: {err}");
                ExitCode::FAILURE
            }
        };
    }

    init_tracing();
    let json = cli.json;
    let renderer = TerminalRenderer::from_style(current_output_style());
    let envelope = run_cli(cli, renderer);

    if json {
        println!("{}", envelope.to_json());
    } else {
        renderer.print_envelope(&envelope);
    }

    if envelope.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
