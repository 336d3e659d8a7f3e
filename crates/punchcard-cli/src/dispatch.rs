use std::io::{self, Write};

use chrono::Utc;
use clap::CommandFactory;
use clap_complete::Shell;
use punchcard_core::{UpdateError, UpdateResult, UpdaterConfig};
use punchcard_installer::{
    new_run_id, pipeline_status, PipelineStatus, RunGuard, RunReport, UpdatePipeline,
};
use punchcard_registry::{SystemInfo, UpdateCheck, VersionOracle};
use punchcard_snapshot::{SnapshotStore, SnapshotSummary};
use serde_json::Value;
use tracing::warn;

use crate::envelope::Envelope;
use crate::render::TerminalRenderer;
use crate::{BackupCommands, Cli, Commands};

pub(crate) fn run_cli(cli: Cli, renderer: TerminalRenderer) -> Envelope {
    let config = match UpdaterConfig::load(&cli.config) {
        Ok(config) => config,
        Err(err) => return Envelope::from_error(&err),
    };
    if let Err(err) = config.layout().ensure_base_dirs() {
        return Envelope::from_error(&UpdateError::config(err));
    }

    match execute(&config, cli.command, renderer) {
        Ok(envelope) => envelope,
        Err(err) => Envelope::from_error(&err),
    }
}

fn execute(
    config: &UpdaterConfig,
    command: Commands,
    renderer: TerminalRenderer,
) -> UpdateResult<Envelope> {
    match command {
        Commands::Check { force } => check_command(&VersionOracle::from_config(config)?, force),
        Commands::Info => Ok(info_command(&VersionOracle::from_config(config)?.system_info())),
        Commands::Backup(command) => backup_command(&SnapshotStore::from_config(config)?, command),
        Commands::Install { yes, force_check } => {
            let oracle = VersionOracle::from_config(config)?;
            let pipeline = UpdatePipeline::from_config(config)?;
            install_command(config, &oracle, &pipeline, yes, force_check, renderer)
        }
        Commands::Auto => {
            if !config.features.auto_update {
                return Err(UpdateError::Config(
                    "auto_update is disabled; set features.auto_update = true to allow unattended installs"
                        .to_string(),
                ));
            }
            let oracle = VersionOracle::from_config(config)?;
            let pipeline = UpdatePipeline::from_config(config)?;
            auto_command(&oracle, &pipeline, renderer)
        }
        Commands::Status => Ok(status_command(&pipeline_status(&config.layout())?)),
        Commands::Completions { .. } => Ok(Envelope::failed(
            "completion scripts are written to stdout without an envelope",
            Value::Null,
        )),
    }
}

pub(crate) fn check_command(oracle: &VersionOracle, force: bool) -> UpdateResult<Envelope> {
    let check = oracle.check_for_updates(force)?;
    Ok(Envelope::ok(describe_check(&check), &check))
}

pub(crate) fn describe_check(check: &UpdateCheck) -> String {
    if !check.checked {
        let last = check
            .last_checked_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        return format!("check skipped: last check at {last} is within the check interval");
    }

    match (&check.latest_version, check.update_available) {
        (Some(latest), true) => format!(
            "update available: {} -> {latest}",
            check.current_version
        ),
        (Some(latest), false) => format!(
            "up to date: installed {}, latest published {latest}",
            check.current_version
        ),
        (None, _) => format!("up to date: installed {}", check.current_version),
    }
}

pub(crate) fn info_command(info: &SystemInfo) -> Envelope {
    let next_check = info
        .next_check_due_at
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "now".to_string());
    let details = vec![
        format!("registry: {}", info.registry_endpoint),
        format!(
            "authenticated: {}",
            if info.authenticated_registry { "yes" } else { "no" }
        ),
        format!("check interval: {}s", info.check_interval_secs),
        format!("max retained backups: {}", info.max_retained_backups),
        format!(
            "features: auto_update={} rollback={} require_confirmation={}",
            info.features.auto_update, info.features.rollback, info.features.require_confirmation
        ),
    ];
    Envelope::ok(
        format!(
            "installed version {}, next check due {next_check}",
            info.installed_version
        ),
        info,
    )
    .with_details(details)
}

pub(crate) fn backup_command(
    store: &SnapshotStore,
    command: BackupCommands,
) -> UpdateResult<Envelope> {
    match command {
        BackupCommands::Create { description } => {
            let summary = exclusive(store, "backup", || store.create_snapshot(&description))?;
            Ok(Envelope::ok(
                format!(
                    "created snapshot {} ({} files, {} bytes)",
                    summary.id, summary.file_count, summary.total_size
                ),
                &summary,
            ))
        }
        BackupCommands::List => {
            let snapshots = store.list_snapshots()?;
            let details = snapshots.iter().map(format_snapshot_line).collect();
            Ok(Envelope::ok(
                format!(
                    "{} snapshot(s) retained (max {})",
                    snapshots.len(),
                    store.max_retained()
                ),
                &snapshots,
            )
            .with_details(details))
        }
        BackupCommands::Verify { id } => {
            let manifest = store.verify_snapshot(&id)?;
            let summary = SnapshotSummary::from(&manifest);
            Ok(Envelope::ok(
                format!("snapshot {id} is intact ({} files)", summary.file_count),
                &summary,
            ))
        }
        BackupCommands::Restore { id } => {
            let report = exclusive(store, "restore", || store.restore_snapshot(&id))?;
            Ok(Envelope::ok(
                format!(
                    "restored snapshot {id} ({} entries)",
                    report.restored_entries
                ),
                &report,
            ))
        }
        BackupCommands::Delete { id } => {
            let removed = exclusive(store, "delete", || store.delete_snapshot(&id))?;
            let message = if removed {
                format!("deleted snapshot {id}")
            } else {
                format!("no snapshot {id}; nothing to delete")
            };
            Ok(Envelope::ok(
                message,
                serde_json::json!({ "id": id, "removed": removed }),
            ))
        }
    }
}

/// Runs a backup-directory mutation under the same run marker an update
/// holds, so it never races a pipeline run.
fn exclusive<T>(
    store: &SnapshotStore,
    operation: &str,
    action: impl FnOnce() -> UpdateResult<T>,
) -> UpdateResult<T> {
    let guard = RunGuard::acquire(
        store.layout(),
        &format!("{operation}-{}", new_run_id(Utc::now())),
    )?;
    let result = action();
    if let Err(err) = guard.release() {
        warn!("failed to release run marker after {operation}: {err:#}");
    }
    result
}

fn format_snapshot_line(summary: &SnapshotSummary) -> String {
    format!(
        "{}  {}  {} bytes  {}",
        summary.id,
        summary.created_at.format("%Y-%m-%d %H:%M:%S"),
        summary.total_size,
        summary.description
    )
}

fn install_command(
    config: &UpdaterConfig,
    oracle: &VersionOracle,
    pipeline: &UpdatePipeline,
    yes: bool,
    force_check: bool,
    renderer: TerminalRenderer,
) -> UpdateResult<Envelope> {
    let check = oracle.check_for_updates(force_check)?;
    if !check.checked {
        return Ok(Envelope::failed(
            format!(
                "{}; rerun with --force-check to query the registry",
                describe_check(&check)
            ),
            &check,
        ));
    }
    let Some(release) = check.release.clone() else {
        return Ok(Envelope::ok(describe_check(&check), &check));
    };

    if config.features.require_confirmation && !yes {
        return Ok(Envelope::failed(
            format!(
                "{}; installing requires confirmation, rerun with --yes",
                describe_check(&check)
            ),
            &check,
        ));
    }

    let spinner = renderer.start_spinner(&format!("installing {}", release.display_name()));
    let result = pipeline.install(&release, true);
    spinner.finish();
    Ok(report_envelope(&result?))
}

fn auto_command(
    oracle: &VersionOracle,
    pipeline: &UpdatePipeline,
    renderer: TerminalRenderer,
) -> UpdateResult<Envelope> {
    let check = oracle.check_for_updates(false)?;
    let Some(release) = check.release.clone() else {
        return Ok(Envelope::ok(
            format!("no update applied: {}", describe_check(&check)),
            &check,
        ));
    };

    let spinner = renderer.start_spinner(&format!("installing {}", release.display_name()));
    let result = pipeline.install(&release, true);
    spinner.finish();
    Ok(report_envelope(&result?))
}

pub(crate) fn report_envelope(report: &RunReport) -> Envelope {
    let mut details = vec![format!(
        "stages: {}",
        report
            .stages
            .iter()
            .map(|record| record.stage.as_str())
            .collect::<Vec<_>>()
            .join(" -> ")
    )];
    if let Some(snapshot_id) = &report.snapshot_id {
        details.push(format!("snapshot: {snapshot_id}"));
    }
    for warning in &report.migration_warnings {
        details.push(format!(
            "migration {} failed (non-fatal): {}",
            warning.migration, warning.message
        ));
    }

    let envelope = if report.succeeded() {
        Envelope::ok(report.summary(), report)
    } else {
        Envelope::failed(report.summary(), report)
    };
    envelope.with_details(details)
}

pub(crate) fn status_command(status: &PipelineStatus) -> Envelope {
    let message = match &status.current {
        None => "no update run recorded".to_string(),
        Some(state) if status.active && !state.stage.is_terminal() => format!(
            "run {} in progress: {} (target {})",
            state.run_id,
            state.stage.as_str(),
            state.target_version
        ),
        Some(state) => format!(
            "last run {} ended {} (target {})",
            state.run_id,
            state.stage.as_str(),
            state.target_version
        ),
    };

    let mut details = Vec::new();
    if let Some(error) = status.current.as_ref().and_then(|state| state.last_error.as_ref()) {
        details.push(format!("last error: {error}"));
    }
    Envelope::ok(message, status).with_details(details)
}

pub(crate) fn write_completions(shell: Shell, writer: &mut impl Write) -> io::Result<()> {
    let mut command = Cli::command();
    let mut generated = Vec::new();
    clap_complete::generate(shell, &mut command, "punchcard", &mut generated);
    writer.write_all(&generated)?;
    writer.flush()
}
