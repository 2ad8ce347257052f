use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use multiboot_backup::{latest_backup, list_backups, read_backup, BackupManager};
use multiboot_core::{EngineConfig, InstallOutcome, OperationResult, OverallStatus, PartitionPlan, MIB};
use multiboot_host_macos::SystemRunner;
use multiboot_planner::{PartitionPlanner, PlannerPolicy};
use multiboot_report::write_run_report;
use multiboot_safety::ConfirmationGate;
use multiboot_workflow_engine::macos::MacosHost;
use multiboot_workflow_engine::{
    execute_with_reporter, request_confirmation, scan, select_installers, Authorization,
    Collaborators, EngineError, ExecutionEvent, ExecutionMode, FsInstallerScanner, GateError,
    ScanOutcome,
};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{ApplyArgs, BackupsCommand, Cli, Commands, TargetArgs};

const EXIT_PARTIAL: u8 = 2;
const EXIT_CANCELLED: u8 = 3;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("multiboot: {err:#}");
            if is_cancellation(&err) {
                ExitCode::from(EXIT_CANCELLED)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn is_cancellation(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<GateError>(), Some(GateError::Rejected { .. }))
        || matches!(err.downcast_ref::<EngineError>(), Some(EngineError::Cancelled { .. }))
}

fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = EngineConfig::resolve(cli.config.as_deref())?;
    if let Some(dir) = cli.backup_dir.clone() {
        config.backup_dir = dir;
    }

    match &cli.command {
        Commands::Scan => {
            let host = MacosHost::new(SystemRunner::new(), config.timeouts.clone());
            let outcome = scan_all(&config, &host)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                print_scan(&outcome);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Plan(target) => {
            let host = MacosHost::new(SystemRunner::new(), config.timeouts.clone());
            let (_, plan) = plan_for(&config, &host, target)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                print_plan(&plan);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Apply(args) => apply(&cli, &config, args),
        Commands::Backups(command) => backups(&cli, &config, command),
    }
}

fn scan_all(config: &EngineConfig, host: &MacosHost<SystemRunner>) -> Result<ScanOutcome> {
    let scanner = FsInstallerScanner {
        search_paths: config.search_paths.clone(),
        include_partials: config.include_partial_downloads,
    };
    Ok(scan(&scanner, host)?)
}

fn plan_for(
    config: &EngineConfig,
    host: &MacosHost<SystemRunner>,
    target: &TargetArgs,
) -> Result<(ScanOutcome, PartitionPlan)> {
    let outcome = scan_all(config, host)?;
    let selection = select_installers(&outcome, &target.installers).map_err(|msg| anyhow!(msg))?;
    let disk_id = target.disk.trim_start_matches("/dev/");
    let Some(disk) = outcome.disk(disk_id) else {
        if let Some(excluded) = outcome.excluded_disks.iter().find(|e| e.disk.id == disk_id) {
            bail!("{disk_id} is not a safe target: {}", excluded.reason);
        }
        bail!("{disk_id} is not an attached external disk");
    };
    let policy = PlannerPolicy {
        install_buffer_override: config.install_buffer_mib.map(|mib| mib * MIB),
        ..PlannerPolicy::default()
    };
    let plan = PartitionPlanner::new(policy).plan(&selection, disk, &outcome.safety_context())?;
    Ok((outcome, plan))
}

fn apply(cli: &Cli, config: &EngineConfig, args: &ApplyArgs) -> Result<ExitCode> {
    let host = MacosHost::new(SystemRunner::new(), config.timeouts.clone());
    let (_, plan) = plan_for(config, &host, &args.target)?;
    if !cli.json {
        print_plan(&plan);
    }

    let mode = if args.dry_run {
        ExecutionMode::DryRun
    } else {
        ExecutionMode::Live(authorize(&plan, args.confirm.as_deref())?)
    };

    install_interrupt_handler();
    let backups = BackupManager::new(&config.backup_dir, host.diskutil());
    let collaborators = Collaborators {
        inspector: &host,
        snapshotter: &backups,
        mutator: &host,
        installer: &host,
        brander: &host,
    };

    let mut log_lines = Vec::new();
    let mut log_event = |event: &ExecutionEvent| {
        let line = serde_json::to_string(event).unwrap_or_else(|_| format!("{event:?}"));
        log_lines.push(line);
    };
    let result = execute_with_reporter(&plan, mode, &collaborators, &INTERRUPTED, Some(&mut log_event))?;

    let meta = serde_json::json!({
        "installers": plan.installer_specs().count(),
        "backup_dir": config.backup_dir,
    });
    match write_run_report(&config.report_dir, &plan, &result, Some(meta), Some(&log_lines.join("\n"))) {
        Ok(paths) => info!(report = %paths.root.display(), "run report written"),
        Err(err) => warn!(error = %format!("{err:#}"), "could not write run report"),
    }

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }
    Ok(exit_code(result.status))
}

fn authorize(plan: &PartitionPlan, token: Option<&str>) -> Result<Authorization> {
    let authorization = match token {
        Some(token) => {
            let mut gate = ConfirmationGate::new(plan.disk.id.clone());
            gate.submit(token)?;
            gate.authorization()
        }
        None => {
            let stdin = std::io::stdin();
            request_confirmation(&mut stdin.lock(), &mut std::io::stderr(), &plan.disk)
                .context("read confirmation")?
        }
    };
    Ok(authorization?)
}

extern "C" fn on_interrupt(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Ctrl-C only sets a flag; the executor stops at its next checkpoint.
fn install_interrupt_handler() {
    let handler = on_interrupt as extern "C" fn(libc::c_int);
    // SAFETY: the handler only stores to an atomic.
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }
}

fn exit_code(status: OverallStatus) -> ExitCode {
    match status {
        OverallStatus::Success | OverallStatus::DryRun => ExitCode::SUCCESS,
        OverallStatus::Partial => ExitCode::from(EXIT_PARTIAL),
        OverallStatus::Cancelled => ExitCode::from(EXIT_CANCELLED),
        OverallStatus::Failed => ExitCode::FAILURE,
    }
}

fn backups(cli: &Cli, config: &EngineConfig, command: &BackupsCommand) -> Result<ExitCode> {
    match command {
        BackupsCommand::List { disk } => {
            let entries = list_backups(&config.backup_dir, disk.as_deref())?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if entries.is_empty() {
                println!("no backups in {}", config.backup_dir.display());
            } else {
                for entry in entries {
                    println!("{}  {}  {}", entry.captured_at_utc, entry.disk_id, entry.path.display());
                }
            }
        }
        BackupsCommand::Show { path, latest, disk } => {
            let path = match (path, latest, disk) {
                (Some(path), _, _) => path.clone(),
                (None, true, Some(disk)) => latest_backup(&config.backup_dir, disk)?
                    .map(|entry| entry.path)
                    .ok_or_else(|| anyhow!("no backups for {disk} in {}", config.backup_dir.display()))?,
                _ => bail!("give a backup path or --latest --disk <id>"),
            };
            print!("{}", read_backup(&path)?);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_scan(outcome: &ScanOutcome) {
    println!("boot disk: {}", outcome.boot_disk_id);
    println!("installers:");
    for installer in &outcome.installers {
        let reason = installer
            .reason
            .as_deref()
            .map(|reason| format!(" ({reason})"))
            .unwrap_or_default();
        println!(
            "  [{}] {} {}  {}{}",
            installer.classification,
            installer.display_name(),
            installer.version,
            installer.path.display(),
            reason
        );
    }
    for warning in &outcome.scan_warnings {
        println!("  warning: {warning}");
    }
    println!("disks:");
    for disk in &outcome.disks {
        println!("  {}  {}  {} bytes  {}", disk.id, disk.label, disk.capacity_bytes, disk.protocol);
    }
    for excluded in &outcome.excluded_disks {
        println!("  excluded {}: {}", excluded.disk.id, excluded.reason);
    }
}

fn print_plan(plan: &PartitionPlan) {
    println!("plan for {} ({}, {} bytes):", plan.disk.id, plan.disk.label, plan.disk.capacity_bytes);
    for spec in &plan.specs {
        let source = spec
            .source
            .as_ref()
            .map(|installer| format!("  <- {}", installer.display_name()))
            .unwrap_or_default();
        println!(
            "  s{} {:<12} {:<28} {:>15} bytes{}",
            spec.index,
            spec.role.to_string(),
            spec.label,
            spec.size_bytes,
            source
        );
    }
    println!("  unallocated {} bytes", plan.unallocated_bytes);
    println!("{}", plan.rendered_command());
}

fn print_result(result: &OperationResult) {
    println!("run {}: {}", result.run_id, result.status);
    if let Some(path) = &result.backup_path {
        println!("backup: {}", path.display());
    }
    for outcome in &result.outcomes {
        let detail = match &outcome.outcome {
            InstallOutcome::Success => "SUCCESS".to_string(),
            InstallOutcome::Failed { reason } => format!("FAILED: {reason}"),
            InstallOutcome::Skipped { reason } => format!("SKIPPED: {reason}"),
        };
        println!("  {} ({}) {}", outcome.label, outcome.slice, detail);
        if let Some(note) = &outcome.branding_note {
            println!("    note: {note}");
        }
    }
}
