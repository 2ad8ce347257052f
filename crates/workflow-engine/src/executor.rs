use crate::{Brander, Cancellation, DiskInspector, DiskMutator, EngineError, InstallRunner, Snapshotter};
use multiboot_core::version::os_name;
use multiboot_core::{
    now_utc_rfc3339, ExecutionKind, InstallOutcome, InstallerOutcome, OperationResult,
    OverallStatus, PartitionPlan, PartitionSpec, RESULT_SCHEMA_VERSION,
};
use multiboot_host_macos::boot_label;
use multiboot_safety::{ensure_eligible, Authorization, SafetyContext};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub enum ExecutionMode {
    DryRun,
    /// Only reachable with a confirmed [`Authorization`].
    Live(Authorization),
}

impl ExecutionMode {
    pub fn kind(&self) -> ExecutionKind {
        match self {
            ExecutionMode::DryRun => ExecutionKind::DryRun,
            ExecutionMode::Live(_) => ExecutionKind::Live,
        }
    }
}

/// The mutating and inspecting collaborators one run needs.
pub struct Collaborators<'a> {
    pub inspector: &'a dyn DiskInspector,
    pub snapshotter: &'a dyn Snapshotter,
    pub mutator: &'a dyn DiskMutator,
    pub installer: &'a dyn InstallRunner,
    pub brander: &'a dyn Brander,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum InstallState {
    Pending,
    Installing,
    Succeeded,
    Failed { reason: String },
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    Validated { disk_id: String },
    BackupWritten { path: PathBuf },
    Partitioned { command: String },
    Installer { label: String, state: InstallState },
    BrandingNote { label: String, note: String },
    Finished { status: OverallStatus },
}

/// One OS_INSTALLER spec moving through Pending -> Installing -> done.
struct InstallTask<'p> {
    spec: &'p PartitionSpec,
    slice: String,
    state: InstallState,
    started: Option<Instant>,
    branding_note: Option<String>,
}

impl<'p> InstallTask<'p> {
    fn new(plan: &PartitionPlan, spec: &'p PartitionSpec) -> Self {
        Self {
            spec,
            slice: plan.disk.slice_id(spec.index),
            state: InstallState::Pending,
            started: None,
            branding_note: None,
        }
    }

    fn start(&mut self) {
        if self.state == InstallState::Pending {
            self.state = InstallState::Installing;
            self.started = Some(Instant::now());
        }
    }

    fn finish(&mut self, result: Result<(), String>) {
        if self.state != InstallState::Installing {
            return;
        }
        self.state = match result {
            Ok(()) => InstallState::Succeeded,
            Err(reason) => InstallState::Failed { reason },
        };
    }

    fn skip(&mut self, reason: &str) {
        if self.state == InstallState::Pending {
            self.state = InstallState::Skipped {
                reason: reason.to_string(),
            };
        }
    }

    fn outcome(self) -> InstallerOutcome {
        let (installer, version) = match &self.spec.source {
            Some(source) => (source.display_name().to_string(), source.version.clone()),
            None => (String::new(), String::new()),
        };
        let outcome = match self.state {
            InstallState::Succeeded => InstallOutcome::Success,
            InstallState::Failed { reason } => InstallOutcome::Failed { reason },
            InstallState::Skipped { reason } => InstallOutcome::Skipped { reason },
            InstallState::Pending | InstallState::Installing => InstallOutcome::Skipped {
                reason: "not attempted".to_string(),
            },
        };
        InstallerOutcome {
            installer,
            version,
            label: self.spec.label.clone(),
            slice: self.slice,
            outcome,
            branding_note: self.branding_note,
            duration_ms: self
                .started
                .map(|started| started.elapsed().as_millis() as u64)
                .unwrap_or(0),
        }
    }
}

pub fn execute(
    plan: &PartitionPlan,
    mode: ExecutionMode,
    collaborators: &Collaborators<'_>,
    cancel: &dyn Cancellation,
) -> Result<OperationResult, EngineError> {
    execute_with_reporter(plan, mode, collaborators, cancel, None)
}

/// Validates the plan against the live disk, then (live mode only) backs up,
/// partitions and installs. Each installer fails on its own; the run only
/// aborts before the partition table has been written.
pub fn execute_with_reporter(
    plan: &PartitionPlan,
    mode: ExecutionMode,
    c: &Collaborators<'_>,
    cancel: &dyn Cancellation,
    mut reporter: Option<&mut dyn FnMut(&ExecutionEvent)>,
) -> Result<OperationResult, EngineError> {
    let mut emit = |event: ExecutionEvent| {
        if let Some(cb) = reporter.as_deref_mut() {
            cb(&event);
        }
    };
    let started_at_utc = now_utc_rfc3339();
    let disk_id = plan.disk.id.clone();

    plan.validate().map_err(|source| EngineError::InvalidPlan {
        disk_id: disk_id.clone(),
        source,
    })?;
    if let ExecutionMode::Live(auth) = &mode {
        if auth.disk_id() != disk_id {
            return Err(EngineError::AuthorizationMismatch {
                authorized: auth.disk_id().to_string(),
                disk_id,
            });
        }
    }

    let inspect_err = |source| EngineError::Inspect {
        disk_id: disk_id.clone(),
        source,
    };
    let boot_disk_id = c.inspector.boot_disk_id().map_err(inspect_err)?;
    let live = c.inspector.refresh(&disk_id).map_err(inspect_err)?;
    if !live.same_device(&plan.disk) {
        return Err(EngineError::DiskChanged {
            disk_id: disk_id.clone(),
            detail: format!(
                "planned {} bytes over {}, found {} ({} bytes over {})",
                plan.disk.capacity_bytes, plan.disk.protocol, live.id, live.capacity_bytes, live.protocol
            ),
        });
    }
    ensure_eligible(&SafetyContext::new(boot_disk_id), &live)?;
    info!(%disk_id, mode = ?mode.kind(), "plan validated against live disk");
    emit(ExecutionEvent::Validated {
        disk_id: disk_id.clone(),
    });

    let partition_command = plan.rendered_command();
    let auth = match mode {
        ExecutionMode::DryRun => {
            let outcomes = plan
                .installer_specs()
                .map(|spec| {
                    let mut task = InstallTask::new(plan, spec);
                    task.skip("dry run");
                    task.outcome()
                })
                .collect();
            info!(%disk_id, command = %partition_command, "dry run complete, nothing changed");
            emit(ExecutionEvent::Finished {
                status: OverallStatus::DryRun,
            });
            return Ok(OperationResult {
                schema_version: RESULT_SCHEMA_VERSION,
                run_id: multiboot_report::new_run_id(),
                disk_id,
                mode: ExecutionKind::DryRun,
                backup_path: None,
                partition_command,
                outcomes,
                status: OverallStatus::DryRun,
                started_at_utc,
                finished_at_utc: now_utc_rfc3339(),
            });
        }
        ExecutionMode::Live(auth) => auth,
    };

    let backup = c.snapshotter.snapshot(&live)?;
    emit(ExecutionEvent::BackupWritten {
        path: backup.path.clone(),
    });

    if cancel.is_cancelled() {
        warn!(%disk_id, "cancelled before partitioning");
        return Err(EngineError::Cancelled {
            disk_id,
            stage: "before partitioning".to_string(),
        });
    }

    if let Err(source) = c.mutator.apply_partition_table(plan) {
        error!(%disk_id, error = %source, "partitioning failed");
        return Err(EngineError::Partition {
            disk_id,
            backup_path: backup.path,
            diagnostic: source.diagnostic(),
            source,
        });
    }
    info!(%disk_id, command = %partition_command, "partition table written");
    emit(ExecutionEvent::Partitioned {
        command: partition_command.clone(),
    });

    let mut cancelled = false;
    let mut outcomes = Vec::new();
    for spec in plan.installer_specs() {
        let mut task = InstallTask::new(plan, spec);
        if cancelled || cancel.is_cancelled() {
            cancelled = true;
            task.skip("cancelled");
            emit(ExecutionEvent::Installer {
                label: spec.label.clone(),
                state: task.state.clone(),
            });
            outcomes.push(task.outcome());
            continue;
        }

        task.start();
        emit(ExecutionEvent::Installer {
            label: spec.label.clone(),
            state: task.state.clone(),
        });
        let result = run_install(c, &task);
        if let Err(reason) = &result {
            warn!(label = %spec.label, slice = %task.slice, %reason, "install failed");
        }
        task.finish(result);

        if task.state == InstallState::Succeeded {
            if let Err(note) = brand(c, &task) {
                warn!(label = %spec.label, %note, "branding skipped");
                emit(ExecutionEvent::BrandingNote {
                    label: spec.label.clone(),
                    note: note.clone(),
                });
                task.branding_note = Some(note);
            }
        }
        emit(ExecutionEvent::Installer {
            label: spec.label.clone(),
            state: task.state.clone(),
        });
        outcomes.push(task.outcome());
    }

    let status = OverallStatus::from_outcomes(&outcomes, cancelled);
    info!(%disk_id, %status, run_id = %auth.run_id(), "run finished");
    emit(ExecutionEvent::Finished { status });
    Ok(OperationResult {
        schema_version: RESULT_SCHEMA_VERSION,
        run_id: auth.run_id().to_string(),
        disk_id,
        mode: ExecutionKind::Live,
        backup_path: Some(backup.path),
        partition_command,
        outcomes,
        status,
        started_at_utc,
        finished_at_utc: now_utc_rfc3339(),
    })
}

fn run_install(c: &Collaborators<'_>, task: &InstallTask<'_>) -> Result<(), String> {
    let source = task
        .spec
        .source
        .as_ref()
        .ok_or_else(|| "partition has no source installer".to_string())?;
    let volume = c
        .mutator
        .prepare_volume(&task.slice)
        .map_err(|err| format!("could not mount {}: {}", task.slice, err.diagnostic()))?;
    debug!(installer = %source.name, volume = %volume.display(), "installing");
    c.installer
        .install(source, &volume)
        .map(|_| ())
        .map_err(|err| err.diagnostic())
}

/// The installer renames the volume, so it is looked up again before
/// blessing.
fn brand(c: &Collaborators<'_>, task: &InstallTask<'_>) -> Result<(), String> {
    let Some(source) = &task.spec.source else {
        return Ok(());
    };
    let volume = c
        .mutator
        .prepare_volume(&task.slice)
        .map_err(|err| format!("could not remount for branding: {}", err.diagnostic()))?;
    let name = match os_name(&source.name, &source.version) {
        Some(name) => name,
        None => source.display_name(),
    };
    c.brander
        .brand(&volume, &boot_label(name, &source.version))
        .map_err(|err| format!("bless failed: {}", err.diagnostic()))
}
