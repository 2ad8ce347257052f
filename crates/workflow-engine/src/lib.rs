use multiboot_backup::{BackupError, BackupManager, PartitionTableSource};
use multiboot_content::{classify, scan_locations, FsPayloadView, PayloadView, ScanReport};
use multiboot_core::{
    BackupRecord, CommandError, CommandOutput, DiskRecord, InstallerRecord, PartitionPlan,
};
use multiboot_safety::{evaluate_disk, SafetyContext, SafetyDecision};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::{info, warn};

mod error;
mod executor;
pub mod macos;

pub use error::EngineError;
pub use executor::{
    execute, execute_with_reporter, Collaborators, ExecutionEvent, ExecutionMode, InstallState,
};
pub use multiboot_safety::{request_confirmation, Authorization, GateError};

/// Finds installer bundles. Classification happens in [`scan`] through
/// [`InstallerScanner::payload_view`].
pub trait InstallerScanner {
    fn scan(&self) -> ScanReport;

    fn payload_view(&self, installer: &InstallerRecord) -> Box<dyn PayloadView> {
        Box::new(FsPayloadView::for_record(installer))
    }
}

pub trait DiskInspector {
    fn enumerate(&self) -> Result<Vec<DiskRecord>, CommandError>;
    fn refresh(&self, disk_id: &str) -> Result<DiskRecord, CommandError>;
    fn boot_disk_id(&self) -> Result<String, CommandError>;
}

pub trait Snapshotter {
    fn snapshot(&self, disk: &DiskRecord) -> Result<BackupRecord, BackupError>;
}

impl<S: PartitionTableSource> Snapshotter for BackupManager<S> {
    fn snapshot(&self, disk: &DiskRecord) -> Result<BackupRecord, BackupError> {
        BackupManager::snapshot(self, disk)
    }
}

/// Every call that changes the target disk goes through here.
pub trait DiskMutator {
    fn apply_partition_table(&self, plan: &PartitionPlan) -> Result<CommandOutput, CommandError>;
    /// Mounts a slice and returns its mount point.
    fn prepare_volume(&self, slice_id: &str) -> Result<PathBuf, CommandError>;
}

pub trait InstallRunner {
    fn install(&self, installer: &InstallerRecord, volume: &Path) -> Result<CommandOutput, CommandError>;
}

pub trait Brander {
    fn brand(&self, volume: &Path, label: &str) -> Result<(), CommandError>;
}

/// Polled only at safe checkpoints.
pub trait Cancellation {
    fn is_cancelled(&self) -> bool;
}

impl Cancellation for AtomicBool {
    fn is_cancelled(&self) -> bool {
        self.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NeverCancelled;

impl Cancellation for NeverCancelled {
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Filesystem scanner over configured locations.
#[derive(Debug, Clone)]
pub struct FsInstallerScanner {
    pub search_paths: Vec<PathBuf>,
    pub include_partials: bool,
}

impl InstallerScanner for FsInstallerScanner {
    fn scan(&self) -> ScanReport {
        scan_locations(&self.search_paths, self.include_partials)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExcludedDisk {
    pub disk: DiskRecord,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanOutcome {
    pub boot_disk_id: String,
    pub installers: Vec<InstallerRecord>,
    pub scan_warnings: Vec<String>,
    pub disks: Vec<DiskRecord>,
    pub excluded_disks: Vec<ExcludedDisk>,
}

impl ScanOutcome {
    pub fn full_installers(&self) -> impl Iterator<Item = &InstallerRecord> {
        self.installers.iter().filter(|installer| installer.is_full())
    }

    pub fn safety_context(&self) -> SafetyContext {
        SafetyContext::new(self.boot_disk_id.clone())
    }

    pub fn disk(&self, disk_id: &str) -> Option<&DiskRecord> {
        self.disks.iter().find(|disk| disk.id == disk_id)
    }
}

/// Scans installers and disks on two threads, then classifies installers
/// and filters disks. Disk enumeration failure is fatal; unreadable installer
/// locations are warnings.
pub fn scan<S, D>(scanner: &S, inspector: &D) -> Result<ScanOutcome, EngineError>
where
    S: InstallerScanner + Sync + ?Sized,
    D: DiskInspector + Sync + ?Sized,
{
    let (report, disks) = thread::scope(|scope| {
        let installers = scope.spawn(|| scanner.scan());
        let disks = scope.spawn(|| -> Result<_, CommandError> {
            let boot = inspector.boot_disk_id()?;
            Ok((boot, inspector.enumerate()?))
        });
        (installers.join(), disks.join())
    });

    let report = report.unwrap_or_else(|_| {
        warn!("installer scan thread panicked");
        ScanReport::default()
    });
    let (boot_disk_id, raw_disks) = match disks {
        Ok(result) => result.map_err(|source| EngineError::Inspect {
            disk_id: "*".to_string(),
            source,
        })?,
        Err(_) => {
            return Err(EngineError::Inspect {
                disk_id: "*".to_string(),
                source: CommandError::Malformed {
                    program: "disk enumeration".to_string(),
                    detail: "worker thread panicked".to_string(),
                },
            })
        }
    };

    let installers = report
        .installers
        .iter()
        .map(|installer| classify(installer, scanner.payload_view(installer).as_ref()))
        .collect::<Vec<_>>();

    let ctx = SafetyContext::new(boot_disk_id.clone());
    let mut safe = Vec::new();
    let mut excluded = Vec::new();
    for disk in raw_disks {
        match evaluate_disk(&ctx, &disk) {
            SafetyDecision::Allow => safe.push(disk),
            SafetyDecision::Deny(reason) => excluded.push(ExcludedDisk { disk, reason }),
        }
    }

    info!(
        installers = installers.len(),
        full = installers.iter().filter(|i| i.is_full()).count(),
        disks = safe.len(),
        excluded = excluded.len(),
        %boot_disk_id,
        "scan complete"
    );
    Ok(ScanOutcome {
        boot_disk_id,
        installers,
        scan_warnings: report.warnings.iter().map(ToString::to_string).collect(),
        disks: safe,
        excluded_disks: excluded,
    })
}

/// Selects installers from a scan by path, bundle name or display name.
pub fn select_installers(
    outcome: &ScanOutcome,
    wanted: &[String],
) -> Result<Vec<InstallerRecord>, String> {
    wanted
        .iter()
        .map(|query| {
            outcome
                .installers
                .iter()
                .find(|installer| {
                    installer.path.as_path() == Path::new(query)
                        || installer.name == *query
                        || installer.display_name() == query
                })
                .cloned()
                .ok_or_else(|| format!("no scanned installer matches '{query}'"))
        })
        .collect()
}
