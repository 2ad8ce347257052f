use multiboot_backup::BackupError;
use multiboot_core::{CommandError, PlanViolation};
use multiboot_safety::DiskIneligible;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("plan for {disk_id} is inconsistent: {source}")]
    InvalidPlan {
        disk_id: String,
        #[source]
        source: PlanViolation,
    },
    #[error("could not inspect {disk_id}: {source}")]
    Inspect {
        disk_id: String,
        #[source]
        source: CommandError,
    },
    #[error("disk {disk_id} changed since the plan was made: {detail}")]
    DiskChanged { disk_id: String, detail: String },
    #[error(transparent)]
    DiskIneligible(#[from] DiskIneligible),
    #[error("confirmation was given for {authorized}, not {disk_id}")]
    AuthorizationMismatch { authorized: String, disk_id: String },
    #[error("backup failed, nothing was changed: {0}")]
    Backup(#[from] BackupError),
    #[error("partitioning {disk_id} failed: {diagnostic}")]
    Partition {
        disk_id: String,
        backup_path: PathBuf,
        diagnostic: String,
        #[source]
        source: CommandError,
    },
    #[error("cancelled {stage}; {disk_id} was not modified")]
    Cancelled { disk_id: String, stage: String },
}

