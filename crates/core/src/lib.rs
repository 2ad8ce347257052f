use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use time::format_description::well_known::Rfc3339;

pub mod command;
pub mod config;
pub mod version;

pub use command::{CommandError, CommandOutput, CommandRequest};
pub use config::{EngineConfig, Timeouts};

pub const PLAN_SCHEMA_VERSION: u32 = 1;
pub const RESULT_SCHEMA_VERSION: u32 = 1;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    Full,
    Stub,
    Partial,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classification::Full => write!(f, "FULL"),
            Classification::Stub => write!(f, "STUB"),
            Classification::Partial => write!(f, "PARTIAL"),
        }
    }
}

/// One scanned `Install macOS *.app` bundle.
///
/// Records are values: classification produces a new record rather than
/// editing the scanned one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallerRecord {
    pub name: String,
    pub path: PathBuf,
    pub bundle_id: String,
    pub version: String,
    pub payload_bytes: u64,
    pub classification: Classification,
    pub reason: Option<String>,
}

impl InstallerRecord {
    /// A freshly scanned bundle. It stays a `STUB` until a validator has
    /// looked at its payload.
    pub fn scanned(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        bundle_id: impl Into<String>,
        version: impl Into<String>,
        payload_bytes: u64,
    ) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            bundle_id: bundle_id.into(),
            version: version.into(),
            payload_bytes,
            classification: Classification::Stub,
            reason: Some("payload not validated".to_string()),
        }
    }

    pub fn partial(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        version: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            bundle_id: String::new(),
            version: version.into(),
            payload_bytes: 0,
            classification: Classification::Partial,
            reason: Some(reason.into()),
        }
    }

    pub fn with_classification(&self, classification: Classification, reason: Option<String>) -> Self {
        let reason = match classification {
            Classification::Full => None,
            _ => reason,
        };
        Self {
            classification,
            reason,
            ..self.clone()
        }
    }

    pub fn is_full(&self) -> bool {
        self.classification == Classification::Full
    }

    /// Bundle name without the `.app` suffix.
    pub fn display_name(&self) -> &str {
        self.name.strip_suffix(".app").unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub id: String,
    pub name: Option<String>,
    pub mount_point: Option<String>,
    pub size_bytes: u64,
}

/// Snapshot of one whole physical disk as enumeration saw it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskRecord {
    pub id: String,
    pub label: String,
    pub capacity_bytes: u64,
    pub protocol: String,
    pub removable: bool,
    pub internal: bool,
    pub virtual_disk: bool,
    pub is_boot_disk: bool,
    pub volumes: Vec<VolumeRecord>,
}

impl DiskRecord {
    pub fn device_path(&self) -> String {
        format!("/dev/{}", self.id)
    }

    pub fn disk_number(&self) -> Option<u32> {
        parse_disk_number(&self.id)
    }

    pub fn slice_id(&self, index: u32) -> String {
        format!("{}s{}", self.id, index)
    }

    pub fn mount_points(&self) -> impl Iterator<Item = &str> {
        self.volumes
            .iter()
            .filter_map(|volume| volume.mount_point.as_deref())
    }

    /// Identity check used before mutation: a re-enumerated record must
    /// still describe the same physical device.
    pub fn same_device(&self, other: &DiskRecord) -> bool {
        self.id == other.id
            && self.capacity_bytes == other.capacity_bytes
            && self.protocol.eq_ignore_ascii_case(&other.protocol)
    }
}

/// Parses a whole-disk identifier (`disk4`, `/dev/disk4`). Slices such as
/// `disk4s2` are not whole disks and yield `None`.
pub fn parse_disk_number(id: &str) -> Option<u32> {
    let name = id.strip_prefix("/dev/").unwrap_or(id);
    let name = name.strip_prefix('r').filter(|rest| rest.starts_with("disk")).unwrap_or(name);
    let digits = name.strip_prefix("disk")?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartitionRole {
    Efi,
    OsInstaller,
    DataStore,
}

impl fmt::Display for PartitionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionRole::Efi => write!(f, "EFI"),
            PartitionRole::OsInstaller => write!(f, "OS_INSTALLER"),
            PartitionRole::DataStore => write!(f, "DATA_STORE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Filesystem {
    Fat32,
    JournaledHfsPlus,
    ExFat,
}

impl Filesystem {
    pub fn diskutil_name(&self) -> &'static str {
        match self {
            Filesystem::Fat32 => "MS-DOS FAT32",
            Filesystem::JournaledHfsPlus => "JHFS+",
            Filesystem::ExFat => "ExFAT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSpec {
    /// Slice number on the target disk (`diskNsK`).
    pub index: u32,
    pub role: PartitionRole,
    pub filesystem: Filesystem,
    pub label: String,
    pub size_bytes: u64,
    pub source: Option<InstallerRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanViolation {
    #[error("plan has no EFI partition ahead of the installer partitions")]
    MissingEfi,
    #[error("partition {label} is not in slot order (expected s{expected}, found s{found})")]
    SlotOrder {
        label: String,
        expected: u32,
        found: u32,
    },
    #[error("allocated {allocated} bytes plus {reserved} reserved exceeds disk capacity {capacity}")]
    Overcommitted {
        allocated: u64,
        reserved: u64,
        capacity: u64,
    },
    #[error("allocated {allocated} + unallocated {unallocated} bytes does not equal capacity {capacity}")]
    Accounting {
        allocated: u64,
        unallocated: u64,
        capacity: u64,
    },
    #[error("partition {label} ({size} bytes) is smaller than its installer payload ({payload} bytes)")]
    Truncated { label: String, size: u64, payload: u64 },
    #[error("DATA_STORE partition {label} is not the last partition")]
    DataStoreNotLast { label: String },
}

/// An ordered partition layout computed for exactly one disk snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPlan {
    pub schema_version: u32,
    pub disk: DiskRecord,
    pub specs: Vec<PartitionSpec>,
    /// GPT headers plus the gap diskutil leaves after each installer slice.
    pub reserved_overhead_bytes: u64,
    pub unallocated_bytes: u64,
}

impl PartitionPlan {
    pub fn allocated_bytes(&self) -> u64 {
        self.specs.iter().map(|spec| spec.size_bytes).sum()
    }

    pub fn installer_specs(&self) -> impl Iterator<Item = &PartitionSpec> {
        self.specs
            .iter()
            .filter(|spec| spec.role == PartitionRole::OsInstaller)
    }

    pub fn data_store(&self) -> Option<&PartitionSpec> {
        self.specs
            .iter()
            .find(|spec| spec.role == PartitionRole::DataStore)
    }

    pub fn validate(&self) -> Result<(), PlanViolation> {
        let first = self.specs.first().ok_or(PlanViolation::MissingEfi)?;
        if first.role != PartitionRole::Efi {
            return Err(PlanViolation::MissingEfi);
        }

        for (position, spec) in self.specs.iter().enumerate() {
            let expected = position as u32 + 1;
            if spec.index != expected {
                return Err(PlanViolation::SlotOrder {
                    label: spec.label.clone(),
                    expected,
                    found: spec.index,
                });
            }
            if spec.role == PartitionRole::Efi && position != 0 {
                return Err(PlanViolation::MissingEfi);
            }
            if spec.role == PartitionRole::DataStore && position + 1 != self.specs.len() {
                return Err(PlanViolation::DataStoreNotLast {
                    label: spec.label.clone(),
                });
            }
            if let Some(source) = &spec.source {
                if spec.size_bytes < source.payload_bytes {
                    return Err(PlanViolation::Truncated {
                        label: spec.label.clone(),
                        size: spec.size_bytes,
                        payload: source.payload_bytes,
                    });
                }
            }
        }

        let allocated = self.allocated_bytes();
        let capacity = self.disk.capacity_bytes;
        if allocated.saturating_add(self.reserved_overhead_bytes) > capacity {
            return Err(PlanViolation::Overcommitted {
                allocated,
                reserved: self.reserved_overhead_bytes,
                capacity,
            });
        }
        if allocated.checked_add(self.unallocated_bytes) != Some(capacity) {
            return Err(PlanViolation::Accounting {
                allocated,
                unallocated: self.unallocated_bytes,
                capacity,
            });
        }
        Ok(())
    }

    /// Arguments for the single `diskutil partitionDisk` call that applies
    /// this plan. The EFI spec is implicit: a GPT scheme makes diskutil create
    /// the ESP as slice 1.
    pub fn partition_args(&self) -> Vec<String> {
        let mut args = vec![
            "partitionDisk".to_string(),
            self.disk.device_path(),
            "GPT".to_string(),
        ];
        for spec in &self.specs {
            match spec.role {
                PartitionRole::Efi => {}
                PartitionRole::OsInstaller => {
                    args.push(spec.filesystem.diskutil_name().to_string());
                    args.push(spec.label.clone());
                    args.push(format!("{}B", spec.size_bytes));
                }
                PartitionRole::DataStore => {
                    args.push(spec.filesystem.diskutil_name().to_string());
                    args.push(spec.label.clone());
                    args.push("R".to_string());
                }
            }
        }
        if self.data_store().is_none() {
            args.push("Free Space".to_string());
            args.push("UNALLOCATED".to_string());
            args.push("R".to_string());
        }
        args
    }

    pub fn rendered_command(&self) -> String {
        let args = self
            .partition_args()
            .into_iter()
            .map(|arg| {
                if arg.contains(' ') {
                    format!("\"{arg}\"")
                } else {
                    arg
                }
            })
            .collect::<Vec<_>>();
        format!("diskutil {}", args.join(" "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub disk_id: String,
    pub captured_at_unix: i64,
    pub captured_at_utc: String,
    pub table_text: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    DryRun,
    Live,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstallOutcome {
    Success,
    Failed { reason: String },
    Skipped { reason: String },
}

impl InstallOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, InstallOutcome::Success)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, InstallOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallerOutcome {
    pub installer: String,
    pub version: String,
    pub label: String,
    pub slice: String,
    pub outcome: InstallOutcome,
    pub branding_note: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverallStatus {
    DryRun,
    Success,
    Partial,
    Failed,
    Cancelled,
}

impl OverallStatus {
    pub fn from_outcomes(outcomes: &[InstallerOutcome], cancelled: bool) -> Self {
        if cancelled {
            return OverallStatus::Cancelled;
        }
        let succeeded = outcomes.iter().filter(|o| o.outcome.is_success()).count();
        if succeeded == outcomes.len() {
            OverallStatus::Success
        } else if succeeded == 0 {
            OverallStatus::Failed
        } else {
            OverallStatus::Partial
        }
    }
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            OverallStatus::DryRun => "DRY_RUN",
            OverallStatus::Success => "SUCCESS",
            OverallStatus::Partial => "PARTIAL",
            OverallStatus::Failed => "FAILED",
            OverallStatus::Cancelled => "CANCELLED",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub schema_version: u32,
    pub run_id: String,
    pub disk_id: String,
    pub mode: ExecutionKind,
    pub backup_path: Option<PathBuf>,
    pub partition_command: String,
    pub outcomes: Vec<InstallerOutcome>,
    pub status: OverallStatus,
    pub started_at_utc: String,
    pub finished_at_utc: String,
}

impl OperationResult {
    pub fn succeeded(&self) -> impl Iterator<Item = &InstallerOutcome> {
        self.outcomes.iter().filter(|o| o.outcome.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &InstallerOutcome> {
        self.outcomes.iter().filter(|o| o.outcome.is_failed())
    }
}

pub fn now_utc_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

pub fn unix_to_rfc3339(timestamp: i64) -> String {
    time::OffsetDateTime::from_unix_timestamp(timestamp)
        .ok()
        .and_then(|value| value.format(&Rfc3339).ok())
        .unwrap_or_else(|| "1970-01-01T00:00:00Z".to_string())
}
