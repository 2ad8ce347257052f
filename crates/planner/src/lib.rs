use multiboot_core::version::install_buffer;
use multiboot_core::{
    Classification, DiskRecord, Filesystem, InstallerRecord, PartitionPlan, PartitionRole,
    PartitionSpec, GIB, MIB, PLAN_SCHEMA_VERSION,
};
use multiboot_safety::{ensure_eligible, DiskIneligible, SafetyContext};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub mod label;

use label::{base_label, LabelAllocator};

pub const EFI_LABEL: &str = "EFI";
pub const DATA_STORE_LABEL: &str = "DATA_STORE";

/// Sizing constants, all in bytes except `overhead_percent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannerPolicy {
    pub alignment: u64,
    /// The ESP diskutil creates for a GPT scheme.
    pub efi_size: u64,
    /// Primary and backup GPT headers plus alignment slack.
    pub gpt_reserve: u64,
    pub overhead_percent: u64,
    pub boot_files_reserve: u64,
    /// Install scratch space for releases missing from the catalog.
    pub default_install_buffer: u64,
    /// Replaces the per-release install buffer when set.
    pub install_buffer_override: Option<u64>,
    /// Free space diskutil leaves after each HFS+ partition (TN2166).
    pub partition_gap: u64,
    pub min_installer_partition: u64,
    pub min_data_store: u64,
}

impl Default for PlannerPolicy {
    fn default() -> Self {
        Self {
            alignment: MIB,
            efi_size: 200 * MIB,
            gpt_reserve: 2 * MIB,
            overhead_percent: 6,
            boot_files_reserve: 200 * MIB,
            default_install_buffer: GIB,
            install_buffer_override: None,
            partition_gap: 128 * MIB,
            min_installer_partition: 5500 * MIB,
            min_data_store: 2 * GIB,
        }
    }
}

impl PlannerPolicy {
    pub fn minimum_viable_capacity(&self) -> u64 {
        self.gpt_reserve + self.efi_size + self.min_installer_partition + self.partition_gap
    }

    /// Filesystem and boot-file headroom on top of the payload.
    pub fn overhead(&self, payload: u64) -> u64 {
        let percent = (payload as u128 * self.overhead_percent as u128).div_ceil(100) as u64;
        percent.saturating_add(self.boot_files_reserve)
    }

    pub fn install_buffer(&self, installer: &InstallerRecord) -> u64 {
        self.install_buffer_override
            .or_else(|| install_buffer(&installer.name, &installer.version))
            .unwrap_or(self.default_install_buffer)
    }

    /// Payload plus overhead plus the release's install buffer, never below
    /// the minimum. Monotonic in the payload for a given release.
    pub fn installer_partition_size(&self, installer: &InstallerRecord) -> u64 {
        let payload = installer.payload_bytes;
        let needed = payload
            .saturating_add(self.overhead(payload))
            .saturating_add(self.install_buffer(installer));
        align_up(needed, self.alignment).max(self.min_installer_partition)
    }
}

pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    value.div_ceil(alignment).saturating_mul(alignment)
}

pub fn align_down(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    value / alignment * alignment
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("no installers selected")]
    EmptySelection,
    #[error("{installer} is {classification}, only FULL installers can be planned{}", reason_suffix(.reason))]
    NotFull {
        installer: String,
        classification: Classification,
        reason: Option<String>,
    },
    #[error(transparent)]
    DiskIneligible(#[from] DiskIneligible),
    #[error("disk {disk_id} holds {capacity} bytes, at least {minimum} are needed for one installer")]
    DiskTooSmall {
        disk_id: String,
        capacity: u64,
        minimum: u64,
    },
    #[error("disk {disk_id} needs {required} bytes but has {available} ({shortfall} short)")]
    InsufficientSpace {
        disk_id: String,
        required: u64,
        available: u64,
        shortfall: u64,
    },
}

fn reason_suffix(reason: &Option<String>) -> String {
    reason
        .as_deref()
        .map(|reason| format!(" ({reason})"))
        .unwrap_or_default()
}

#[derive(Debug, Clone, Default)]
pub struct PartitionPlanner {
    policy: PlannerPolicy,
}

impl PartitionPlanner {
    pub fn new(policy: PlannerPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &PlannerPolicy {
        &self.policy
    }

    /// Lays out EFI, one partition per selected installer in selection order,
    /// and a trailing DATA_STORE when enough space is left.
    pub fn plan(
        &self,
        selected: &[InstallerRecord],
        disk: &DiskRecord,
        ctx: &SafetyContext,
    ) -> Result<PartitionPlan, PlanError> {
        if selected.is_empty() {
            return Err(PlanError::EmptySelection);
        }
        if let Some(installer) = selected.iter().find(|installer| !installer.is_full()) {
            return Err(PlanError::NotFull {
                installer: installer.name.clone(),
                classification: installer.classification,
                reason: installer.reason.clone(),
            });
        }
        ensure_eligible(ctx, disk)?;

        let policy = &self.policy;
        let capacity = disk.capacity_bytes;
        let minimum = policy.minimum_viable_capacity();
        if capacity < minimum {
            return Err(PlanError::DiskTooSmall {
                disk_id: disk.id.clone(),
                capacity,
                minimum,
            });
        }

        let mut specs = vec![PartitionSpec {
            index: 1,
            role: PartitionRole::Efi,
            filesystem: Filesystem::Fat32,
            label: EFI_LABEL.to_string(),
            size_bytes: policy.efi_size,
            source: None,
        }];

        let mut labels = LabelAllocator::default();
        for installer in selected {
            let size = policy.installer_partition_size(installer);
            let label = labels.allocate(&base_label(installer));
            debug!(
                installer = %installer.name,
                payload = installer.payload_bytes,
                size,
                %label,
                "sized installer partition"
            );
            specs.push(PartitionSpec {
                index: specs.len() as u32 + 1,
                role: PartitionRole::OsInstaller,
                filesystem: Filesystem::JournaledHfsPlus,
                label,
                size_bytes: size,
                source: Some(installer.clone()),
            });
        }

        let allocated: u64 = specs.iter().map(|spec| spec.size_bytes).sum();
        let reserved = policy
            .gpt_reserve
            .saturating_add(policy.partition_gap.saturating_mul(selected.len() as u64));
        let required = reserved.saturating_add(allocated);
        if required > capacity {
            return Err(PlanError::InsufficientSpace {
                disk_id: disk.id.clone(),
                required,
                available: capacity,
                shortfall: required - capacity,
            });
        }

        let remaining = align_down(capacity - required, policy.alignment);
        if remaining >= policy.min_data_store {
            specs.push(PartitionSpec {
                index: specs.len() as u32 + 1,
                role: PartitionRole::DataStore,
                filesystem: Filesystem::ExFat,
                label: DATA_STORE_LABEL.to_string(),
                size_bytes: remaining,
                source: None,
            });
        } else {
            debug!(remaining, "leftover space too small for DATA_STORE");
        }

        let allocated: u64 = specs.iter().map(|spec| spec.size_bytes).sum();
        let plan = PartitionPlan {
            schema_version: PLAN_SCHEMA_VERSION,
            disk: disk.clone(),
            specs,
            reserved_overhead_bytes: reserved,
            unallocated_bytes: capacity - allocated,
        };
        info!(
            disk_id = %disk.id,
            installers = selected.len(),
            allocated,
            unallocated = plan.unallocated_bytes,
            "partition plan computed"
        );
        Ok(plan)
    }
}
