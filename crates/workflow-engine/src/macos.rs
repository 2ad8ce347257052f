//! Live macOS wiring for the engine traits.

use crate::{Brander, DiskInspector, DiskMutator, InstallRunner};
use multiboot_core::{CommandError, CommandOutput, DiskRecord, InstallerRecord, PartitionPlan, Timeouts};
use multiboot_host_macos::{run_bless, run_createinstallmedia, CommandRunner, Diskutil};
use std::path::{Path, PathBuf};

pub struct MacosHost<R> {
    diskutil: Diskutil<R>,
    timeouts: Timeouts,
}

impl<R: CommandRunner> MacosHost<R> {
    pub fn new(runner: R, timeouts: Timeouts) -> Self {
        Self {
            diskutil: Diskutil::new(runner, timeouts.clone()),
            timeouts,
        }
    }

    /// Also the partition table source for backups.
    pub fn diskutil(&self) -> &Diskutil<R> {
        &self.diskutil
    }
}

impl<R: CommandRunner> DiskInspector for MacosHost<R> {
    fn enumerate(&self) -> Result<Vec<DiskRecord>, CommandError> {
        self.diskutil.external_disks()
    }

    fn refresh(&self, disk_id: &str) -> Result<DiskRecord, CommandError> {
        self.diskutil.disk(disk_id)
    }

    fn boot_disk_id(&self) -> Result<String, CommandError> {
        self.diskutil.boot_disk_id()
    }
}

impl<R: CommandRunner> DiskMutator for MacosHost<R> {
    fn apply_partition_table(&self, plan: &PartitionPlan) -> Result<CommandOutput, CommandError> {
        self.diskutil.partition_disk(plan)
    }

    fn prepare_volume(&self, slice_id: &str) -> Result<PathBuf, CommandError> {
        self.diskutil.mount_volume(slice_id)
    }
}

impl<R: CommandRunner> InstallRunner for MacosHost<R> {
    fn install(&self, installer: &InstallerRecord, volume: &Path) -> Result<CommandOutput, CommandError> {
        run_createinstallmedia(
            self.diskutil.runner(),
            &installer.path,
            volume,
            self.timeouts.install(),
        )
    }
}

impl<R: CommandRunner> Brander for MacosHost<R> {
    fn brand(&self, volume: &Path, label: &str) -> Result<(), CommandError> {
        run_bless(self.diskutil.runner(), volume, label, self.timeouts.branding()).map(|_| ())
    }
}
