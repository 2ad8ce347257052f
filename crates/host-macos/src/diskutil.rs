use crate::runner::CommandRunner;
use multiboot_core::{
    parse_disk_number, CommandError, CommandOutput, CommandRequest, DiskRecord, PartitionPlan,
    Timeouts, VolumeRecord,
};
use plist::{Dictionary, Value};
use std::io::Cursor;
use std::path::PathBuf;
use tracing::{debug, info, warn};

pub const DISKUTIL: &str = "/usr/sbin/diskutil";

/// The fields of `diskutil info -plist` the engine uses.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiskInfo {
    pub device_identifier: String,
    pub media_name: String,
    pub total_size: u64,
    pub bus_protocol: String,
    pub removable: bool,
    pub internal: bool,
    pub virtual_disk: bool,
    pub parent_whole_disk: Option<String>,
    pub mount_point: Option<String>,
    pub volume_name: Option<String>,
}

/// One entry of `AllDisksAndPartitions` from `diskutil list -plist`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedDisk {
    pub id: String,
    pub size: u64,
    pub volumes: Vec<VolumeRecord>,
}

pub fn parse_plist(program: &str, bytes: &[u8]) -> Result<Value, CommandError> {
    Value::from_reader(Cursor::new(bytes)).map_err(|err| CommandError::Malformed {
        program: program.to_string(),
        detail: err.to_string(),
    })
}

fn dictionary<'a>(value: &'a Value, what: &str) -> Result<&'a Dictionary, CommandError> {
    value.as_dictionary().ok_or_else(|| CommandError::Malformed {
        program: DISKUTIL.to_string(),
        detail: format!("{what} is not a dictionary"),
    })
}

fn string(dict: &Dictionary, key: &str) -> Option<String> {
    dict.get(key)
        .and_then(Value::as_string)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn boolean(dict: &Dictionary, key: &str) -> Option<bool> {
    dict.get(key).and_then(Value::as_boolean)
}

fn unsigned(dict: &Dictionary, key: &str) -> Option<u64> {
    dict.get(key).and_then(Value::as_unsigned_integer)
}

pub fn parse_disk_info(value: &Value) -> Result<DiskInfo, CommandError> {
    let dict = dictionary(value, "diskutil info output")?;
    let device_identifier = string(dict, "DeviceIdentifier").ok_or_else(|| CommandError::Malformed {
        program: DISKUTIL.to_string(),
        detail: "DeviceIdentifier missing".to_string(),
    })?;

    let virtual_disk = boolean(dict, "Virtual").unwrap_or(false)
        || string(dict, "VirtualOrPhysical").is_some_and(|v| v.eq_ignore_ascii_case("virtual"));

    Ok(DiskInfo {
        media_name: string(dict, "MediaName")
            .or_else(|| string(dict, "IORegistryEntryName"))
            .unwrap_or_else(|| "Unknown".to_string()),
        total_size: unsigned(dict, "TotalSize")
            .or_else(|| unsigned(dict, "Size"))
            .unwrap_or(0),
        bus_protocol: string(dict, "BusProtocol").unwrap_or_default(),
        removable: boolean(dict, "RemovableMedia")
            .or_else(|| boolean(dict, "Removable"))
            .unwrap_or(false),
        // Missing means internal.
        internal: boolean(dict, "Internal").unwrap_or(true),
        virtual_disk,
        parent_whole_disk: string(dict, "ParentWholeDisk"),
        mount_point: string(dict, "MountPoint"),
        volume_name: string(dict, "VolumeName"),
        device_identifier,
    })
}

fn volume(dict: &Dictionary) -> Option<VolumeRecord> {
    Some(VolumeRecord {
        id: string(dict, "DeviceIdentifier")?,
        name: string(dict, "VolumeName"),
        mount_point: string(dict, "MountPoint"),
        size_bytes: unsigned(dict, "Size").unwrap_or(0),
    })
}

pub fn parse_disk_list(value: &Value) -> Result<Vec<ListedDisk>, CommandError> {
    let dict = dictionary(value, "diskutil list output")?;
    let Some(entries) = dict.get("AllDisksAndPartitions").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };

    let mut disks = Vec::new();
    for entry in entries.iter().filter_map(Value::as_dictionary) {
        let Some(id) = string(entry, "DeviceIdentifier") else {
            continue;
        };
        let mut volumes = Vec::new();
        for key in ["Partitions", "APFSVolumes"] {
            if let Some(items) = entry.get(key).and_then(Value::as_array) {
                volumes.extend(items.iter().filter_map(Value::as_dictionary).filter_map(volume));
            }
        }
        // A disk formatted without a partition map is its own volume.
        if let Some(mount_point) = string(entry, "MountPoint") {
            volumes.push(VolumeRecord {
                id: id.clone(),
                name: string(entry, "VolumeName"),
                mount_point: Some(mount_point),
                size_bytes: unsigned(entry, "Size").unwrap_or(0),
            });
        }
        disks.push(ListedDisk {
            size: unsigned(entry, "Size").unwrap_or(0),
            id,
            volumes,
        });
    }
    Ok(disks)
}

pub fn disk_record(info: &DiskInfo, volumes: Vec<VolumeRecord>, boot_disk_id: Option<&str>) -> DiskRecord {
    DiskRecord {
        id: info.device_identifier.clone(),
        label: info.media_name.clone(),
        capacity_bytes: info.total_size,
        protocol: info.bus_protocol.clone(),
        removable: info.removable,
        internal: info.internal,
        virtual_disk: info.virtual_disk,
        is_boot_disk: boot_disk_id == Some(info.device_identifier.as_str()),
        volumes,
    }
}

/// `diskutil` front end over a [`CommandRunner`].
pub struct Diskutil<R> {
    runner: R,
    timeouts: Timeouts,
}

impl<R: CommandRunner> Diskutil<R> {
    pub fn new(runner: R, timeouts: Timeouts) -> Self {
        Self { runner, timeouts }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput, CommandError> {
        let request = CommandRequest::new(DISKUTIL, args.iter().copied())
            .with_timeout(self.timeouts.diskutil());
        self.runner.run(&request)
    }

    fn plist(&self, args: &[&str]) -> Result<Value, CommandError> {
        let output = self.run(args)?;
        parse_plist(DISKUTIL, output.stdout.as_bytes())
    }

    pub fn info(&self, target: &str) -> Result<DiskInfo, CommandError> {
        parse_disk_info(&self.plist(&["info", "-plist", target])?)
    }

    /// Whole disk backing `/`.
    pub fn boot_disk_id(&self) -> Result<String, CommandError> {
        match self.info("/") {
            Ok(info) => Ok(info.parent_whole_disk.unwrap_or(info.device_identifier)),
            Err(err) => crate::mounts::root_whole_disk().ok_or(err),
        }
    }

    /// Every external physical disk. Disks whose info cannot be read are
    /// logged and left out.
    pub fn external_disks(&self) -> Result<Vec<DiskRecord>, CommandError> {
        let listed = parse_disk_list(&self.plist(&["list", "-plist", "external", "physical"])?)?;
        let boot = self.boot_disk_id().ok();

        let mut disks = Vec::new();
        for entry in listed {
            if parse_disk_number(&entry.id).is_none() {
                continue;
            }
            match self.info(&entry.id) {
                Ok(info) => disks.push(disk_record(&info, entry.volumes, boot.as_deref())),
                Err(err) => warn!(disk_id = %entry.id, error = %err, "skipping disk"),
            }
        }
        info!(count = disks.len(), "enumerated external disks");
        Ok(disks)
    }

    /// Fresh snapshot of one whole disk.
    pub fn disk(&self, disk_id: &str) -> Result<DiskRecord, CommandError> {
        let info = self.info(disk_id)?;
        let volumes = parse_disk_list(&self.plist(&["list", "-plist", disk_id])?)?
            .into_iter()
            .find(|entry| entry.id == disk_id)
            .map(|entry| entry.volumes)
            .unwrap_or_default();
        let boot = self.boot_disk_id().ok();
        Ok(disk_record(&info, volumes, boot.as_deref()))
    }

    pub fn partition_table_text(&self, disk_id: &str) -> Result<String, CommandError> {
        Ok(self.run(&["list", disk_id])?.stdout)
    }

    /// Applies the whole layout in one privileged call.
    pub fn partition_disk(&self, plan: &PartitionPlan) -> Result<CommandOutput, CommandError> {
        let request = CommandRequest::new(DISKUTIL, plan.partition_args())
            .privileged()
            .with_timeout(self.timeouts.partition());
        info!(disk_id = %plan.disk.id, command = %plan.rendered_command(), "partitioning disk");
        self.runner.run(&request)
    }

    /// Mounts a slice and returns where it landed.
    pub fn mount_volume(&self, slice_id: &str) -> Result<PathBuf, CommandError> {
        self.run(&["mount", slice_id])?;
        let info = self.info(slice_id)?;
        let mount_point = info.mount_point.ok_or_else(|| CommandError::Malformed {
            program: DISKUTIL.to_string(),
            detail: format!("{slice_id} has no mount point after mounting"),
        })?;
        debug!(slice = %slice_id, %mount_point, "volume mounted");
        Ok(PathBuf::from(mount_point))
    }
}

impl<R: CommandRunner> multiboot_backup::PartitionTableSource for Diskutil<R> {
    fn partition_table(&self, disk_id: &str) -> Result<String, CommandError> {
        self.partition_table_text(disk_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::time::Duration;

    const INFO_USB: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>BusProtocol</key><string>USB</string>
    <key>DeviceIdentifier</key><string>disk4</string>
    <key>Internal</key><false/>
    <key>MediaName</key><string>SanDisk Extreme</string>
    <key>RemovableMedia</key><true/>
    <key>TotalSize</key><integer>64023257088</integer>
    <key>VirtualOrPhysical</key><string>Physical</string>
</dict>
</plist>"#;

    const INFO_ROOT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict>
    <key>DeviceIdentifier</key><string>disk3s1s1</string>
    <key>MountPoint</key><string>/</string>
    <key>ParentWholeDisk</key><string>disk3</string>
</dict>
</plist>"#;

    const LIST_EXTERNAL: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict>
    <key>AllDisksAndPartitions</key>
    <array>
        <dict>
            <key>Content</key><string>GUID_partition_scheme</string>
            <key>DeviceIdentifier</key><string>disk4</string>
            <key>Partitions</key>
            <array>
                <dict>
                    <key>DeviceIdentifier</key><string>disk4s1</string>
                    <key>Size</key><integer>209715200</integer>
                    <key>VolumeName</key><string>EFI</string>
                </dict>
                <dict>
                    <key>DeviceIdentifier</key><string>disk4s2</string>
                    <key>MountPoint</key><string>/Volumes/USB</string>
                    <key>Size</key><integer>63000000000</integer>
                    <key>VolumeName</key><string>USB</string>
                </dict>
            </array>
            <key>Size</key><integer>64023257088</integer>
        </dict>
    </array>
    <key>WholeDisks</key>
    <array><string>disk4</string></array>
</dict>
</plist>"#;

    struct Scripted {
        replies: RefCell<VecDeque<Result<String, String>>>,
        seen: RefCell<Vec<CommandRequest>>,
    }

    impl Scripted {
        fn new(replies: &[Result<&str, &str>]) -> Self {
            Self {
                replies: RefCell::new(
                    replies
                        .iter()
                        .map(|reply| match reply {
                            Ok(stdout) => Ok(stdout.to_string()),
                            Err(stderr) => Err(stderr.to_string()),
                        })
                        .collect(),
                ),
                seen: RefCell::new(Vec::new()),
            }
        }
    }

    impl CommandRunner for Scripted {
        fn run(&self, request: &CommandRequest) -> Result<CommandOutput, CommandError> {
            self.seen.borrow_mut().push(request.clone());
            let reply = self
                .replies
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Err("unscripted call".to_string()));
            let output = |stdout: String, stderr: String, status| CommandOutput {
                program: request.program.clone(),
                args: request.args.clone(),
                status,
                stdout,
                stderr,
                duration: Duration::from_millis(1),
            };
            match reply {
                Ok(stdout) => Ok(output(stdout, String::new(), 0)),
                Err(stderr) => Err(CommandError::failed(output(String::new(), stderr, 1))),
            }
        }
    }

    #[test]
    fn parses_usb_disk_info() {
        let info = parse_disk_info(&parse_plist(DISKUTIL, INFO_USB.as_bytes()).expect("plist")).expect("info");
        assert_eq!(info.device_identifier, "disk4");
        assert_eq!(info.media_name, "SanDisk Extreme");
        assert_eq!(info.total_size, 64_023_257_088);
        assert_eq!(info.bus_protocol, "USB");
        assert!(info.removable);
        assert!(!info.internal);
        assert!(!info.virtual_disk);
    }

    #[test]
    fn parses_partitions_with_mount_points() {
        let listed = parse_disk_list(&parse_plist(DISKUTIL, LIST_EXTERNAL.as_bytes()).expect("plist")).expect("list");
        assert_eq!(listed.len(), 1);
        let disk = &listed[0];
        assert_eq!(disk.id, "disk4");
        assert_eq!(disk.volumes.len(), 2);
        assert_eq!(disk.volumes[0].mount_point, None);
        assert_eq!(disk.volumes[1].mount_point.as_deref(), Some("/Volumes/USB"));
    }

    #[test]
    fn garbage_output_is_malformed() {
        assert!(matches!(
            parse_plist(DISKUTIL, b"Could not find disk"),
            Err(CommandError::Malformed { .. })
        ));
        let no_id = parse_plist(DISKUTIL, b"<plist version=\"1.0\"><dict></dict></plist>").expect("plist");
        assert!(parse_disk_info(&no_id).is_err());
    }

    #[test]
    fn enumerates_external_disks_with_boot_flag() {
        let runner = Scripted::new(&[Ok(LIST_EXTERNAL), Ok(INFO_ROOT), Ok(INFO_USB)]);
        let diskutil = Diskutil::new(&runner, Timeouts::default());
        let disks = diskutil.external_disks().expect("enumerate");
        assert_eq!(disks.len(), 1);
        assert_eq!(disks[0].id, "disk4");
        assert!(!disks[0].is_boot_disk);
        assert_eq!(disks[0].volumes.len(), 2);

        let seen = runner.seen.borrow();
        assert_eq!(seen[0].args, vec!["list", "-plist", "external", "physical"]);
        assert_eq!(seen[1].args, vec!["info", "-plist", "/"]);
        assert_eq!(seen[2].args, vec!["info", "-plist", "disk4"]);
        assert!(seen.iter().all(|r| !r.privileged));
    }

    #[test]
    fn boot_disk_is_parent_whole_disk() {
        let runner = Scripted::new(&[Ok(INFO_ROOT)]);
        let diskutil = Diskutil::new(&runner, Timeouts::default());
        assert_eq!(diskutil.boot_disk_id().expect("boot"), "disk3");
    }

    #[test]
    fn partition_disk_is_privileged_with_long_timeout() {
        let runner = Scripted::new(&[Err("Error: -69877: Couldn't open device")]);
        let timeouts = Timeouts::default();
        let diskutil = Diskutil::new(&runner, timeouts.clone());
        let plan = PartitionPlan {
            schema_version: 1,
            disk: disk_record(
                &parse_disk_info(&parse_plist(DISKUTIL, INFO_USB.as_bytes()).expect("plist")).expect("info"),
                vec![],
                None,
            ),
            specs: vec![],
            reserved_overhead_bytes: 0,
            unallocated_bytes: 0,
        };
        let err = diskutil.partition_disk(&plan).expect_err("fails");
        assert_eq!(err.diagnostic(), "Error: -69877: Couldn't open device");

        let seen = runner.seen.borrow();
        assert!(seen[0].privileged);
        assert_eq!(seen[0].timeout, timeouts.partition());
        assert_eq!(&seen[0].args[..3], &["partitionDisk", "/dev/disk4", "GPT"]);
    }

    #[test]
    fn mount_volume_reads_mount_point() {
        let mounted = r#"<plist version="1.0"><dict>
            <key>DeviceIdentifier</key><string>disk4s2</string>
            <key>MountPoint</key><string>/Volumes/INSTALL_Sonoma_14_6</string>
        </dict></plist>"#;
        let runner = Scripted::new(&[Ok("Volume INSTALL_Sonoma_14_6 on disk4s2 mounted"), Ok(mounted)]);
        let diskutil = Diskutil::new(&runner, Timeouts::default());
        assert_eq!(
            diskutil.mount_volume("disk4s2").expect("mount"),
            PathBuf::from("/Volumes/INSTALL_Sonoma_14_6")
        );
    }
}
