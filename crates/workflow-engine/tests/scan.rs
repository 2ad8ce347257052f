use multiboot_content::{PayloadView, ScanReport};
use multiboot_core::{Classification, CommandError, DiskRecord, InstallerRecord, VolumeRecord};
use multiboot_planner::PartitionPlanner;
use multiboot_workflow_engine::{scan, select_installers, DiskInspector, EngineError, InstallerScanner};

const GB: u64 = 1_000_000_000;

struct Archives(Vec<(&'static str, u64)>);

impl PayloadView for Archives {
    fn is_readable(&self) -> bool {
        true
    }

    fn has_archive(&self, name: &str) -> bool {
        self.0.iter().any(|(archive, _)| *archive == name)
    }

    fn size_of(&self, name: &str) -> Option<u64> {
        self.0
            .iter()
            .find(|(archive, _)| *archive == name)
            .map(|(_, size)| *size)
    }
}

/// Sonoma ships a full payload, Sequoia is a stub, Ventura is still
/// downloading.
struct FakeScanner;

impl InstallerScanner for FakeScanner {
    fn scan(&self) -> ScanReport {
        ScanReport {
            installers: vec![
                InstallerRecord::scanned(
                    "Install macOS Sonoma.app",
                    "/Applications/Install macOS Sonoma.app",
                    "com.apple.InstallAssistant.macOSSonoma",
                    "14.6",
                    13_520_000_000,
                ),
                InstallerRecord::scanned(
                    "Install macOS Sequoia.app",
                    "/Applications/Install macOS Sequoia.app",
                    "com.apple.InstallAssistant.macOSSequoia",
                    "15.1",
                    24_000_000,
                ),
                InstallerRecord::partial(
                    "Install macOS Ventura.app.download",
                    "/Applications/Install macOS Ventura.app.download",
                    "Unknown",
                    "download in progress",
                ),
            ],
            warnings: vec![],
        }
    }

    fn payload_view(&self, installer: &InstallerRecord) -> Box<dyn PayloadView> {
        if installer.name.contains("Sonoma") {
            Box::new(Archives(vec![("SharedSupport.dmg", 13_400_000_000)]))
        } else {
            Box::new(Archives(vec![]))
        }
    }
}

fn disk(id: &str, protocol: &str, internal: bool, mounts: &[&str]) -> DiskRecord {
    DiskRecord {
        id: id.to_string(),
        label: format!("{id} media"),
        capacity_bytes: 64 * GB,
        protocol: protocol.to_string(),
        removable: !internal,
        internal,
        virtual_disk: false,
        is_boot_disk: false,
        volumes: mounts
            .iter()
            .enumerate()
            .map(|(i, mount)| VolumeRecord {
                id: format!("{id}s{}", i + 1),
                name: None,
                mount_point: Some(mount.to_string()),
                size_bytes: GB,
            })
            .collect(),
    }
}

struct FakeInspector {
    fail: bool,
}

impl DiskInspector for FakeInspector {
    fn enumerate(&self) -> Result<Vec<DiskRecord>, CommandError> {
        if self.fail {
            return Err(CommandError::Unsupported {
                program: "/usr/sbin/diskutil".to_string(),
            });
        }
        Ok(vec![
            disk("disk0", "Apple Fabric", true, &["/"]),
            disk("disk4", "USB", false, &["/Volumes/Untitled"]),
            disk("disk5", "USB", false, &["/System/Volumes/Data"]),
            disk("disk6", "Thunderbolt", false, &[]),
        ])
    }

    fn refresh(&self, _disk_id: &str) -> Result<DiskRecord, CommandError> {
        unreachable!("scan never refreshes")
    }

    fn boot_disk_id(&self) -> Result<String, CommandError> {
        Ok("disk0".to_string())
    }
}

#[test]
fn scan_classifies_installers_and_filters_disks() {
    let outcome = scan(&FakeScanner, &FakeInspector { fail: false }).expect("scan");

    assert_eq!(outcome.boot_disk_id, "disk0");
    let classes: Vec<_> = outcome
        .installers
        .iter()
        .map(|installer| installer.classification)
        .collect();
    assert_eq!(
        classes,
        vec![Classification::Full, Classification::Stub, Classification::Partial]
    );
    assert_eq!(outcome.full_installers().count(), 1);

    let safe: Vec<_> = outcome.disks.iter().map(|disk| disk.id.as_str()).collect();
    assert_eq!(safe, vec!["disk4", "disk6"]);
    let excluded: Vec<_> = outcome
        .excluded_disks
        .iter()
        .map(|excluded| excluded.disk.id.as_str())
        .collect();
    assert_eq!(excluded, vec!["disk0", "disk5"]);
}

#[test]
fn enumeration_failure_is_fatal() {
    let err = scan(&FakeScanner, &FakeInspector { fail: true }).expect_err("failure");
    assert!(matches!(err, EngineError::Inspect { .. }));
}

#[test]
fn selected_full_installer_plans_onto_safe_disk() {
    let outcome = scan(&FakeScanner, &FakeInspector { fail: false }).expect("scan");
    let selection = select_installers(&outcome, &["Install macOS Sonoma".to_string()]).expect("select");
    let target = outcome.disk("disk4").expect("disk4");

    let plan = PartitionPlanner::default()
        .plan(&selection, target, &outcome.safety_context())
        .expect("plan");
    assert_eq!(plan.installer_specs().count(), 1);
    assert!(plan.data_store().is_some());
}

#[test]
fn stub_selection_is_refused_by_the_planner() {
    let outcome = scan(&FakeScanner, &FakeInspector { fail: false }).expect("scan");
    let selection = select_installers(
        &outcome,
        &["/Applications/Install macOS Sequoia.app".to_string()],
    )
    .expect("select");
    let target = outcome.disk("disk4").expect("disk4");

    assert!(PartitionPlanner::default()
        .plan(&selection, target, &outcome.safety_context())
        .is_err());
}

#[test]
fn unknown_selection_names_the_query() {
    let outcome = scan(&FakeScanner, &FakeInspector { fail: false }).expect("scan");
    let err = select_installers(&outcome, &["Install OS X Yosemite".to_string()]).expect_err("missing");
    assert!(err.contains("Install OS X Yosemite"));
}
