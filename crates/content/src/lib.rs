use multiboot_core::{Classification, InstallerRecord, MIB};
use std::path::{Path, PathBuf};

pub mod scanner;

pub use scanner::{scan_locations, ScanError, ScanReport, MIST_TEMP_DIR};

/// Below this the bundle is the small App Store stub, not a full installer.
pub const STUB_THRESHOLD: u64 = 50 * MIB;
pub const MIN_ARCHIVE_SIZE: u64 = 100 * MIB;
pub const KNOWN_ARCHIVES: &[&str] = &["SharedSupport.dmg", "BaseSystem.dmg"];

/// Read-only view of an installer's payload archives.
pub trait PayloadView {
    fn is_readable(&self) -> bool;
    fn has_archive(&self, name: &str) -> bool;
    fn size_of(&self, name: &str) -> Option<u64>;
}

/// Looks in `<app>/Contents/SharedSupport/` on the local filesystem.
#[derive(Debug, Clone)]
pub struct FsPayloadView {
    shared_support: PathBuf,
}

impl FsPayloadView {
    pub fn new(app_path: impl AsRef<Path>) -> Self {
        Self {
            shared_support: app_path.as_ref().join("Contents").join("SharedSupport"),
        }
    }

    pub fn for_record(record: &InstallerRecord) -> Self {
        Self::new(&record.path)
    }
}

impl PayloadView for FsPayloadView {
    fn is_readable(&self) -> bool {
        std::fs::read_dir(&self.shared_support).is_ok()
    }

    fn has_archive(&self, name: &str) -> bool {
        self.shared_support.join(name).is_file()
    }

    fn size_of(&self, name: &str) -> Option<u64> {
        std::fs::metadata(self.shared_support.join(name))
            .ok()
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len())
    }
}

/// Classifies one installer as FULL or STUB. A record the scanner already
/// marked PARTIAL is returned unchanged.
pub fn classify(installer: &InstallerRecord, view: &dyn PayloadView) -> InstallerRecord {
    if installer.classification == Classification::Partial {
        return installer.clone();
    }

    if !view.is_readable() {
        return stub(installer, "payload unreadable".to_string());
    }

    if installer.payload_bytes < STUB_THRESHOLD {
        return stub(
            installer,
            format!(
                "payload is only {} (stub threshold {})",
                format_mb(installer.payload_bytes),
                format_mb(STUB_THRESHOLD)
            ),
        );
    }

    let mut problems = Vec::new();
    for archive in KNOWN_ARCHIVES {
        let size = if view.has_archive(archive) {
            view.size_of(archive)
        } else {
            None
        };
        match size {
            Some(bytes) if bytes >= MIN_ARCHIVE_SIZE => {
                return installer.with_classification(Classification::Full, None);
            }
            Some(bytes) => problems.push(format!("{archive} too small ({})", format_mb(bytes))),
            None => problems.push(format!("{archive} missing")),
        }
    }

    stub(installer, problems.join(", "))
}

fn stub(installer: &InstallerRecord, reason: String) -> InstallerRecord {
    tracing::debug!(installer = %installer.name, %reason, "installer classified as stub");
    installer.with_classification(Classification::Stub, Some(reason))
}

fn format_mb(bytes: u64) -> String {
    format!("{:.1} MB", bytes as f64 / MIB as f64)
}
