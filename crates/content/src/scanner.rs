use multiboot_core::InstallerRecord;
use plist::Value;
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Where Mist keeps in-flight downloads.
pub const MIST_TEMP_DIR: &str = "/private/tmp/com.ninxsoft.mist";

const MIST_MARKER: &str = "com.ninxsoft.mist";
const PARTIAL_SUFFIX: &str = ".app.download";

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("cannot read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path} has no usable Info.plist: {detail}")]
    InfoPlist { path: PathBuf, detail: String },
}

/// Installers found plus the locations that had to be skipped.
#[derive(Debug, Default)]
pub struct ScanReport {
    pub installers: Vec<InstallerRecord>,
    pub warnings: Vec<ScanError>,
}

/// Scans each location one level deep. Missing locations are ignored;
/// unreadable ones become warnings. Returned installers are unclassified
/// (STUB until validated) except partial downloads.
pub fn scan_locations(paths: &[PathBuf], include_partials: bool) -> ScanReport {
    let mut report = ScanReport::default();
    let mut seen = HashSet::new();

    let mut locations = paths.to_vec();
    if include_partials {
        let mist = PathBuf::from(MIST_TEMP_DIR);
        if mist.is_dir() && !locations.contains(&mist) {
            locations.push(mist);
        }
    }

    for location in &locations {
        if !location.exists() {
            debug!(path = %location.display(), "search location missing");
            continue;
        }
        let entries = match sorted_entries(location) {
            Ok(entries) => entries,
            Err(source) => {
                warn!(path = %location.display(), error = %source, "skipping search location");
                report.warnings.push(ScanError::Unreadable {
                    path: location.clone(),
                    source,
                });
                continue;
            }
        };

        let in_mist = location.to_string_lossy().contains(MIST_MARKER);
        for entry in entries {
            let Some(file_name) = entry.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };

            if include_partials {
                if let Some(record) = partial_record(&entry, &file_name, in_mist) {
                    report.installers.push(record);
                    continue;
                }
            }

            if !(file_name.ends_with(".app") && file_name.contains("Install")) {
                continue;
            }
            let real = match entry.canonicalize() {
                Ok(real) => real,
                Err(_) => continue,
            };
            if !real.is_dir() || !seen.insert(real.clone()) {
                continue;
            }

            match read_bundle(&real, &file_name) {
                Ok(record) => report.installers.push(record),
                Err(err) => {
                    warn!(path = %real.display(), error = %err, "skipping installer bundle");
                    report.warnings.push(err);
                }
            }
        }
    }

    info!(
        installers = report.installers.len(),
        warnings = report.warnings.len(),
        "installer scan finished"
    );
    report
}

fn sorted_entries(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .collect::<Vec<_>>();
    entries.sort();
    Ok(entries)
}

fn partial_record(path: &Path, file_name: &str, in_mist: bool) -> Option<InstallerRecord> {
    if let Some(stem) = file_name.strip_suffix(".download").filter(|_| file_name.ends_with(PARTIAL_SUFFIX)) {
        return Some(InstallerRecord::partial(
            stem,
            path,
            "Partial",
            "download incomplete (.app.download bundle)",
        ));
    }
    if in_mist && path.is_dir() {
        return Some(InstallerRecord::partial(
            format!("Mist Download: {file_name}"),
            path,
            "In Progress",
            "Mist download in progress",
        ));
    }
    None
}

fn read_bundle(app: &Path, file_name: &str) -> Result<InstallerRecord, ScanError> {
    let info_path = app.join("Contents").join("Info.plist");
    let info = Value::from_file(&info_path).map_err(|err| ScanError::InfoPlist {
        path: app.to_path_buf(),
        detail: err.to_string(),
    })?;
    let dict = info.as_dictionary().ok_or_else(|| ScanError::InfoPlist {
        path: app.to_path_buf(),
        detail: "top level is not a dictionary".to_string(),
    })?;

    let version = dict
        .get("CFBundleShortVersionString")
        .and_then(Value::as_string)
        .unwrap_or("Unknown");
    let bundle_id = dict
        .get("CFBundleIdentifier")
        .and_then(Value::as_string)
        .unwrap_or_default();

    let payload_bytes = tree_size(app);
    debug!(installer = %file_name, %version, payload_bytes, "found installer bundle");
    Ok(InstallerRecord::scanned(file_name, app, bundle_id, version, payload_bytes))
}

/// Apparent size of a directory tree. Symlinks are not followed and
/// unreadable entries count as zero.
pub fn tree_size(path: &Path) -> u64 {
    let Ok(meta) = std::fs::symlink_metadata(path) else {
        return 0;
    };
    if meta.is_file() {
        return meta.len();
    }
    if !meta.is_dir() {
        return 0;
    }
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .map(|entry| tree_size(&entry.path()))
        .sum()
}
