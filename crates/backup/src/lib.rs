use multiboot_core::{unix_to_rfc3339, BackupRecord, CommandError, DiskRecord};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const FILE_PREFIX: &str = "partition_table_";
const FILE_SUFFIX: &str = ".txt";
/// How many later seconds to try when the timestamped name is taken.
const MAX_NAME_ATTEMPTS: i64 = 60;

/// Produces the human-readable partition table of a whole disk.
pub trait PartitionTableSource {
    fn partition_table(&self, disk_id: &str) -> Result<String, CommandError>;
}

impl<T: PartitionTableSource + ?Sized> PartitionTableSource for &T {
    fn partition_table(&self, disk_id: &str) -> Result<String, CommandError> {
        (**self).partition_table(disk_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("could not read partition table of {disk_id}: {source}")]
    Capture {
        disk_id: String,
        #[source]
        source: CommandError,
    },
    #[error("partition table of {disk_id} came back empty")]
    EmptyTable { disk_id: String },
    #[error("could not create backup directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not write backup {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no free backup file name for {disk_id} near {timestamp}")]
    NameExhausted { disk_id: String, timestamp: i64 },
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub struct BackupManager<S> {
    dir: PathBuf,
    source: S,
}

impl<S: PartitionTableSource> BackupManager<S> {
    pub fn new(dir: impl Into<PathBuf>, source: S) -> Self {
        Self {
            dir: dir.into(),
            source,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot(&self, disk: &DiskRecord) -> Result<BackupRecord, BackupError> {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        self.snapshot_at(disk, now)
    }

    /// Captures the table and writes it under a name that did not exist
    /// before. The file is synced before the record is returned.
    pub fn snapshot_at(&self, disk: &DiskRecord, timestamp: i64) -> Result<BackupRecord, BackupError> {
        let table_text = self
            .source
            .partition_table(&disk.id)
            .map_err(|source| BackupError::Capture {
                disk_id: disk.id.clone(),
                source,
            })?;
        if table_text.trim().is_empty() {
            return Err(BackupError::EmptyTable {
                disk_id: disk.id.clone(),
            });
        }

        std::fs::create_dir_all(&self.dir).map_err(|source| BackupError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;

        for offset in 0..MAX_NAME_ATTEMPTS {
            let captured_at = timestamp + offset;
            let path = self.dir.join(backup_file_name(&disk.id, captured_at));
            let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(source) => return Err(BackupError::Write { path, source }),
            };
            fill_or_remove(file, &path, &table_text)?;

            info!(disk_id = %disk.id, path = %path.display(), "partition table backed up");
            return Ok(BackupRecord {
                disk_id: disk.id.clone(),
                captured_at_unix: captured_at,
                captured_at_utc: unix_to_rfc3339(captured_at),
                table_text,
                path,
            });
        }

        Err(BackupError::NameExhausted {
            disk_id: disk.id.clone(),
            timestamp,
        })
    }
}

/// A truncated backup must not be listed as the newest one, so a failed
/// write deletes the file it created.
fn fill_or_remove(mut file: File, path: &Path, text: &str) -> Result<(), BackupError> {
    let written = file.write_all(text.as_bytes()).and_then(|_| file.sync_all());
    let Err(source) = written else {
        return Ok(());
    };
    drop(file);
    if let Err(err) = std::fs::remove_file(path) {
        warn!(path = %path.display(), error = %err, "could not remove incomplete backup");
    }
    Err(BackupError::Write {
        path: path.to_path_buf(),
        source,
    })
}

pub fn backup_file_name(disk_id: &str, timestamp: i64) -> String {
    format!("{FILE_PREFIX}{disk_id}_{timestamp}{FILE_SUFFIX}")
}

/// Splits `partition_table_<disk>_<ts>.txt` into its disk id and timestamp.
pub fn parse_backup_file_name(name: &str) -> Option<(String, i64)> {
    let body = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
    let (disk_id, timestamp) = body.rsplit_once('_')?;
    if disk_id.is_empty() {
        return None;
    }
    Some((disk_id.to_string(), timestamp.parse().ok()?))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub disk_id: String,
    pub captured_at_unix: i64,
    pub captured_at_utc: String,
    pub path: PathBuf,
}

/// Backups in `dir`, newest first. `disk_id` must match exactly, so `disk1`
/// does not pick up `disk10`. A missing directory means no backups.
pub fn list_backups(dir: &Path, disk_id: Option<&str>) -> Result<Vec<BackupEntry>, BackupError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(BackupError::Read {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    let mut backups = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "skipping unreadable backup entry");
                continue;
            }
        };
        let file_name = entry.file_name();
        let Some((id, captured_at)) = file_name.to_str().and_then(parse_backup_file_name) else {
            continue;
        };
        if disk_id.is_some_and(|wanted| wanted != id) {
            continue;
        }
        backups.push(BackupEntry {
            disk_id: id,
            captured_at_unix: captured_at,
            captured_at_utc: unix_to_rfc3339(captured_at),
            path: entry.path(),
        });
    }

    backups.sort_by(|a, b| {
        b.captured_at_unix
            .cmp(&a.captured_at_unix)
            .then_with(|| a.path.cmp(&b.path))
    });
    Ok(backups)
}

pub fn latest_backup(dir: &Path, disk_id: &str) -> Result<Option<BackupEntry>, BackupError> {
    Ok(list_backups(dir, Some(disk_id))?.into_iter().next())
}

pub fn read_backup(path: &Path) -> Result<String, BackupError> {
    std::fs::read_to_string(path).map_err(|source| BackupError::Read {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    const TABLE: &str = "/dev/disk4 (external, physical):\n   #:  TYPE NAME  SIZE  IDENTIFIER\n   0:  GUID_partition_scheme  *64.0 GB  disk4\n";

    struct FixedTable {
        text: Result<String, String>,
        calls: Cell<usize>,
    }

    impl FixedTable {
        fn ok(text: &str) -> Self {
            Self {
                text: Ok(text.to_string()),
                calls: Cell::new(0),
            }
        }
    }

    impl PartitionTableSource for FixedTable {
        fn partition_table(&self, _disk_id: &str) -> Result<String, CommandError> {
            self.calls.set(self.calls.get() + 1);
            self.text.clone().map_err(|diagnostic| CommandError::Failed {
                program: "diskutil".to_string(),
                status: 1,
                diagnostic: diagnostic.clone(),
                stdout: String::new(),
                stderr: diagnostic,
            })
        }
    }

    fn disk(id: &str) -> DiskRecord {
        DiskRecord {
            id: id.to_string(),
            label: "Samsung BAR".to_string(),
            capacity_bytes: 64_000_000_000,
            protocol: "USB".to_string(),
            removable: true,
            internal: false,
            virtual_disk: false,
            is_boot_disk: false,
            volumes: vec![],
        }
    }

    #[test]
    fn snapshot_writes_timestamped_file() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let manager = BackupManager::new(dir.path().join("backups"), FixedTable::ok(TABLE));

        let record = manager.snapshot_at(&disk("disk4"), 1_700_000_000).expect("snapshot");
        assert_eq!(
            record.path,
            dir.path().join("backups/partition_table_disk4_1700000000.txt")
        );
        assert_eq!(record.captured_at_utc, "2023-11-14T22:13:20Z");
        assert_eq!(std::fs::read_to_string(&record.path).expect("read"), TABLE);
        assert_eq!(record.table_text, TABLE);
    }

    #[test]
    fn existing_backup_is_never_overwritten() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let manager = BackupManager::new(dir.path(), FixedTable::ok(TABLE));
        let taken = dir.path().join(backup_file_name("disk4", 100));
        std::fs::write(&taken, "older table").expect("seed");

        let record = manager.snapshot_at(&disk("disk4"), 100).expect("snapshot");
        assert_eq!(record.captured_at_unix, 101);
        assert_eq!(std::fs::read_to_string(&taken).expect("read"), "older table");
    }

    #[test]
    fn capture_failure_and_empty_table_are_errors() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let failing = BackupManager::new(
            dir.path(),
            FixedTable {
                text: Err("Could not find disk: disk9".to_string()),
                calls: Cell::new(0),
            },
        );
        let err = failing.snapshot_at(&disk("disk9"), 5).expect_err("capture fails");
        assert!(matches!(err, BackupError::Capture { ref disk_id, .. } if disk_id == "disk9"));
        assert_eq!(failing.source.calls.get(), 1);

        let empty = BackupManager::new(dir.path(), FixedTable::ok("  \n"));
        assert!(matches!(
            empty.snapshot_at(&disk("disk4"), 5),
            Err(BackupError::EmptyTable { .. })
        ));
        assert!(list_backups(dir.path(), None).expect("list").is_empty());
    }

    #[test]
    fn unwritable_directory_is_an_error() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "file").expect("seed");
        let manager = BackupManager::new(blocker.join("backups"), FixedTable::ok(TABLE));
        assert!(matches!(
            manager.snapshot_at(&disk("disk4"), 5),
            Err(BackupError::CreateDir { .. })
        ));
    }

    #[test]
    fn failed_write_leaves_no_partial_backup() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let path = dir.path().join(backup_file_name("disk4", 7));
        std::fs::write(&path, "").expect("seed");
        // Read-only handle, so the write fails with EBADF.
        let file = File::open(&path).expect("open");

        let err = fill_or_remove(file, &path, TABLE).expect_err("write fails");
        assert!(matches!(err, BackupError::Write { path: ref failed, .. } if failed == &path));
        assert!(!path.exists());
        assert!(list_backups(dir.path(), Some("disk4")).expect("list").is_empty());
    }

    #[test]
    fn listing_is_newest_first_with_exact_disk_match() {
        let dir = tempfile::tempdir().expect("tmpdir");
        for (id, ts) in [("disk1", 10), ("disk10", 30), ("disk1", 20), ("disk4", 15)] {
            std::fs::write(dir.path().join(backup_file_name(id, ts)), TABLE).expect("seed");
        }
        std::fs::write(dir.path().join("notes.txt"), "x").expect("seed");

        let all = list_backups(dir.path(), None).expect("list");
        let stamps: Vec<_> = all.iter().map(|b| b.captured_at_unix).collect();
        assert_eq!(stamps, vec![30, 20, 15, 10]);

        let disk1 = list_backups(dir.path(), Some("disk1")).expect("list");
        assert_eq!(disk1.len(), 2);
        assert!(disk1.iter().all(|b| b.disk_id == "disk1"));

        let latest = latest_backup(dir.path(), "disk1").expect("latest").expect("some");
        assert_eq!(latest.captured_at_unix, 20);
        assert_eq!(read_backup(&latest.path).expect("read"), TABLE);

        assert!(list_backups(&dir.path().join("missing"), None).expect("list").is_empty());
    }

    #[test]
    fn parses_file_names() {
        assert_eq!(
            parse_backup_file_name("partition_table_disk4_1700000000.txt"),
            Some(("disk4".to_string(), 1_700_000_000))
        );
        assert_eq!(parse_backup_file_name("partition_table_disk4.txt"), None);
        assert_eq!(parse_backup_file_name("partition_table__12.txt"), None);
        assert_eq!(parse_backup_file_name("table_disk4_12.txt"), None);
    }
}
