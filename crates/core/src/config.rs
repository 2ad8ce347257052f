use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BACKUP_DIR: &str = "/var/db/multiboot/backups";
pub const DEFAULT_REPORT_DIR: &str = "/var/db/multiboot/reports";
pub const CONFIG_ENV: &str = "MULTIBOOT_CONFIG";
pub const BACKUP_DIR_ENV: &str = "MULTIBOOT_BACKUP_DIR";
pub const REPORT_DIR_ENV: &str = "MULTIBOOT_REPORT_DIR";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub diskutil_secs: u64,
    pub partition_secs: u64,
    pub install_secs: u64,
    pub branding_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            diskutil_secs: 120,
            partition_secs: 900,
            install_secs: 90 * 60,
            branding_secs: 120,
        }
    }
}

impl Timeouts {
    pub fn diskutil(&self) -> Duration {
        Duration::from_secs(self.diskutil_secs)
    }

    pub fn partition(&self) -> Duration {
        Duration::from_secs(self.partition_secs)
    }

    pub fn install(&self) -> Duration {
        Duration::from_secs(self.install_secs)
    }

    pub fn branding(&self) -> Duration {
        Duration::from_secs(self.branding_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub backup_dir: PathBuf,
    pub report_dir: PathBuf,
    pub search_paths: Vec<PathBuf>,
    pub include_partial_downloads: bool,
    /// Fixed install buffer for every installer partition, replacing the
    /// per-release catalog value.
    pub install_buffer_mib: Option<u64>,
    pub timeouts: Timeouts,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let home = std::env::var_os("HOME").map(PathBuf::from);
        Self {
            backup_dir: PathBuf::from(DEFAULT_BACKUP_DIR),
            report_dir: PathBuf::from(DEFAULT_REPORT_DIR),
            search_paths: default_search_paths(home.as_deref()),
            include_partial_downloads: true,
            install_buffer_mib: None,
            timeouts: Timeouts::default(),
        }
    }
}

pub fn default_search_paths(home: Option<&Path>) -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from("/Applications"),
        PathBuf::from("/Applications/Utilities"),
    ];
    if let Some(home) = home {
        paths.push(home.join("Downloads"));
        paths.push(home.join("Desktop"));
    }
    paths
}

impl EngineConfig {
    /// Reads a JSON config file. Keys missing from the file keep their
    /// defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: EngineConfig = serde_json::from_str(&data)
            .with_context(|| format!("parse config {}", path.display()))?;
        Ok(config)
    }

    /// Resolves the config file from an explicit path, then `MULTIBOOT_CONFIG`,
    /// then built-in defaults, and applies environment overrides.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = match explicit.map(Path::to_path_buf).or(env_path) {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup(BACKUP_DIR_ENV).filter(|v| !v.trim().is_empty()) {
            self.backup_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup(REPORT_DIR_ENV).filter(|v| !v.trim().is_empty()) {
            self.report_dir = PathBuf::from(dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let path = dir.path().join("multiboot.json");
        std::fs::write(
            &path,
            r#"{ "backup_dir": "/tmp/backups", "install_buffer_mib": 4096, "timeouts": { "install_secs": 60 } }"#,
        )
        .expect("write config");

        let config = EngineConfig::load(&path).expect("load");
        assert_eq!(config.backup_dir, PathBuf::from("/tmp/backups"));
        assert_eq!(config.report_dir, PathBuf::from(DEFAULT_REPORT_DIR));
        assert_eq!(config.timeouts.install_secs, 60);
        assert_eq!(config.install_buffer_mib, Some(4096));
        assert_eq!(config.timeouts.diskutil_secs, 120);
        assert!(config.include_partial_downloads);
    }

    #[test]
    fn malformed_file_reports_path() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").expect("write config");

        let err = EngineConfig::load(&path).expect_err("parse should fail");
        assert!(format!("{err:#}").contains("broken.json"));
    }

    #[test]
    fn env_overrides_replace_directories() {
        let mut config = EngineConfig::default();
        config.apply_env_overrides(|key| match key {
            BACKUP_DIR_ENV => Some("/Volumes/Safe/backups".to_string()),
            REPORT_DIR_ENV => Some("  ".to_string()),
            _ => None,
        });
        assert_eq!(config.backup_dir, PathBuf::from("/Volumes/Safe/backups"));
        assert_eq!(config.report_dir, PathBuf::from(DEFAULT_REPORT_DIR));
    }

    #[test]
    fn search_paths_include_home_folders() {
        let paths = default_search_paths(Some(Path::new("/Users/sam")));
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/Applications"),
                PathBuf::from("/Applications/Utilities"),
                PathBuf::from("/Users/sam/Downloads"),
                PathBuf::from("/Users/sam/Desktop"),
            ]
        );
    }
}
