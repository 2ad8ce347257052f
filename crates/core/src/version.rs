use crate::MIB;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MacosVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl MacosVersion {
    pub fn major_minor(&self) -> String {
        format!("{}.{}", self.major, self.minor)
    }

    /// Catalog key: `10.x` releases are keyed by minor, later ones by major.
    pub fn catalog_key(&self) -> String {
        if self.major == 10 {
            format!("10.{}", self.minor)
        } else {
            self.major.to_string()
        }
    }
}

impl fmt::Display for MacosVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.patch > 0 {
            write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
        } else {
            write!(f, "{}.{}", self.major, self.minor)
        }
    }
}

/// Parses `14.6.1`, `15.2 Beta 3`, `10.15.7-rc`. Anything after the first
/// space or hyphen is ignored.
pub fn parse_version(value: &str) -> Option<MacosVersion> {
    let clean = value.split_whitespace().next()?.split('-').next()?;
    let mut parts = clean.split('.');
    let major = parts.next()?.parse::<u32>().ok()?;
    let minor = match parts.next() {
        Some(part) => part.parse::<u32>().ok()?,
        None => 0,
    };
    let patch = match parts.next() {
        Some(part) => part.parse::<u32>().ok()?,
        None => 0,
    };
    Some(MacosVersion {
        major,
        minor,
        patch,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogEntry {
    pub key: &'static str,
    pub name: &'static str,
    pub year: u16,
    /// Scratch space `createinstallmedia` needs beyond the payload.
    pub install_buffer: u64,
}

const fn entry(key: &'static str, name: &'static str, year: u16, buffer_mib: u64) -> CatalogEntry {
    CatalogEntry {
        key,
        name,
        year,
        install_buffer: buffer_mib * MIB,
    }
}

pub const CATALOG: &[CatalogEntry] = &[
    entry("26", "Tahoe", 2025, 3072),
    entry("15", "Sequoia", 2024, 2560),
    entry("14", "Sonoma", 2023, 2253),
    entry("13", "Ventura", 2022, 2048),
    entry("12", "Monterey", 2021, 2048),
    entry("11", "Big Sur", 2020, 2048),
    entry("10.15", "Catalina", 2019, 1536),
    entry("10.14", "Mojave", 2018, 1536),
    entry("10.13", "High Sierra", 2017, 1024),
    entry("10.12", "Sierra", 2016, 1024),
    entry("10.11", "El Capitan", 2015, 1024),
];

/// Catalog entry for an installer. The bundle name wins over the version
/// because refreshed installers carry app versions that collide with newer
/// releases (High Sierra's installer reports 13.6).
pub fn lookup(installer_name: &str, version: &str) -> Option<&'static CatalogEntry> {
    let lowered = installer_name.to_ascii_lowercase();
    let by_name = CATALOG
        .iter()
        .filter(|entry| lowered.contains(&entry.name.to_ascii_lowercase()))
        .max_by_key(|entry| entry.name.len());
    if by_name.is_some() {
        return by_name;
    }

    let key = parse_version(version)?.catalog_key();
    CATALOG.iter().find(|entry| entry.key == key)
}

pub fn os_name(installer_name: &str, version: &str) -> Option<&'static str> {
    lookup(installer_name, version).map(|entry| entry.name)
}

pub fn install_buffer(installer_name: &str, version: &str) -> Option<u64> {
    lookup(installer_name, version).map(|entry| entry.install_buffer)
}
