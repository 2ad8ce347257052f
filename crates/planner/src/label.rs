use multiboot_core::version::{os_name, parse_version};
use multiboot_core::InstallerRecord;
use std::collections::HashSet;

pub const MAX_LABEL_LEN: usize = 27;
pub const RESERVED_LABELS: &[&str] = &["EFI", "DATA_STORE"];

/// Base volume label for an installer, before collision handling.
pub fn base_label(installer: &InstallerRecord) -> String {
    let name = os_name(&installer.name, &installer.version)
        .map(str::to_string)
        .unwrap_or_else(|| bundle_os_name(installer));

    let raw = match parse_version(&installer.version) {
        Some(version) => format!("INSTALL_{}_{}_{}", name, version.major, version.minor),
        None => format!("INSTALL_{name}"),
    };
    sanitize(&raw)
}

fn bundle_os_name(installer: &InstallerRecord) -> String {
    let name = installer.display_name();
    let name = name.strip_prefix("Install ").unwrap_or(name);
    let name = name.strip_prefix("macOS ").unwrap_or(name);
    let name = name.strip_prefix("OS X ").unwrap_or(name);
    if name.trim().is_empty() {
        "macOS".to_string()
    } else {
        name.to_string()
    }
}

/// Maps to `[A-Za-z0-9_-]`, collapses `_` runs and truncates.
pub fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        let mapped = if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' };
        if mapped == '_' && out.ends_with('_') {
            continue;
        }
        out.push(mapped);
    }
    truncate(out.trim_end_matches('_'), MAX_LABEL_LEN)
}

fn truncate(label: &str, max: usize) -> String {
    label.chars().take(max).collect::<String>().trim_end_matches('_').to_string()
}

/// Hands out unique labels in call order.
#[derive(Debug)]
pub struct LabelAllocator {
    taken: HashSet<String>,
}

impl Default for LabelAllocator {
    fn default() -> Self {
        Self {
            taken: RESERVED_LABELS.iter().map(|label| label.to_string()).collect(),
        }
    }
}

impl LabelAllocator {
    pub fn allocate(&mut self, base: &str) -> String {
        if self.taken.insert(base.to_string()) {
            return base.to_string();
        }
        let mut n = 2usize;
        loop {
            let suffix = format!("_{n}");
            let candidate = format!(
                "{}{suffix}",
                truncate(base, MAX_LABEL_LEN - suffix.len())
            );
            if self.taken.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}
