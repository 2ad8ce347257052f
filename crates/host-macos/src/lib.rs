//! macOS host adapter: `diskutil`, `createinstallmedia` and `bless` behind a
//! command runner with timeouts and privilege escalation.

pub mod diskutil;
pub mod mounts;
pub mod runner;
pub mod tools;

pub use diskutil::{Diskutil, DiskInfo, DISKUTIL};
pub use runner::{CommandRunner, SystemRunner};
pub use tools::{boot_label, run_bless, run_createinstallmedia};
