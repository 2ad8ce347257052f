use crate::runner::CommandRunner;
use multiboot_core::{CommandError, CommandOutput, CommandRequest};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub const BLESS: &str = "/usr/sbin/bless";

pub fn createinstallmedia_path(app: &Path) -> PathBuf {
    app.join("Contents/Resources/createinstallmedia")
}

pub fn createinstallmedia_request(app: &Path, volume: &Path, timeout: Duration) -> CommandRequest {
    CommandRequest::new(
        createinstallmedia_path(app).to_string_lossy(),
        [
            "--volume".to_string(),
            volume.to_string_lossy().into_owned(),
            "--nointeraction".to_string(),
        ],
    )
    .privileged()
    .with_timeout(timeout)
}

/// Writes one installer onto a mounted volume. The volume is erased and
/// renamed by the tool.
pub fn run_createinstallmedia<R: CommandRunner + ?Sized>(
    runner: &R,
    app: &Path,
    volume: &Path,
    timeout: Duration,
) -> Result<CommandOutput, CommandError> {
    let tool = createinstallmedia_path(app);
    if !tool.is_file() {
        return Err(CommandError::Spawn {
            program: tool.display().to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "createinstallmedia not found in installer"),
        });
    }
    info!(app = %app.display(), volume = %volume.display(), "running createinstallmedia");
    runner.run(&createinstallmedia_request(app, volume, timeout))
}

/// Boot picker label, e.g. `macOS Sonoma 14.6.1`.
pub fn boot_label(os_name: &str, version: &str) -> String {
    format!("macOS {os_name} {version}").trim().to_string()
}

pub fn bless_request(volume: &Path, label: &str, timeout: Duration) -> CommandRequest {
    let folder = volume.join("System/Library/CoreServices");
    CommandRequest::new(
        BLESS,
        [
            "--folder".to_string(),
            folder.to_string_lossy().into_owned(),
            "--label".to_string(),
            label.to_string(),
        ],
    )
    .privileged()
    .with_timeout(timeout)
}

pub fn run_bless<R: CommandRunner + ?Sized>(
    runner: &R,
    volume: &Path,
    label: &str,
    timeout: Duration,
) -> Result<CommandOutput, CommandError> {
    runner.run(&bless_request(volume, label, timeout))
}
