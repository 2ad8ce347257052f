use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "multiboot")]
#[command(version)]
#[command(about = "Plan and build multi-installer macOS USB disks")]
pub struct Cli {
    /// JSON config file (falls back to $MULTIBOOT_CONFIG)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory for partition table backups
    #[arg(long, global = true)]
    pub backup_dir: Option<PathBuf>,

    /// Emit machine-readable JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// List installers and candidate disks.
    Scan,
    /// Compute a partition plan without touching the disk.
    Plan(TargetArgs),
    /// Back up, partition and write the selected installers.
    Apply(ApplyArgs),
    /// Inspect partition table backups.
    #[command(subcommand)]
    Backups(BackupsCommand),
}

#[derive(Debug, Clone, Args)]
pub struct TargetArgs {
    /// Target whole disk (for example disk4)
    #[arg(long)]
    pub disk: String,

    /// Installer name or bundle path; repeat for each partition
    #[arg(long = "installer", required = true)]
    pub installers: Vec<String>,
}

#[derive(Debug, Clone, Args)]
pub struct ApplyArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Validate and print the partition command without running it
    #[arg(long)]
    pub dry_run: bool,

    /// Confirmation token (must be ERASE); prompts when absent
    #[arg(long)]
    pub confirm: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum BackupsCommand {
    /// List backups, newest first.
    List {
        #[arg(long)]
        disk: Option<String>,
    },
    /// Print one backup.
    Show {
        /// Backup file to print
        path: Option<PathBuf>,

        /// Print the newest backup of --disk instead
        #[arg(long, requires = "disk", conflicts_with = "path")]
        latest: bool,

        #[arg(long)]
        disk: Option<String>,
    },
}
