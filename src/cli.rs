//! CLI argument definitions.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Top-level CLI parser for `vcrproxy`.
#[derive(Debug, Parser)]
#[command(name = "vcrproxy", version, about = "Record and replay HTTP traffic for test suites")]
pub struct Cli {
    /// YAML settings file.
    #[arg(long, global = true, env = "VCRPROXY_CONFIG")]
    pub config: Option<PathBuf>,
    /// The command to execute.
    #[command(subcommand)]
    pub command: Command,
}

/// Supported top-level subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the recording proxy.
    Serve(ServeArgs),
    /// Inspect configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Check out the recordings an assets.json points at.
    Restore(ManifestArgs),
    /// Publish local recording changes as a new tag and update assets.json.
    Push(ManifestArgs),
    /// Discard local recording changes.
    Reset(ManifestArgs),
    /// Tag retention for the assets repository.
    #[command(subcommand)]
    Maintenance(MaintenanceCommand),
}

/// Flags for `serve`; each overrides the settings file and environment.
#[derive(Debug, Default, Args)]
pub struct ServeArgs {
    /// Listen address.
    #[arg(long)]
    pub listen: Option<SocketAddr>,
    /// Base directory for relative recording paths.
    #[arg(long)]
    pub storage_root: Option<PathBuf>,
    /// Key required on admin calls.
    #[arg(long)]
    pub admin_key: Option<String>,
    /// Relay CONNECT tunnels without interception.
    #[arg(long)]
    pub no_tls: bool,
    /// Directory holding ca.pem and ca.key.
    #[arg(long)]
    pub ca_dir: Option<PathBuf>,
}

/// Locating an assets.json.
#[derive(Debug, Default, Args)]
pub struct ManifestArgs {
    /// Path to assets.json, or a directory to search upward from.
    #[arg(long, default_value = ".")]
    pub assets_json: PathBuf,
}

/// `config` subcommands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the effective settings as YAML.
    Show,
    /// Print the assets.json that applies to a directory.
    Locate(ManifestArgs),
}

/// Selecting the assets repository for maintenance.
#[derive(Debug, Args)]
pub struct RepoArgs {
    /// Assets repository (URL or owner/name).
    #[arg(long)]
    pub repo: String,
    /// Scratch working directory; defaults to a directory under the system temp dir.
    #[arg(long)]
    pub workdir: Option<PathBuf>,
}

/// `maintenance` subcommands.
#[derive(Debug, Subcommand)]
pub enum MaintenanceCommand {
    /// List tags eligible for cleanup.
    Scan {
        #[command(flatten)]
        repo: RepoArgs,
        /// Unreferenced tags older than this many days are candidates.
        #[arg(long, default_value_t = 90)]
        max_age_days: i64,
        /// Also list unreferenced tags younger than the window.
        #[arg(long)]
        include_orphans: bool,
        /// Directories searched for assets.json files whose tags stay referenced.
        #[arg(long = "referenced-root")]
        referenced_roots: Vec<PathBuf>,
    },
    /// Create `<tag>_backup` for each tag.
    Backup {
        #[command(flatten)]
        repo: RepoArgs,
        /// Tags to back up.
        #[arg(required = true)]
        tags: Vec<String>,
    },
    /// Delete tags that have a matching backup.
    Cleanup {
        #[command(flatten)]
        repo: RepoArgs,
        /// Tags to delete.
        #[arg(required = true)]
        tags: Vec<String>,
    },
    /// Recreate a tag from its backup.
    Restore {
        #[command(flatten)]
        repo: RepoArgs,
        /// Backup tag, e.g. `python/tables_abc123_backup`.
        backup_tag: String,
    },
}
