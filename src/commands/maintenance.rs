//! `vcrproxy maintenance scan|backup|cleanup|restore`.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::adapters::live::{LiveClock, LiveGit};
use crate::assets::manifest::{find_all, remote_url};
use crate::assets::{AssetManifest, AssetsMaintenance, RetentionPolicy};
use crate::cli::{MaintenanceCommand, RepoArgs};
use crate::config::ProxySettings;

fn default_workdir(repo: &str) -> PathBuf {
    let digest = Sha256::digest(repo.as_bytes());
    let key: String = digest.iter().take(5).map(|byte| format!("{byte:02x}")).collect();
    std::env::temp_dir().join("vcrproxy-maintenance").join(key)
}

fn open(settings: &ProxySettings, args: &RepoArgs) -> Result<AssetsMaintenance, String> {
    let repo = remote_url(&args.repo);
    let workdir = args.workdir.clone().unwrap_or_else(|| default_workdir(&repo));
    let git = Arc::new(LiveGit::new(settings.assets.git_timeout()));
    AssetsMaintenance::new(git, Arc::new(LiveClock), &repo, &workdir).map_err(|err| err.to_string())
}

/// Tags referenced by every manifest under `roots`.
fn referenced_tags(roots: &[PathBuf]) -> Result<BTreeSet<String>, String> {
    let mut tags = BTreeSet::new();
    for root in roots {
        for path in find_all(root).map_err(|err| err.to_string())? {
            match AssetManifest::read(&path) {
                Ok(manifest) if !manifest.tag.is_empty() => {
                    tags.insert(manifest.tag);
                }
                Ok(_) => {}
                Err(err) => {
                    let path = path.display();
                    tracing::warn!(path = %path, error = %err, "skipping unreadable manifest");
                }
            }
        }
    }
    Ok(tags)
}

/// Runs a maintenance subcommand.
///
/// # Errors
///
/// Returns an error string if the remote cannot be reached or an operation
/// is refused.
pub fn run(settings: &ProxySettings, command: &MaintenanceCommand) -> Result<(), String> {
    match command {
        MaintenanceCommand::Scan { repo, max_age_days, include_orphans, referenced_roots } => {
            let maintenance = open(settings, repo)?;
            let referenced = referenced_tags(referenced_roots)?;
            let policy = RetentionPolicy {
                max_age: chrono::Duration::days(*max_age_days),
                include_orphans: *include_orphans,
            };
            let candidates = maintenance.scan(&policy, &referenced).map_err(|err| err.to_string())?;
            for candidate in &candidates {
                let commit = candidate.commit.get(..10).unwrap_or(&candidate.commit);
                println!("{}\t{commit}\t{}", candidate.tag, candidate.reason);
            }
            eprintln!("{} candidate tag(s)", candidates.len());
            Ok(())
        }
        MaintenanceCommand::Backup { repo, tags } => {
            let maintenance = open(settings, repo)?;
            let candidates = maintenance.candidates_for(tags).map_err(|err| err.to_string())?;
            for backup in maintenance.backup(&candidates).map_err(|err| err.to_string())? {
                println!("{backup}");
            }
            Ok(())
        }
        MaintenanceCommand::Cleanup { repo, tags } => {
            let maintenance = open(settings, repo)?;
            let candidates = maintenance.candidates_for(tags).map_err(|err| err.to_string())?;
            for deleted in maintenance.cleanup(&candidates).map_err(|err| err.to_string())? {
                println!("deleted {deleted}");
            }
            Ok(())
        }
        MaintenanceCommand::Restore { repo, backup_tag } => {
            let maintenance = open(settings, repo)?;
            let restored = maintenance.restore_backup(backup_tag).map_err(|err| err.to_string())?;
            println!("{restored}");
            Ok(())
        }
    }
}
