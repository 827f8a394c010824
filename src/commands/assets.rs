//! `vcrproxy restore|push|reset`.

use std::sync::Arc;

use crate::adapters::live::LiveGit;
use crate::assets::{AssetSynchronizer, LocatedManifest, PushOutcome};
use crate::cli::ManifestArgs;
use crate::config::ProxySettings;

fn synchronizer(settings: &ProxySettings) -> AssetSynchronizer {
    let git = Arc::new(LiveGit::new(settings.assets.git_timeout()));
    AssetSynchronizer::new(git, settings.assets.sync_options())
}

fn locate(args: &ManifestArgs) -> Result<LocatedManifest, String> {
    LocatedManifest::discover(&args.assets_json).map_err(|err| err.to_string())
}

/// Restores the recordings for the manifest's tag and prints their directory.
///
/// # Errors
///
/// Returns an error string if the manifest or tag cannot be resolved.
pub fn restore(settings: &ProxySettings, args: &ManifestArgs) -> Result<(), String> {
    let located = locate(args)?;
    let path = synchronizer(settings).restore(&located).map_err(|err| err.to_string())?;
    println!("{}", path.display());
    Ok(())
}

/// Pushes local changes and rewrites the manifest.
///
/// # Errors
///
/// Returns an error string if the push fails.
pub fn push(settings: &ProxySettings, args: &ManifestArgs) -> Result<(), String> {
    let mut located = locate(args)?;
    match synchronizer(settings).push(&mut located).map_err(|err| err.to_string())? {
        PushOutcome::Unchanged => {
            println!(
                "no changes; {} still references {}",
                located.path.display(),
                located.manifest.tag
            );
        }
        PushOutcome::Pushed { tag, changed, .. } => {
            let path = located.path.display();
            println!("pushed {} file(s) as {tag}; updated {path}", changed.len());
        }
    }
    Ok(())
}

/// Discards local changes.
///
/// # Errors
///
/// Returns an error string if the reset fails.
pub fn reset(settings: &ProxySettings, args: &ManifestArgs) -> Result<(), String> {
    let located = locate(args)?;
    let path = synchronizer(settings).reset(&located).map_err(|err| err.to_string())?;
    println!("{}", path.display());
    Ok(())
}
