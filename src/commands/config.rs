//! `vcrproxy config show|locate`.

use crate::assets::LocatedManifest;
use crate::cli::ManifestArgs;
use crate::config::ProxySettings;

/// Prints the effective settings as YAML, with the admin key masked.
///
/// # Errors
///
/// Returns an error string if the settings cannot be serialized.
pub fn show(settings: &ProxySettings) -> Result<(), String> {
    let mut shown = settings.clone();
    if shown.admin_key.is_some() {
        shown.admin_key = Some("********".to_string());
    }
    let yaml = serde_yaml::to_string(&shown)
        .map_err(|err| format!("failed to render settings: {err}"))?;
    print!("{yaml}");
    Ok(())
}

/// Prints the manifest governing a directory and the tag it references.
///
/// # Errors
///
/// Returns an error string if no valid manifest is found.
pub fn locate(args: &ManifestArgs) -> Result<(), String> {
    let located = LocatedManifest::discover(&args.assets_json).map_err(|err| err.to_string())?;
    println!("{}", located.path.display());
    let tag =
        if located.manifest.tag.is_empty() { "<none>" } else { located.manifest.tag.as_str() };
    println!("tag: {tag}");
    Ok(())
}
