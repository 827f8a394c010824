//! `assets.json`: which remote tag a local recordings directory reflects.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::AssetError;

/// File name of a manifest.
pub const MANIFEST_FILE_NAME: &str = "assets.json";

/// Directories never descended into when collecting manifests.
const SKIPPED_DIRS: [&str; 5] = [".git", ".assets", "node_modules", "target", ".venv"];

/// Contents of an `assets.json` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AssetManifest {
    /// Remote assets repository (URL or `owner/name`).
    pub assets_repo: String,
    /// Directory inside the assets repository holding these recordings.
    pub assets_repo_prefix_path: String,
    /// Optional identifier of the assets repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assets_repo_id: Option<String>,
    /// Prefix for tags minted by `push`; defaults to the prefix path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_prefix: Option<String>,
    /// Tag the local recordings correspond to; empty before the first push.
    #[serde(default)]
    pub tag: String,
    /// Commit the tag pointed at when last pushed.
    #[serde(rename = "SHA", default, skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,
    /// Keys this tool does not interpret, preserved on rewrite.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AssetManifest {
    /// Prefix used when minting a new tag.
    #[must_use]
    pub fn tag_prefix(&self) -> &str {
        self.tag_prefix
            .as_deref()
            .filter(|prefix| !prefix.is_empty())
            .unwrap_or_else(|| self.assets_repo_prefix_path.trim_matches('/'))
    }

    /// Remote URL for git.
    #[must_use]
    pub fn remote_url(&self) -> String {
        remote_url(&self.assets_repo)
    }

    /// Parses a manifest without requiring it to sit inside a git repository.
    ///
    /// # Errors
    ///
    /// Returns [`AssetError::InvalidManifest`] if it cannot be read or parsed.
    pub fn read(path: &Path) -> Result<Self, AssetError> {
        let invalid =
            |reason: String| AssetError::InvalidManifest { path: path.to_path_buf(), reason };
        let text = std::fs::read_to_string(path).map_err(|err| invalid(err.to_string()))?;
        serde_json::from_str(&text).map_err(|err| invalid(err.to_string()))
    }
}

/// Remote URL for an `AssetsRepo` value; `owner/name` shorthand expands to GitHub.
#[must_use]
pub fn remote_url(repo: &str) -> String {
    let repo = repo.trim();
    if repo.contains("://") || repo.starts_with("git@") || Path::new(repo).is_absolute() {
        repo.to_string()
    } else {
        format!("https://github.com/{repo}.git")
    }
}

/// A manifest together with where it lives.
#[derive(Debug, Clone, PartialEq)]
pub struct LocatedManifest {
    /// Path of the `assets.json` file.
    pub path: PathBuf,
    /// Root of the enclosing git repository.
    pub git_root: PathBuf,
    /// Parsed contents.
    pub manifest: AssetManifest,
}

impl LocatedManifest {
    /// Finds the nearest manifest at or above `start` and loads it.
    ///
    /// # Errors
    ///
    /// Returns [`AssetError::ManifestNotFound`] or a load error.
    pub fn discover(start: &Path) -> Result<Self, AssetError> {
        Self::load(&locate(start)?)
    }

    /// Loads the manifest at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`AssetError::InvalidManifest`] if it cannot be read, is not
    /// valid, or is not inside a git repository.
    pub fn load(path: &Path) -> Result<Self, AssetError> {
        let invalid =
            |reason: String| AssetError::InvalidManifest { path: path.to_path_buf(), reason };
        let manifest = AssetManifest::read(path)?;
        if manifest.assets_repo.trim().is_empty() {
            return Err(invalid("AssetsRepo is empty".to_string()));
        }
        if manifest.assets_repo_prefix_path.trim_matches('/').is_empty() {
            return Err(invalid("AssetsRepoPrefixPath is empty".to_string()));
        }
        let directory = path.parent().unwrap_or_else(|| Path::new("."));
        let git_root = ancestors_to_git_root(directory)
            .into_iter()
            .find(|dir| dir.join(".git").exists())
            .ok_or_else(|| invalid("not inside a git repository".to_string()))?;
        Ok(Self { path: path.to_path_buf(), git_root, manifest })
    }

    /// Manifest path relative to the git root, `/`-separated.
    #[must_use]
    pub fn relative_path(&self) -> String {
        let relative = self.path.strip_prefix(&self.git_root).unwrap_or(&self.path);
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Short stable key identifying this manifest within its repository.
    #[must_use]
    pub fn key(&self) -> String {
        let digest = Sha256::digest(self.relative_path().as_bytes());
        digest.iter().take(5).map(|byte| format!("{byte:02x}")).collect()
    }

    /// Writes the manifest back atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self) -> Result<(), AssetError> {
        let mut bytes = serde_json::to_vec_pretty(&self.manifest).map_err(|err| {
            AssetError::InvalidManifest { path: self.path.clone(), reason: err.to_string() }
        })?;
        bytes.push(b'\n');
        let directory = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp = tempfile::NamedTempFile::new_in(directory)
            .map_err(|source| AssetError::io("create temp file in", directory, source))?;
        temp.write_all(&bytes).map_err(|source| AssetError::io("write", temp.path(), source))?;
        temp.persist(&self.path).map_err(|err| AssetError::io("replace", &self.path, err.error))?;
        Ok(())
    }
}

/// Directories from `start` upward, ending with the first that contains
/// `.git` (inclusive) or the filesystem root.
fn ancestors_to_git_root(start: &Path) -> Vec<PathBuf> {
    let start = std::fs::canonicalize(start).unwrap_or_else(|_| start.to_path_buf());
    let mut chain = Vec::new();
    for dir in start.ancestors() {
        chain.push(dir.to_path_buf());
        if dir.join(".git").exists() {
            break;
        }
    }
    chain
}

/// Resolves the nearest `assets.json` at or above `start`, stopping at the
/// git root. `start` may itself be a manifest file.
///
/// # Errors
///
/// Returns [`AssetError::ManifestNotFound`] when there is none.
pub fn locate(start: &Path) -> Result<PathBuf, AssetError> {
    if start.is_file() {
        if start.file_name().is_some_and(|name| name == MANIFEST_FILE_NAME) {
            return Ok(start.to_path_buf());
        }
        return Err(AssetError::ManifestNotFound { start: start.to_path_buf() });
    }
    ancestors_to_git_root(start)
        .into_iter()
        .map(|dir| dir.join(MANIFEST_FILE_NAME))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| AssetError::ManifestNotFound { start: start.to_path_buf() })
}

/// Every manifest below `root`, skipping build and VCS directories.
///
/// # Errors
///
/// Returns an error if a directory cannot be read.
pub fn find_all(root: &Path) -> Result<Vec<PathBuf>, AssetError> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries =
            std::fs::read_dir(&dir).map_err(|source| AssetError::io("read", &dir, source))?;
        for entry in entries {
            let path = entry.map_err(|source| AssetError::io("read", &dir, source))?.path();
            let name =
                path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            if path.is_dir() {
                if !SKIPPED_DIRS.contains(&name.as_str()) {
                    pending.push(path);
                }
            } else if name == MANIFEST_FILE_NAME {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(dir: &Path, tag: &str) -> PathBuf {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(MANIFEST_FILE_NAME);
        let body = serde_json::json!({
            "AssetsRepo": "org/assets",
            "AssetsRepoPrefixPath": "python/tables",
            "Tag": tag,
            "Custom": 1,
        });
        std::fs::write(&path, body.to_string()).unwrap();
        path
    }

    #[test]
    fn locates_nearest_manifest_below_git_root() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join(".git")).unwrap();
        write_manifest(&root.path().join("sdk/tables"), "t1");
        let nested = root.path().join("sdk/tables/tests/unit");
        std::fs::create_dir_all(&nested).unwrap();

        let located = LocatedManifest::discover(&nested).unwrap();
        assert!(located.path.ends_with("sdk/tables/assets.json"));
        assert_eq!(located.relative_path(), "sdk/tables/assets.json");
        assert_eq!(located.manifest.tag, "t1");
        assert_eq!(located.key().len(), 10);
    }

    #[test]
    fn search_stops_at_git_root() {
        let outer = tempfile::tempdir().unwrap();
        write_manifest(outer.path(), "outside");
        let repo = outer.path().join("repo");
        std::fs::create_dir_all(repo.join(".git")).unwrap();
        std::fs::create_dir_all(repo.join("src")).unwrap();

        let err = locate(&repo.join("src")).unwrap_err();
        assert!(err.to_string().contains("unable to locate an assets.json"));
    }

    #[test]
    fn save_preserves_unknown_keys() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join(".git")).unwrap();
        let path = write_manifest(root.path(), "t1");

        let mut located = LocatedManifest::load(&path).unwrap();
        located.manifest.tag = "t2".into();
        located.manifest.sha = Some("abc".into());
        located.save().unwrap();

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["Tag"], "t2");
        assert_eq!(raw["SHA"], "abc");
        assert_eq!(raw["Custom"], 1);
    }

    #[test]
    fn rejects_manifest_outside_git() {
        let root = tempfile::tempdir().unwrap();
        let path = write_manifest(root.path(), "t1");
        let err = LocatedManifest::load(&path).unwrap_err();
        assert!(matches!(err, AssetError::InvalidManifest { .. }));
    }

    #[test]
    fn tag_prefix_and_remote_defaults() {
        let manifest: AssetManifest = serde_json::from_str(
            r#"{"AssetsRepo":"org/assets","AssetsRepoPrefixPath":"/js/storage/","Tag":""}"#,
        )
        .unwrap();
        assert_eq!(manifest.tag_prefix(), "js/storage");
        assert_eq!(manifest.remote_url(), "https://github.com/org/assets.git");
    }

    #[test]
    fn find_all_skips_vcs_dirs() {
        let root = tempfile::tempdir().unwrap();
        write_manifest(&root.path().join("a"), "1");
        write_manifest(&root.path().join(".assets/x"), "2");
        write_manifest(&root.path().join("b/c"), "3");
        let found = find_all(root.path()).unwrap();
        assert_eq!(found.len(), 2);
    }
}
