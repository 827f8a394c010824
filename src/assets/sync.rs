//! Restore, push and reset of the recordings an `assets.json` points at.
//!
//! Each manifest gets its own sparse working directory under the assets root,
//! keyed by the manifest's path inside its repository. A breadcrumb file next
//! to the working directory remembers which tag is checked out, so repeated
//! restores are free and never clobber local edits.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::ports::git::{GitError, GitPorcelain};

use super::manifest::LocatedManifest;
use super::AssetError;

/// Directory under the git root used when no assets root is configured.
pub const DEFAULT_ASSETS_DIR: &str = ".assets";

/// Tuning for remote operations.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Where working directories live; `<git root>/.assets` when unset.
    pub assets_root: Option<PathBuf>,
    /// Maximum attempts for idempotent reads (fetch, checkout).
    pub restore_attempts: u32,
    /// Base delay between attempts; attempt `n` waits `n * retry_delay`.
    pub retry_delay: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self { assets_root: None, restore_attempts: 3, retry_delay: Duration::from_millis(500) }
    }
}

/// Result of [`AssetSynchronizer::push`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Nothing differed from the manifest's tag; no commit or tag was made.
    Unchanged,
    /// A new tag was published and the manifest rewritten.
    Pushed {
        /// New tag.
        tag: String,
        /// Commit it points at.
        sha: String,
        /// Repo-relative paths that changed.
        changed: Vec<String>,
    },
}

/// Moves recordings between an assets repository and local working directories.
pub struct AssetSynchronizer {
    git: Arc<dyn GitPorcelain>,
    options: SyncOptions,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl AssetSynchronizer {
    /// Creates a synchronizer over `git`.
    #[must_use]
    pub fn new(git: Arc<dyn GitPorcelain>, options: SyncOptions) -> Self {
        Self { git, options, locks: Mutex::new(HashMap::new()) }
    }

    fn assets_root(&self, located: &LocatedManifest) -> PathBuf {
        self.options
            .assets_root
            .clone()
            .unwrap_or_else(|| located.git_root.join(DEFAULT_ASSETS_DIR))
    }

    /// Working directory backing `located`.
    #[must_use]
    pub fn workdir(&self, located: &LocatedManifest) -> PathBuf {
        self.assets_root(located).join(located.key())
    }

    /// Local directory holding the recordings for `located`.
    #[must_use]
    pub fn local_path(&self, located: &LocatedManifest) -> PathBuf {
        self.workdir(located).join(located.manifest.assets_repo_prefix_path.trim_matches('/'))
    }

    fn breadcrumb(&self, located: &LocatedManifest) -> PathBuf {
        self.assets_root(located).join("breadcrumb").join(format!("{}.tag", located.key()))
    }

    fn checked_out_tag(&self, located: &LocatedManifest) -> Option<String> {
        std::fs::read_to_string(self.breadcrumb(located)).ok().map(|tag| tag.trim().to_string())
    }

    fn write_breadcrumb(&self, located: &LocatedManifest, tag: &str) -> Result<(), AssetError> {
        let path = self.breadcrumb(located);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|source| AssetError::io("create", parent, source))?;
        }
        std::fs::write(&path, tag).map_err(|source| AssetError::io("write", &path, source))
    }

    fn lock_for(&self, workdir: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(workdir.to_path_buf()).or_default())
    }

    /// Retries an idempotent remote read with linear backoff.
    fn with_retry<T>(
        &self,
        operation: &str,
        mut call: impl FnMut() -> Result<T, GitError>,
    ) -> Result<T, GitError> {
        let attempts = self.options.restore_attempts.max(1);
        let mut attempt = 1;
        loop {
            match call() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < attempts => {
                    tracing::warn!(
                        operation,
                        attempt,
                        error = %err,
                        "transient git failure, retrying"
                    );
                    std::thread::sleep(self.options.retry_delay * attempt);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Materializes the recordings for the manifest's tag and returns their
    /// local directory. A no-op when that tag is already checked out.
    ///
    /// # Errors
    ///
    /// Returns [`AssetError::NotFound`] for a missing tag,
    /// [`AssetError::Timeout`] when git exceeds its bound, or
    /// [`AssetError::ShaMismatch`] when the tag moved.
    pub fn restore(&self, located: &LocatedManifest) -> Result<PathBuf, AssetError> {
        let workdir = self.workdir(located);
        let lock = self.lock_for(&workdir);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.restore_locked(located, &workdir)?;
        Ok(self.local_path(located))
    }

    fn restore_locked(&self, located: &LocatedManifest, workdir: &Path) -> Result<(), AssetError> {
        let manifest = &located.manifest;
        let repo = manifest.remote_url();
        let local = self.local_path(located);
        let restored = self.checked_out_tag(located).as_deref() == Some(manifest.tag.as_str());
        if restored && local.is_dir() {
            tracing::debug!(
                tag = %manifest.tag,
                path = %local.display(),
                "assets already restored"
            );
            return Ok(());
        }
        self.git
            .prepare(workdir, &repo)
            .map_err(|err| AssetError::from_git(err, &repo, &manifest.tag))?;
        if manifest.tag.is_empty() {
            std::fs::create_dir_all(&local)
                .map_err(|source| AssetError::io("create", &local, source))?;
            return self.write_breadcrumb(located, "");
        }
        let prefix = manifest.assets_repo_prefix_path.as_str();
        let commit = self
            .with_retry("fetch", || self.git.fetch_tag(workdir, &manifest.tag))
            .map_err(|err| AssetError::from_git(err, &repo, &manifest.tag))?;
        if let Some(expected) = manifest.sha.as_deref().filter(|sha| !sha.is_empty()) {
            if expected != commit {
                return Err(AssetError::ShaMismatch {
                    tag: manifest.tag.clone(),
                    expected: expected.to_string(),
                    actual: commit,
                });
            }
        }
        self.with_retry("checkout", || self.git.sparse_checkout(workdir, &commit, prefix))
            .map_err(|err| AssetError::from_git(err, &repo, &manifest.tag))?;
        std::fs::create_dir_all(&local).map_err(|source| AssetError::io("create", &local, source))?;
        self.write_breadcrumb(located, &manifest.tag)?;
        tracing::info!(
            tag = %manifest.tag,
            commit = %commit,
            path = %local.display(),
            "restored assets"
        );
        Ok(())
    }

    /// Publishes local changes as a new tag and rewrites the manifest to
    /// reference it. Returns [`PushOutcome::Unchanged`] when nothing differs.
    ///
    /// # Errors
    ///
    /// Returns [`AssetError::NotRestored`] if the manifest's tag is not the
    /// one checked out, [`AssetError::TagConflict`] if the new tag already
    /// exists elsewhere, or a git error.
    pub fn push(&self, located: &mut LocatedManifest) -> Result<PushOutcome, AssetError> {
        let workdir = self.workdir(located);
        let lock = self.lock_for(&workdir);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let repo = located.manifest.remote_url();
        let tag = located.manifest.tag.clone();
        let prefix = located.manifest.assets_repo_prefix_path.clone();
        let restored = self.checked_out_tag(located);
        if restored.as_deref() != Some(tag.as_str()) {
            if tag.is_empty() && restored.is_none() {
                self.restore_locked(located, &workdir)?;
            } else {
                return Err(AssetError::NotRestored { tag });
            }
        }

        let base = if tag.is_empty() {
            String::new()
        } else {
            self.with_retry("fetch", || self.git.fetch_tag(&workdir, &tag))
                .map_err(|err| AssetError::from_git(err, &repo, &tag))?
        };
        let changed = self.git.changed_paths(&workdir, &base, &prefix).map_err(AssetError::Git)?;
        if changed.is_empty() {
            tracing::info!(tag = %tag, "no asset changes to push");
            return Ok(PushOutcome::Unchanged);
        }

        let message = format!("Automatic asset update from {}", located.relative_path());
        let sha = self.git.commit(&workdir, &prefix, &message).map_err(AssetError::Git)?;
        let short = sha.get(..10).unwrap_or(&sha);
        let new_tag = format!("{}_{short}", located.manifest.tag_prefix());
        self.publish_tag(&workdir, &repo, &new_tag, &sha)?;

        located.manifest.tag.clone_from(&new_tag);
        located.manifest.sha = Some(sha.clone());
        located.save()?;
        self.write_breadcrumb(located, &new_tag)?;
        tracing::info!(tag = %new_tag, commit = %sha, files = changed.len(), "pushed assets");
        Ok(PushOutcome::Pushed { tag: new_tag, sha, changed })
    }

    /// Creates `tag`, re-checking the remote after a failure before deciding
    /// whether to retry; a lost acknowledgement must not produce a duplicate.
    fn publish_tag(
        &self,
        workdir: &Path,
        repo: &str,
        tag: &str,
        commit: &str,
    ) -> Result<(), AssetError> {
        let Err(err) = self.git.create_tag(workdir, tag, commit) else {
            return Ok(());
        };
        tracing::warn!(tag, error = %err, "tag push failed, checking remote");
        let remote =
            self.git.tag_commit(workdir, tag).map_err(|err| AssetError::from_git(err, repo, tag))?;
        match remote {
            Some(existing) if existing == commit => Ok(()),
            Some(existing) => Err(AssetError::TagConflict {
                tag: tag.to_string(),
                existing,
                expected: commit.to_string(),
            }),
            None if err.is_retryable() => self
                .git
                .create_tag(workdir, tag, commit)
                .map_err(|err| AssetError::from_git(err, repo, tag)),
            None => Err(AssetError::from_git(err, repo, tag)),
        }
    }

    /// Discards local edits and returns the recordings to the manifest's tag.
    ///
    /// # Errors
    ///
    /// Returns an error if the tag cannot be fetched or checked out.
    pub fn reset(&self, located: &LocatedManifest) -> Result<PathBuf, AssetError> {
        let workdir = self.workdir(located);
        let lock = self.lock_for(&workdir);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let manifest = &located.manifest;
        let repo = manifest.remote_url();
        let prefix = manifest.assets_repo_prefix_path.as_str();
        self.git
            .prepare(&workdir, &repo)
            .map_err(|err| AssetError::from_git(err, &repo, &manifest.tag))?;
        self.git.discard_changes(&workdir, prefix).map_err(AssetError::Git)?;
        if manifest.tag.is_empty() {
            let local = self.local_path(located);
            std::fs::create_dir_all(&local)
                .map_err(|source| AssetError::io("create", &local, source))?;
            self.write_breadcrumb(located, "")?;
        } else {
            let commit = self
                .with_retry("fetch", || self.git.fetch_tag(&workdir, &manifest.tag))
                .map_err(|err| AssetError::from_git(err, &repo, &manifest.tag))?;
            self.with_retry("checkout", || self.git.sparse_checkout(&workdir, &commit, prefix))
                .map_err(|err| AssetError::from_git(err, &repo, &manifest.tag))?;
            self.write_breadcrumb(located, &manifest.tag)?;
        }
        tracing::info!(tag = %manifest.tag, "reset assets");
        Ok(self.local_path(located))
    }
}
