//! Retention for the assets repository: find stale tags, back them up,
//! delete them, and bring them back.
//!
//! Deletion is two-phase. A tag is only removed once `<tag>_backup` exists at
//! the same commit, so every cleanup is reversible with [`AssetsMaintenance::restore_backup`].

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::ports::clock::Clock;
use crate::ports::git::{GitError, GitPorcelain};

use super::AssetError;

/// Suffix of backup tags.
pub const BACKUP_SUFFIX: &str = "_backup";

/// Which tags are eligible for cleanup.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// Unreferenced tags older than this are candidates.
    pub max_age: Duration,
    /// Also treat unreferenced tags younger than `max_age` as candidates.
    pub include_orphans: bool,
}

/// Why a tag was selected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum CandidateReason {
    /// Unreferenced and older than the retention window.
    Expired {
        /// Age in whole days.
        age_days: i64,
    },
    /// Unreferenced, within the window (or of unknown age).
    Orphaned,
    /// Named explicitly by the operator.
    Requested,
}

impl fmt::Display for CandidateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expired { age_days } => write!(f, "unreferenced, {age_days} days old"),
            Self::Orphaned => f.write_str("unreferenced"),
            Self::Requested => f.write_str("requested"),
        }
    }
}

/// A tag selected for backup or cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TagCandidate {
    /// Tag name.
    pub tag: String,
    /// Commit it points at.
    pub commit: String,
    /// When the tagged commit was created, if known.
    pub created_at: Option<DateTime<Utc>>,
    /// Why it was selected.
    pub reason: CandidateReason,
}

/// Maintenance operations against one assets repository.
pub struct AssetsMaintenance {
    git: Arc<dyn GitPorcelain>,
    clock: Arc<dyn Clock>,
    repo: String,
    workdir: PathBuf,
}

impl AssetsMaintenance {
    /// Prepares a scratch working directory for `repo`.
    ///
    /// # Errors
    ///
    /// Returns an error if the working directory cannot be initialized.
    pub fn new(
        git: Arc<dyn GitPorcelain>,
        clock: Arc<dyn Clock>,
        repo: &str,
        workdir: &Path,
    ) -> Result<Self, AssetError> {
        git.prepare(workdir, repo).map_err(|err| AssetError::from_git(err, repo, ""))?;
        Ok(Self { git, clock, repo: repo.to_string(), workdir: workdir.to_path_buf() })
    }

    fn map(&self, tag: &str) -> impl Fn(GitError) -> AssetError + '_ {
        let tag = tag.to_string();
        move |err| AssetError::from_git(err, &self.repo, &tag)
    }

    /// Lists tags eligible for cleanup under `policy`. Tags in `referenced`
    /// and backup tags are never candidates.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote cannot be listed.
    pub fn scan(
        &self,
        policy: &RetentionPolicy,
        referenced: &BTreeSet<String>,
    ) -> Result<Vec<TagCandidate>, AssetError> {
        let now = self.clock.now();
        let tags = self.git.remote_tags(&self.workdir).map_err(self.map(""))?;
        let mut candidates: Vec<TagCandidate> = tags
            .into_iter()
            .filter(|tag| !tag.name.ends_with(BACKUP_SUFFIX) && !referenced.contains(&tag.name))
            .filter_map(|tag| {
                let age = tag.created_at.map(|created| now - created);
                let reason = match age {
                    Some(age) if age > policy.max_age => {
                        CandidateReason::Expired { age_days: age.num_days() }
                    }
                    _ if policy.include_orphans => CandidateReason::Orphaned,
                    _ => return None,
                };
                Some(TagCandidate {
                    tag: tag.name,
                    commit: tag.commit,
                    created_at: tag.created_at,
                    reason,
                })
            })
            .collect();
        candidates.sort_by(|a, b| a.tag.cmp(&b.tag));
        tracing::info!(
            candidates = candidates.len(),
            referenced = referenced.len(),
            "scanned asset tags"
        );
        Ok(candidates)
    }

    /// Resolves explicitly named tags into candidates.
    ///
    /// # Errors
    ///
    /// Returns [`AssetError::NotFound`] if a tag does not exist.
    pub fn candidates_for(&self, names: &[String]) -> Result<Vec<TagCandidate>, AssetError> {
        let tags = self.git.remote_tags(&self.workdir).map_err(self.map(""))?;
        names
            .iter()
            .map(|name| {
                tags.iter()
                    .find(|tag| &tag.name == name)
                    .map(|tag| TagCandidate {
                        tag: tag.name.clone(),
                        commit: tag.commit.clone(),
                        created_at: tag.created_at,
                        reason: CandidateReason::Requested,
                    })
                    .ok_or_else(|| AssetError::NotFound {
                        repo: self.repo.clone(),
                        tag: name.clone(),
                    })
            })
            .collect()
    }

    /// Creates `<tag>_backup` for each candidate at the same commit and
    /// returns the backup tag names. Existing matching backups are kept.
    ///
    /// # Errors
    ///
    /// Returns [`AssetError::TagConflict`] if a backup tag exists at another commit.
    pub fn backup(&self, candidates: &[TagCandidate]) -> Result<Vec<String>, AssetError> {
        let mut created = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let backup = format!("{}{BACKUP_SUFFIX}", candidate.tag);
            match self.git.tag_commit(&self.workdir, &backup).map_err(self.map(&backup))? {
                Some(existing) if existing == candidate.commit => {
                    tracing::debug!(tag = %backup, "backup already present");
                }
                Some(existing) => {
                    return Err(AssetError::TagConflict {
                        tag: backup,
                        existing,
                        expected: candidate.commit.clone(),
                    });
                }
                None => {
                    self.git
                        .fetch_tag(&self.workdir, &candidate.tag)
                        .map_err(self.map(&candidate.tag))?;
                    self.git
                        .create_tag(&self.workdir, &backup, &candidate.commit)
                        .map_err(self.map(&backup))?;
                    tracing::info!(tag = %candidate.tag, backup = %backup, "backed up tag");
                }
            }
            created.push(backup);
        }
        Ok(created)
    }

    /// Deletes each candidate whose backup exists at the same commit and
    /// returns the deleted names. Already-deleted tags are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`AssetError::BackupMissing`] before deleting a tag that has
    /// no matching backup.
    pub fn cleanup(&self, candidates: &[TagCandidate]) -> Result<Vec<String>, AssetError> {
        let mut deleted = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let backup = format!("{}{BACKUP_SUFFIX}", candidate.tag);
            let backed_up = self.git.tag_commit(&self.workdir, &backup).map_err(self.map(&backup))?;
            if backed_up.as_deref() != Some(candidate.commit.as_str()) {
                return Err(AssetError::BackupMissing { tag: candidate.tag.clone() });
            }
            match self.git.delete_tag(&self.workdir, &candidate.tag) {
                Ok(()) => {
                    tracing::info!(tag = %candidate.tag, "deleted tag");
                    deleted.push(candidate.tag.clone());
                }
                Err(GitError::NotFound { .. }) => {
                    tracing::debug!(tag = %candidate.tag, "tag already deleted");
                }
                Err(err) => return Err(AssetError::from_git(err, &self.repo, &candidate.tag)),
            }
        }
        Ok(deleted)
    }

    /// Recreates the original tag from `backup_tag` and returns its name.
    /// A no-op when the original already exists at the backup's commit.
    ///
    /// # Errors
    ///
    /// Returns [`AssetError::InvalidBackupTag`], [`AssetError::NotFound`] or
    /// [`AssetError::TagConflict`].
    pub fn restore_backup(&self, backup_tag: &str) -> Result<String, AssetError> {
        let original = backup_tag
            .strip_suffix(BACKUP_SUFFIX)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| AssetError::InvalidBackupTag { tag: backup_tag.to_string() })?;
        let commit = self.git.fetch_tag(&self.workdir, backup_tag).map_err(self.map(backup_tag))?;
        match self.git.tag_commit(&self.workdir, original).map_err(self.map(original))? {
            Some(existing) if existing == commit => {}
            Some(existing) => {
                return Err(AssetError::TagConflict {
                    tag: original.to_string(),
                    existing,
                    expected: commit,
                });
            }
            None => {
                self.git.create_tag(&self.workdir, original, &commit).map_err(self.map(original))?;
                tracing::info!(tag = %original, backup = %backup_tag, "restored tag from backup");
            }
        }
        Ok(original.to_string())
    }
}
