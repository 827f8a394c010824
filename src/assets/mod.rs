//! Git-backed asset store: `assets.json` manifests and the synchronizer that
//! restores, pushes and resets the recordings they describe.

pub mod maintenance;
pub mod manifest;
pub mod sync;

use std::path::PathBuf;
use std::time::Duration;

use crate::ports::git::GitError;

pub use maintenance::{
    AssetsMaintenance, CandidateReason, RetentionPolicy, TagCandidate, BACKUP_SUFFIX,
};
pub use manifest::{AssetManifest, LocatedManifest, MANIFEST_FILE_NAME};
pub use sync::{AssetSynchronizer, PushOutcome, SyncOptions};

/// Errors raised by the asset store.
#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    /// The tag does not exist on the remote.
    #[error("tag {tag} was not found in {repo}")]
    NotFound {
        /// Assets repository.
        repo: String,
        /// Missing tag.
        tag: String,
    },
    /// A git remote call exceeded its bound.
    #[error("git operation `{operation}` timed out after {}s", .after.as_secs())]
    Timeout {
        /// The git command.
        operation: String,
        /// Configured bound.
        after: Duration,
    },
    /// No manifest between the start directory and the git root.
    #[error("unable to locate an assets.json at or above {}", .start.display())]
    ManifestNotFound {
        /// Where the search began.
        start: PathBuf,
    },
    /// The manifest exists but cannot be used.
    #[error("assets.json at {} is invalid: {reason}", .path.display())]
    InvalidManifest {
        /// Manifest path.
        path: PathBuf,
        /// What is wrong.
        reason: String,
    },
    /// The manifest's SHA disagrees with the tag's commit.
    #[error("tag {tag} resolves to {actual} but assets.json records {expected}")]
    ShaMismatch {
        /// Tag.
        tag: String,
        /// SHA recorded in the manifest.
        expected: String,
        /// Commit the tag points at.
        actual: String,
    },
    /// A tag already exists at a different commit.
    #[error("tag {tag} already exists at {existing}, expected {expected}")]
    TagConflict {
        /// Tag.
        tag: String,
        /// Commit the remote has.
        existing: String,
        /// Commit we wanted.
        expected: String,
    },
    /// `push` was called before the manifest's tag was restored locally.
    #[error("recordings for tag {tag} have not been restored; run restore first")]
    NotRestored {
        /// Manifest tag.
        tag: String,
    },
    /// `cleanup` refused to delete a tag without a matching backup.
    #[error("refusing to delete {tag}: no {tag}{BACKUP_SUFFIX} at the same commit")]
    BackupMissing {
        /// Tag that would have been deleted.
        tag: String,
    },
    /// `restore` of a tag that is not a backup tag.
    #[error("{tag} is not a backup tag (expected a `{BACKUP_SUFFIX}` suffix)")]
    InvalidBackupTag {
        /// Offending tag.
        tag: String,
    },
    /// Any other git failure.
    #[error(transparent)]
    Git(GitError),
    /// Local filesystem failure.
    #[error("failed to {action} {}: {source}", .path.display())]
    Io {
        /// What was being attempted.
        action: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl AssetError {
    /// Maps a git failure, naming the tag a missing reference refers to.
    pub(crate) fn from_git(err: GitError, repo: &str, tag: &str) -> Self {
        match err {
            GitError::NotFound { .. } => {
                Self::NotFound { repo: repo.to_string(), tag: tag.to_string() }
            }
            GitError::Timeout { command, after } => Self::Timeout { operation: command, after },
            other => Self::Git(other),
        }
    }

    pub(crate) fn io(
        action: &'static str,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Self::Io { action, path: path.into(), source }
    }

    /// Whether an idempotent read that failed this way may be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Git(err) => err.is_retryable(),
            _ => false,
        }
    }
}
