//! Git porcelain port used by the asset synchronizer.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Failures of a git operation.
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    /// The tag or commit does not exist on the remote.
    #[error("{reference} does not exist on the remote")]
    NotFound {
        /// Missing reference.
        reference: String,
    },
    /// The command did not finish within its bound and was killed.
    #[error("`git {command}` timed out after {}s", .after.as_secs())]
    Timeout {
        /// Arguments passed to git.
        command: String,
        /// Configured bound.
        after: Duration,
    },
    /// The command exited unsuccessfully.
    #[error("`git {command}` exited with {code}: {stderr}")]
    Failed {
        /// Arguments passed to git.
        command: String,
        /// Exit code, `-1` if killed by a signal.
        code: i32,
        /// Captured standard error.
        stderr: String,
        /// Whether the failure looks transient (throttling, connect timeout).
        retryable: bool,
    },
    /// git could not be started, or a local file operation failed.
    #[error("git i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

impl GitError {
    /// Whether retrying the same read operation may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Failed { retryable, .. } => *retryable,
            Self::NotFound { .. } | Self::Io(_) => false,
        }
    }
}

/// A tag as seen on the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTag {
    /// Tag name.
    pub name: String,
    /// Commit the tag points at.
    pub commit: String,
    /// Creation time of the tagged commit, when known.
    pub created_at: Option<DateTime<Utc>>,
}

/// The git operations the asset synchronizer needs, against one working
/// directory whose `origin` is the assets repository.
///
/// Abstracting git access lets the synchronizer be tested against an
/// in-memory remote without a git binary.
pub trait GitPorcelain: Send + Sync {
    /// Initializes `workdir` as a sparse checkout of `repo` if it is not one already.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be initialized.
    fn prepare(&self, workdir: &Path, repo: &str) -> Result<(), GitError>;

    /// Fetches `tag` from the remote and returns the commit it points at.
    ///
    /// # Errors
    ///
    /// Returns [`GitError::NotFound`] if the tag is missing.
    fn fetch_tag(&self, workdir: &Path, tag: &str) -> Result<String, GitError>;

    /// Checks out `commit` restricted to `prefix`, replacing local content under it.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkout fails.
    fn sparse_checkout(&self, workdir: &Path, commit: &str, prefix: &str) -> Result<(), GitError>;

    /// Drops uncommitted changes and untracked files under `prefix`.
    ///
    /// # Errors
    ///
    /// Returns an error if the working tree cannot be cleaned.
    fn discard_changes(&self, workdir: &Path, prefix: &str) -> Result<(), GitError>;

    /// Paths under `prefix` whose content differs from `base`.
    ///
    /// # Errors
    ///
    /// Returns an error if the comparison fails.
    fn changed_paths(
        &self,
        workdir: &Path,
        base: &str,
        prefix: &str,
    ) -> Result<Vec<String>, GitError>;

    /// Commits everything under `prefix` on top of the checked-out commit and
    /// returns the new commit.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails.
    fn commit(&self, workdir: &Path, prefix: &str, message: &str) -> Result<String, GitError>;

    /// Creates `tag` at `commit` and publishes it to the remote.
    ///
    /// # Errors
    ///
    /// Returns an error if the tag cannot be created or pushed.
    fn create_tag(&self, workdir: &Path, tag: &str, commit: &str) -> Result<(), GitError>;

    /// Commit `tag` points at on the remote, or `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote cannot be queried.
    fn tag_commit(&self, workdir: &Path, tag: &str) -> Result<Option<String>, GitError>;

    /// Deletes `tag` from the remote and locally.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote refuses the deletion.
    fn delete_tag(&self, workdir: &Path, tag: &str) -> Result<(), GitError>;

    /// Every tag on the remote.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote cannot be listed.
    fn remote_tags(&self, workdir: &Path) -> Result<Vec<RemoteTag>, GitError>;
}
