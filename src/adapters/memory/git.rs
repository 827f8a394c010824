//! An in-memory assets remote implementing [`GitPorcelain`].
//!
//! Commits are content-addressed snapshots of file trees; tags map to
//! commits. Working directories are real directories so the synchronizer's
//! file handling is exercised for real. Failure injection covers the
//! transient paths: throttled fetches and pushes whose acknowledgement is lost.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::ports::clock::Clock;
use crate::ports::git::{GitError, GitPorcelain, RemoteTag};

type Snapshot = BTreeMap<String, Vec<u8>>;

#[derive(Debug, Clone)]
struct TagRecord {
    commit: String,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct RemoteState {
    commits: HashMap<String, Snapshot>,
    tags: BTreeMap<String, TagRecord>,
    heads: HashMap<PathBuf, String>,
    fetch_failures: u32,
    lost_push_acks: u32,
    operations: Vec<String>,
}

/// In-memory assets remote.
pub struct MemoryGit {
    state: Mutex<RemoteState>,
    clock: Arc<dyn Clock>,
}

impl MemoryGit {
    /// Creates an empty remote whose tag timestamps come from `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { state: Mutex::new(RemoteState::default()), clock }
    }

    fn state(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publishes a tag whose commit holds `files` (repo-relative path, contents).
    pub fn seed_tag(&self, tag: &str, files: &[(&str, &str)]) -> String {
        let snapshot: Snapshot = files
            .iter()
            .map(|(path, body)| ((*path).to_string(), body.as_bytes().to_vec()))
            .collect();
        let commit = snapshot_id(None, &snapshot);
        let created_at = self.clock.now();
        let mut state = self.state();
        state.commits.insert(commit.clone(), snapshot);
        state.tags.insert(tag.to_string(), TagRecord { commit: commit.clone(), created_at });
        commit
    }

    /// Files in the commit `tag` points at.
    #[must_use]
    pub fn tag_files(&self, tag: &str) -> Option<BTreeMap<String, String>> {
        let state = self.state();
        let record = state.tags.get(tag)?;
        let snapshot = state.commits.get(&record.commit)?;
        Some(
            snapshot
                .iter()
                .map(|(path, body)| (path.clone(), String::from_utf8_lossy(body).into_owned()))
                .collect(),
        )
    }

    /// Names of every tag on the remote.
    #[must_use]
    pub fn tag_names(&self) -> Vec<String> {
        self.state().tags.keys().cloned().collect()
    }

    /// Makes the next `count` fetches fail with a retryable error.
    pub fn fail_fetches(&self, count: u32) {
        self.state().fetch_failures = count;
    }

    /// Makes the next `count` tag pushes land on the remote but report failure.
    pub fn lose_push_acks(&self, count: u32) {
        self.state().lost_push_acks = count;
    }

    /// Every porcelain call made so far, as `"<op> <arg>"`.
    #[must_use]
    pub fn operations(&self) -> Vec<String> {
        self.state().operations.clone()
    }
}

fn snapshot_id(parent: Option<&str>, snapshot: &Snapshot) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parent.unwrap_or_default().as_bytes());
    for (path, body) in snapshot {
        hasher.update(path.as_bytes());
        hasher.update([0]);
        hasher.update((body.len() as u64).to_le_bytes());
        hasher.update(body);
    }
    hasher.finalize().iter().map(|byte| format!("{byte:02x}")).collect()
}

fn normalize_prefix(prefix: &str) -> String {
    format!("{}/", prefix.trim_matches('/'))
}

fn read_tree(root: &Path, prefix: &str) -> Result<Snapshot, GitError> {
    let mut files = Snapshot::new();
    let base = root.join(prefix.trim_matches('/'));
    if !base.exists() {
        return Ok(files);
    }
    let mut pending = vec![base];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                let relative = path
                    .strip_prefix(root)
                    .map_err(|err| GitError::Io(std::io::Error::other(err.to_string())))?
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                files.insert(relative, std::fs::read(&path)?);
            }
        }
    }
    Ok(files)
}

fn under<'a>(
    snapshot: &'a Snapshot,
    prefix: &'a str,
) -> impl Iterator<Item = (&'a String, &'a Vec<u8>)> + 'a {
    snapshot.iter().filter(move |(path, _)| path.starts_with(prefix))
}

impl GitPorcelain for MemoryGit {
    fn prepare(&self, workdir: &Path, repo: &str) -> Result<(), GitError> {
        std::fs::create_dir_all(workdir)?;
        self.state().operations.push(format!("prepare {repo}"));
        Ok(())
    }

    fn fetch_tag(&self, _workdir: &Path, tag: &str) -> Result<String, GitError> {
        let mut state = self.state();
        state.operations.push(format!("fetch {tag}"));
        if state.fetch_failures > 0 {
            state.fetch_failures -= 1;
            return Err(GitError::Failed {
                command: format!("fetch origin refs/tags/{tag}"),
                code: 128,
                stderr: "The requested URL returned error: 429".to_string(),
                retryable: true,
            });
        }
        state
            .tags
            .get(tag)
            .map(|record| record.commit.clone())
            .ok_or_else(|| GitError::NotFound { reference: format!("tag {tag}") })
    }

    fn sparse_checkout(&self, workdir: &Path, commit: &str, prefix: &str) -> Result<(), GitError> {
        let mut state = self.state();
        state.operations.push(format!("checkout {commit}"));
        let snapshot = state
            .commits
            .get(commit)
            .cloned()
            .ok_or_else(|| GitError::NotFound { reference: format!("commit {commit}") })?;
        let local = workdir.join(prefix.trim_matches('/'));
        if local.exists() {
            std::fs::remove_dir_all(&local)?;
        }
        let prefix = normalize_prefix(prefix);
        for (path, body) in under(&snapshot, &prefix) {
            let target = workdir.join(path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(target, body)?;
        }
        state.heads.insert(workdir.to_path_buf(), commit.to_string());
        Ok(())
    }

    fn discard_changes(&self, workdir: &Path, prefix: &str) -> Result<(), GitError> {
        let head = self.state().heads.get(workdir).cloned();
        match head {
            Some(commit) => self.sparse_checkout(workdir, &commit, prefix),
            None => {
                let local = workdir.join(prefix.trim_matches('/'));
                if local.exists() {
                    std::fs::remove_dir_all(local)?;
                }
                Ok(())
            }
        }
    }

    fn changed_paths(
        &self,
        workdir: &Path,
        base: &str,
        prefix: &str,
    ) -> Result<Vec<String>, GitError> {
        let local = read_tree(workdir, prefix)?;
        let state = self.state();
        let empty = Snapshot::new();
        let committed = if base.is_empty() {
            &empty
        } else {
            state
                .commits
                .get(base)
                .ok_or_else(|| GitError::NotFound { reference: format!("commit {base}") })?
        };
        let prefix = normalize_prefix(prefix);
        let committed: Snapshot =
            under(committed, &prefix).map(|(p, b)| (p.clone(), b.clone())).collect();

        let mut changed: Vec<String> = local
            .iter()
            .filter(|(path, body)| committed.get(*path) != Some(*body))
            .map(|(path, _)| path.clone())
            .chain(committed.keys().filter(|path| !local.contains_key(*path)).cloned())
            .collect();
        changed.sort();
        Ok(changed)
    }

    fn commit(&self, workdir: &Path, prefix: &str, message: &str) -> Result<String, GitError> {
        let local = read_tree(workdir, prefix)?;
        let mut state = self.state();
        state.operations.push(format!("commit {message}"));
        let parent = state.heads.get(workdir).cloned();
        let mut snapshot =
            parent.as_ref().and_then(|p| state.commits.get(p)).cloned().unwrap_or_default();
        let normalized = normalize_prefix(prefix);
        snapshot.retain(|path, _| !path.starts_with(&normalized));
        snapshot.extend(local);
        let commit = snapshot_id(parent.as_deref(), &snapshot);
        state.commits.insert(commit.clone(), snapshot);
        state.heads.insert(workdir.to_path_buf(), commit.clone());
        Ok(commit)
    }

    fn create_tag(&self, _workdir: &Path, tag: &str, commit: &str) -> Result<(), GitError> {
        let created_at = self.clock.now();
        let mut state = self.state();
        state.operations.push(format!("tag {tag}"));
        if !state.commits.contains_key(commit) {
            return Err(GitError::NotFound { reference: format!("commit {commit}") });
        }
        if let Some(existing) = state.tags.get(tag) {
            if existing.commit != commit {
                return Err(GitError::Failed {
                    command: format!("push origin refs/tags/{tag}"),
                    code: 1,
                    stderr: format!("! [rejected] {tag} -> {tag} (already exists)"),
                    retryable: false,
                });
            }
        }
        state.tags.insert(tag.to_string(), TagRecord { commit: commit.to_string(), created_at });
        if state.lost_push_acks > 0 {
            state.lost_push_acks -= 1;
            return Err(GitError::Failed {
                command: format!("push origin refs/tags/{tag}"),
                code: 128,
                stderr: "The requested URL returned error: 429".to_string(),
                retryable: true,
            });
        }
        Ok(())
    }

    fn tag_commit(&self, _workdir: &Path, tag: &str) -> Result<Option<String>, GitError> {
        Ok(self.state().tags.get(tag).map(|record| record.commit.clone()))
    }

    fn delete_tag(&self, _workdir: &Path, tag: &str) -> Result<(), GitError> {
        let mut state = self.state();
        state.operations.push(format!("delete {tag}"));
        state
            .tags
            .remove(tag)
            .map(|_| ())
            .ok_or_else(|| GitError::NotFound { reference: format!("tag {tag}") })
    }

    fn remote_tags(&self, _workdir: &Path) -> Result<Vec<RemoteTag>, GitError> {
        Ok(self
            .state()
            .tags
            .iter()
            .map(|(name, record)| RemoteTag {
                name: name.clone(),
                commit: record.commit.clone(),
                created_at: Some(record.created_at),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::FixedClock;

    fn remote() -> MemoryGit {
        MemoryGit::new(Arc::new(FixedClock::new(Utc::now())))
    }

    #[test]
    fn checkout_materializes_only_the_prefix() {
        let git = remote();
        let commit = git.seed_tag("t1", &[("sdk/a/rec.json", "{}"), ("sdk/b/other.json", "[]")]);
        let dir = tempfile::tempdir().unwrap();
        git.sparse_checkout(dir.path(), &commit, "sdk/a").unwrap();

        assert!(dir.path().join("sdk/a/rec.json").exists());
        assert!(!dir.path().join("sdk/b").exists());
        assert!(git.changed_paths(dir.path(), &commit, "sdk/a").unwrap().is_empty());
    }

    #[test]
    fn changed_paths_reports_edits_additions_and_deletions() {
        let git = remote();
        let commit = git.seed_tag("t1", &[("p/one.json", "1"), ("p/two.json", "2")]);
        let dir = tempfile::tempdir().unwrap();
        git.sparse_checkout(dir.path(), &commit, "p").unwrap();

        std::fs::write(dir.path().join("p/one.json"), "changed").unwrap();
        std::fs::remove_file(dir.path().join("p/two.json")).unwrap();
        std::fs::write(dir.path().join("p/three.json"), "3").unwrap();

        let changed = git.changed_paths(dir.path(), &commit, "p").unwrap();
        assert_eq!(changed, vec!["p/one.json", "p/three.json", "p/two.json"]);
    }

    #[test]
    fn commit_is_content_addressed() {
        let git = remote();
        let base = git.seed_tag("t1", &[("p/one.json", "1")]);
        let dir = tempfile::tempdir().unwrap();
        git.sparse_checkout(dir.path(), &base, "p").unwrap();
        std::fs::write(dir.path().join("p/one.json"), "2").unwrap();

        let first = git.commit(dir.path(), "p", "update").unwrap();
        assert_ne!(first, base);
        git.create_tag(dir.path(), "t2", &first).unwrap();
        assert_eq!(git.tag_files("t2").unwrap()["p/one.json"], "2");
    }

    #[test]
    fn injected_failures_are_retryable() {
        let git = remote();
        git.seed_tag("t1", &[("p/x", "x")]);
        git.fail_fetches(1);
        let dir = tempfile::tempdir().unwrap();
        let err = git.fetch_tag(dir.path(), "t1").unwrap_err();
        assert!(err.is_retryable());
        assert!(git.fetch_tag(dir.path(), "t1").is_ok());
        assert!(matches!(git.fetch_tag(dir.path(), "missing"), Err(GitError::NotFound { .. })));
    }
}
