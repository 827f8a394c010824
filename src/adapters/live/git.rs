//! Live git adapter using `git` CLI commands.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::ports::git::{GitError, GitPorcelain, RemoteTag};

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const FALLBACK_USER_NAME: &str = "vcrproxy";
const FALLBACK_USER_EMAIL: &str = "vcrproxy@localhost";
/// Tag name, peeled commit and creation date, tab separated.
const TAG_FORMAT: &str = concat!(
    "--format=%(refname:short)%09",
    "%(if)%(*objectname)%(then)%(*objectname)%(else)%(objectname)%(end)%09",
    "%(creatordate:iso-strict)",
);

/// Live git adapter that shells out to the `git` CLI, killing any command
/// that outlives `timeout`.
pub struct LiveGit {
    timeout: Duration,
}

impl LiveGit {
    /// Creates an adapter with the given per-command bound.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn run(&self, workdir: &Path, args: &[&str]) -> Result<String, GitError> {
        let command = args.join(" ");
        tracing::debug!(workdir = %workdir.display(), command = %command, "running git");
        let mut child = Command::new("git")
            .args(args)
            .current_dir(workdir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);
        let deadline = Instant::now() + self.timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                // Best effort: the process may already be gone.
                let _ = child.kill();
                let _ = child.wait();
                return Err(GitError::Timeout { command, after: self.timeout });
            }
            thread::sleep(POLL_INTERVAL);
        };

        let stdout = stdout.and_then(|handle| handle.join().ok()).unwrap_or_default();
        let stderr = stderr.and_then(|handle| handle.join().ok()).unwrap_or_default();
        if status.success() {
            return Ok(stdout);
        }
        let retryable = is_transient(&stderr);
        Err(GitError::Failed {
            command,
            code: status.code().unwrap_or(-1),
            stderr: stderr.trim().to_string(),
            retryable,
        })
    }
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = reader.read_to_end(&mut buffer);
        String::from_utf8_lossy(&buffer).into_owned()
    })
}

/// Throttling and connect timeouts against the remote are worth retrying.
fn is_transient(stderr: &str) -> bool {
    if stderr.contains("The requested URL returned error: 429") {
        return true;
    }
    let lower = stderr.to_ascii_lowercase();
    lower.contains("failed to connect to")
        && lower.contains("port 443")
        && lower.contains("timed out")
}

fn is_missing_ref(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("couldn't find remote ref")
        || lower.contains("not found")
        || lower.contains("unknown revision")
}

fn sparse_pattern(prefix: &str) -> String {
    format!("/{}/", prefix.trim_matches('/'))
}

impl GitPorcelain for LiveGit {
    fn prepare(&self, workdir: &Path, repo: &str) -> Result<(), GitError> {
        std::fs::create_dir_all(workdir)?;
        if workdir.join(".git").exists() {
            return Ok(());
        }
        self.run(workdir, &["init", "--quiet"])?;
        self.run(workdir, &["remote", "add", "origin", repo])?;
        self.run(workdir, &["config", "core.sparseCheckout", "true"])?;
        if self.run(workdir, &["config", "user.email"]).is_err() {
            self.run(workdir, &["config", "user.name", FALLBACK_USER_NAME])?;
            self.run(workdir, &["config", "user.email", FALLBACK_USER_EMAIL])?;
        }
        Ok(())
    }

    fn fetch_tag(&self, workdir: &Path, tag: &str) -> Result<String, GitError> {
        let refspec = format!("+refs/tags/{tag}:refs/tags/{tag}");
        match self.run(workdir, &["fetch", "--no-tags", "origin", &refspec]) {
            Err(GitError::Failed { stderr, .. }) if is_missing_ref(&stderr) => {
                return Err(GitError::NotFound { reference: format!("tag {tag}") });
            }
            other => {
                other?;
            }
        }
        let commit = self.run(workdir, &["rev-parse", &format!("refs/tags/{tag}^{{commit}}")])?;
        Ok(commit.trim().to_string())
    }

    fn sparse_checkout(&self, workdir: &Path, commit: &str, prefix: &str) -> Result<(), GitError> {
        self.run(workdir, &["sparse-checkout", "set", "--no-cone", &sparse_pattern(prefix)])?;
        self.run(workdir, &["checkout", "--force", "--detach", commit])?;
        Ok(())
    }

    fn discard_changes(&self, workdir: &Path, prefix: &str) -> Result<(), GitError> {
        self.run(workdir, &["reset", "--hard", "--quiet", "HEAD"])?;
        self.run(workdir, &["clean", "-fdq", "--", prefix])?;
        Ok(())
    }

    fn changed_paths(
        &self,
        workdir: &Path,
        base: &str,
        prefix: &str,
    ) -> Result<Vec<String>, GitError> {
        self.run(workdir, &["add", "--all", "--sparse", "--", prefix])?;
        let listing = if base.is_empty() {
            self.run(workdir, &["ls-files", "--cached", "--", prefix])?
        } else {
            self.run(workdir, &["diff", "--cached", "--name-only", base, "--", prefix])?
        };
        Ok(listing.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect())
    }

    fn commit(&self, workdir: &Path, prefix: &str, message: &str) -> Result<String, GitError> {
        self.run(workdir, &["add", "--all", "--sparse", "--", prefix])?;
        // A push that died between commit and tag leaves HEAD holding the
        // changes and nothing staged.
        if let Ok(head) = self.run(workdir, &["rev-parse", "--verify", "--quiet", "HEAD"]) {
            if self.run(workdir, &["diff", "--cached", "--quiet", "HEAD"]).is_ok() {
                let head = head.trim().to_string();
                tracing::info!(
                    workdir = %workdir.display(),
                    commit = %head,
                    "nothing staged, reusing HEAD"
                );
                return Ok(head);
            }
        }
        self.run(workdir, &["commit", "--quiet", "--no-verify", "-m", message])?;
        Ok(self.run(workdir, &["rev-parse", "HEAD"])?.trim().to_string())
    }

    fn create_tag(&self, workdir: &Path, tag: &str, commit: &str) -> Result<(), GitError> {
        self.run(workdir, &["tag", "--force", tag, commit])?;
        self.run(workdir, &["push", "origin", &format!("refs/tags/{tag}")])?;
        Ok(())
    }

    fn tag_commit(&self, workdir: &Path, tag: &str) -> Result<Option<String>, GitError> {
        let tag_ref = format!("refs/tags/{tag}");
        let listing = self.run(workdir, &["ls-remote", "--tags", "origin", &tag_ref])?;
        Ok(listing.split_whitespace().next().map(String::from))
    }

    fn delete_tag(&self, workdir: &Path, tag: &str) -> Result<(), GitError> {
        match self.run(workdir, &["push", "origin", "--delete", &format!("refs/tags/{tag}")]) {
            Err(GitError::Failed { stderr, .. })
                if is_missing_ref(&stderr) || stderr.contains("unable to delete") =>
            {
                return Err(GitError::NotFound { reference: format!("tag {tag}") });
            }
            other => {
                other?;
            }
        }
        // The local copy is only a cache; a missing one is fine.
        let _ = self.run(workdir, &["tag", "-d", tag]);
        Ok(())
    }

    fn remote_tags(&self, workdir: &Path) -> Result<Vec<RemoteTag>, GitError> {
        self.run(
            workdir,
            &[
                "fetch",
                "--quiet",
                "--force",
                "--prune",
                "--prune-tags",
                "origin",
                "+refs/tags/*:refs/tags/*",
            ],
        )?;
        let listing = self.run(workdir, &["for-each-ref", "refs/tags", TAG_FORMAT])?;
    }
}

fn parse_tag_line(line: &str) -> Option<RemoteTag> {
    let mut fields = line.split('\t');
    let name = fields.next()?.trim();
    let commit = fields.next()?.trim();
    if name.is_empty() || commit.is_empty() {
        return None;
    }
    let created_at = fields
        .next()
        .and_then(|date| DateTime::parse_from_rfc3339(date.trim()).ok())
        .map(|date| date.with_timezone(&Utc));
    Some(RemoteTag { name: name.to_string(), commit: commit.to_string(), created_at })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transient_failures() {
        assert!(is_transient("fatal: unable to access: The requested URL returned error: 429"));
        assert!(is_transient(
            "fatal: unable to access 'https://github.com/x/': \
             Failed to connect to github.com port 443 after 21 ms: Timed out"
        ));
        assert!(!is_transient("fatal: couldn't find remote ref refs/tags/nope"));
    }

    #[test]
    fn parses_for_each_ref_lines() {
        let tag = parse_tag_line("python/tables_1a2b3c\tdeadbeef\t2024-01-02T03:04:05+00:00")
            .unwrap();
        assert_eq!(tag.name, "python/tables_1a2b3c");
        assert_eq!(tag.commit, "deadbeef");
        assert_eq!(
            tag.created_at.map(|d| d.to_rfc3339()),
            Some("2024-01-02T03:04:05+00:00".to_string())
        );
        assert!(parse_tag_line("").is_none());
    }

    fn git_available() -> bool {
        Command::new("git").arg("--version").output().is_ok_and(|out| out.status.success())
    }

    #[test]
    fn commit_after_untagged_commit_reuses_head() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let git = LiveGit::new(Duration::from_secs(30));
        git.prepare(dir.path(), "https://example.invalid/assets.git").unwrap();
        std::fs::create_dir_all(dir.path().join("python/tables")).unwrap();
        std::fs::write(dir.path().join("python/tables/a.json"), "{}").unwrap();

        let first = git.commit(dir.path(), "python/tables", "first").unwrap();
        // The tag push never happened; the retry commits again.
        let retried = git.commit(dir.path(), "python/tables", "first").unwrap();
        assert_eq!(retried, first);

        std::fs::write(dir.path().join("python/tables/b.json"), "{}").unwrap();
        let second = git.commit(dir.path(), "python/tables", "second").unwrap();
        assert_ne!(second, first);
    }

    #[test]
    fn sparse_pattern_is_anchored() {
        assert_eq!(sparse_pattern("python/tables/"), "/python/tables/");
    }
}
