//! Sparse git worktree operations.
//!
//! One `GitWorktree` owns one on-disk clone of one reference of one remote.
//! The worktree is sparse-checkout restricted to the configured sparse path,
//! so checkouts and hard resets only ever materialize or touch files inside
//! that subtree. The local/remote reference pair is `refs/heads/<ref>` and
//! `refs/remotes/origin/<ref>`; a fetch may leave them divergent, and the
//! caller decides between a hard reset and a checkout + pull.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use serde::Serialize;
use tokio::process::Command as TokioCommand;

use super::auth::GitAuth;
use super::error::{GitError, Result};
use super::parse::{format_git_error, is_already_up_to_date};

/// A content-addressed commit hash. The default value is the zero revision,
/// meaning "never delivered".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct Revision(String);

impl Revision {
    /// The zero revision.
    pub fn zero() -> Self {
        Self::default()
    }

    /// Whether this is the zero revision.
    pub fn is_zero(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            f.write_str("<zero>")
        } else {
            f.write_str(&self.0)
        }
    }
}

impl From<String> for Revision {
    fn from(hash: String) -> Self {
        Self(hash)
    }
}

/// Outcome of a fetch against origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The remote reference moved.
    Updated,
    /// Nothing new on the remote.
    AlreadyUpToDate,
}

/// Outcome of a fast-forward pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    Updated,
    AlreadyUpToDate,
}

/// One entry of the path-filtered revision history.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionEntry {
    pub hash: String,
    pub message: String,
}

/// A sparse clone of a single branch of a single remote.
pub struct GitWorktree {
    path: PathBuf,
    url: String,
    reference: String,
    sparse_path: String,
    auth: Option<GitAuth>,
}

impl GitWorktree {
    /// Clones the repository (single-branch, sparse) into `path`, or opens an
    /// existing clone and re-applies the sparse configuration.
    pub async fn clone_or_open(
        path: PathBuf,
        url: String,
        reference: String,
        sparse_path: String,
        auth: Option<GitAuth>,
    ) -> Result<Self> {
        let worktree = Self {
            path,
            url,
            reference,
            sparse_path,
            auth,
        };

        if !worktree.path.join(".git").exists() {
            worktree.clone_repo().await?;
        }

        worktree.checkout().await?;
        Ok(worktree)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn local_ref(&self) -> String {
        format!("refs/heads/{}", self.reference)
    }

    fn remote_ref(&self) -> String {
        format!("refs/remotes/origin/{}", self.reference)
    }

    async fn clone_repo(&self) -> Result<()> {
        let path = self.path.display().to_string();
        let args = [
            "clone",
            "--branch",
            &self.reference,
            "--single-branch",
            "--no-checkout",
            &self.url,
            &path,
        ];

        let mut cmd = TokioCommand::new("git");
        cmd.args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        self.apply_auth(&mut cmd);

        let output = cmd.output().await.map_err(GitError::Spawn)?;
        if !output.status.success() {
            return Err(GitError::Command {
                op: "clone",
                message: format_git_error(&output),
            });
        }
        Ok(())
    }

    /// Applies the sparse-checkout configuration for the sparse path. A no-op
    /// for an empty sparse path (the full tree is materialized). The path is
    /// anchored as a root-level prefix pattern, so files outside the subtree
    /// (including repository-root files) are never materialized.
    fn configure_sparse(&self) -> Result<()> {
        if self.sparse_path.is_empty() {
            return Ok(());
        }

        let pattern = format!("/{}/", self.sparse_path.trim_matches('/'));
        let output = self.run_git(&["sparse-checkout", "set", "--no-cone", &pattern])?;
        if !output.status.success() {
            return Err(GitError::Command {
                op: "sparse-checkout",
                message: format_git_error(&output),
            });
        }
        Ok(())
    }

    /// Checks out the target reference under the sparse configuration.
    /// Idempotent; also used as the guard step after a reset or pull.
    pub async fn checkout(&self) -> Result<()> {
        self.ensure_repo()?;
        self.configure_sparse()?;

        let output = self.run_git(&["checkout", &self.reference])?;
        if !output.status.success() {
            return Err(GitError::Command {
                op: "checkout",
                message: format_git_error(&output),
            });
        }
        Ok(())
    }

    /// Fetches the target reference from origin. The outcome is derived from
    /// the remote-tracking reference hash before and after the fetch.
    pub async fn fetch(&self) -> Result<FetchOutcome> {
        self.ensure_repo()?;
        let before = self.remote_hash().ok();

        let output = self
            .run_git_network(&["fetch", "origin", &self.reference])
            .await?;
        if !output.status.success() {
            return Err(GitError::Command {
                op: "fetch",
                message: format_git_error(&output),
            });
        }

        let after = self.remote_hash()?;
        if before.as_ref() == Some(&after) {
            Ok(FetchOutcome::AlreadyUpToDate)
        } else {
            Ok(FetchOutcome::Updated)
        }
    }

    /// Fast-forwards the local branch from origin.
    pub async fn pull(&self) -> Result<PullOutcome> {
        self.ensure_repo()?;

        let output = self
            .run_git_network(&["pull", "--ff-only", "origin", &self.reference])
            .await?;
        if !output.status.success() {
            return Err(GitError::Command {
                op: "pull",
                message: format_git_error(&output),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if is_already_up_to_date(&stdout) {
            Ok(PullOutcome::AlreadyUpToDate)
        } else {
            Ok(PullOutcome::Updated)
        }
    }

    /// Hard-resets the worktree to `revision`. Materialization is bounded by
    /// the sparse-checkout cone, so files outside the sparse path stay
    /// untouched.
    pub async fn reset_hard(&self, revision: &Revision) -> Result<()> {
        self.ensure_repo()?;
        self.configure_sparse()?;

        let output = self.run_git(&["reset", "--hard", revision.as_str()])?;
        if !output.status.success() {
            return Err(GitError::Command {
                op: "reset",
                message: format_git_error(&output),
            });
        }
        Ok(())
    }

    /// Hash of `refs/heads/<ref>`.
    pub fn local_hash(&self) -> Result<Revision> {
        self.rev_parse(&self.local_ref())
    }

    /// Hash of `refs/remotes/origin/<ref>`.
    pub fn remote_hash(&self) -> Result<Revision> {
        self.rev_parse(&self.remote_ref())
    }

    /// The most recent commit on the reference whose tree touches the sparse
    /// path (any commit when the sparse path is empty). An empty history is a
    /// hard error: a delivered reference always has at least one commit.
    pub fn head_revision(&self) -> Result<Revision> {
        let mut args = vec!["log", "-1", "--format=%H", &self.reference];
        if !self.sparse_path.is_empty() {
            args.push("--");
            args.push(&self.sparse_path);
        }

        let output = self.run_git(&args)?;
        if !output.status.success() {
            return Err(GitError::Command {
                op: "log",
                message: format_git_error(&output),
            });
        }

        let hash = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if hash.is_empty() {
            return Err(GitError::EmptyHistory {
                reference: self.reference.clone(),
                path: self.sparse_path.clone(),
            });
        }

        Ok(Revision::from(hash))
    }

    /// Path-filtered history of the reference, newest first.
    pub fn revision_history(&self) -> Result<Vec<RevisionEntry>> {
        let mut args = vec!["log", "--format=%H%x09%s", &self.reference];
        if !self.sparse_path.is_empty() {
            args.push("--");
            args.push(&self.sparse_path);
        }

        let output = self.run_git(&args)?;
        if !output.status.success() {
            return Err(GitError::Command {
                op: "log",
                message: format_git_error(&output),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let entries = stdout
            .lines()
            .filter_map(|line| {
                let (hash, message) = line.split_once('\t')?;
                Some(RevisionEntry {
                    hash: hash.to_string(),
                    message: message.to_string(),
                })
            })
            .collect();

        Ok(entries)
    }

    fn ensure_repo(&self) -> Result<()> {
        if self.path.join(".git").exists() {
            Ok(())
        } else {
            Err(GitError::NotARepository(self.path.clone()))
        }
    }

    fn rev_parse(&self, reference: &str) -> Result<Revision> {
        let output = self.run_git(&["rev-parse", "--verify", reference])?;
        if !output.status.success() {
            return Err(GitError::ReferenceNotFound {
                reference: reference.to_string(),
            });
        }

        let hash = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(Revision::from(hash))
    }

    /// Runs a short local git command in the worktree.
    fn run_git(&self, args: &[&str]) -> Result<Output> {
        std::process::Command::new("git")
            .current_dir(&self.path)
            .args(args)
            .output()
            .map_err(GitError::Spawn)
    }

    /// Runs a git command that reaches the remote, with auth injected.
    async fn run_git_network(&self, args: &[&str]) -> Result<Output> {
        let mut cmd = TokioCommand::new("git");
        cmd.current_dir(&self.path)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        self.apply_auth(&mut cmd);

        cmd.output().await.map_err(GitError::Spawn)
    }

    fn apply_auth(&self, cmd: &mut TokioCommand) {
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        if let Some(auth) = &self.auth {
            for (key, value) in auth.env() {
                cmd.env(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_revision() {
        let zero = Revision::zero();
        assert!(zero.is_zero());
        assert_eq!(zero.to_string(), "<zero>");

        let real = Revision::from("abc123".to_string());
        assert!(!real.is_zero());
        assert_eq!(real.to_string(), "abc123");
    }

    #[test]
    fn reference_pair_names() {
        let worktree = GitWorktree {
            path: PathBuf::from("/tmp/x"),
            url: "file:///origin".to_string(),
            reference: "main".to_string(),
            sparse_path: "deploy".to_string(),
            auth: None,
        };
        assert_eq!(worktree.local_ref(), "refs/heads/main");
        assert_eq!(worktree.remote_ref(), "refs/remotes/origin/main");
    }

    #[test]
    fn head_revision_is_a_hard_error_when_no_commit_matches() {
        let dir = tempfile::TempDir::new().unwrap();
        let git = |args: &[&str]| {
            let status = std::process::Command::new("git")
                .current_dir(dir.path())
                .args(args)
                .output()
                .unwrap();
            assert!(status.status.success(), "git {args:?} failed");
        };
        git(&["init", "-b", "main"]);
        git(&["config", "user.email", "test@test.com"]);
        git(&["config", "user.name", "Test"]);
        std::fs::write(dir.path().join("README.md"), "root only").unwrap();
        git(&["add", "."]);
        git(&["commit", "-m", "root commit"]);

        let worktree = GitWorktree {
            path: dir.path().to_path_buf(),
            url: String::new(),
            reference: "main".to_string(),
            sparse_path: "deploy".to_string(),
            auth: None,
        };

        assert!(matches!(
            worktree.head_revision(),
            Err(GitError::EmptyHistory { .. })
        ));
    }

    #[tokio::test]
    async fn operations_on_missing_repo_fail() {
        let dir = tempfile::TempDir::new().unwrap();
        let worktree = GitWorktree {
            path: dir.path().join("absent"),
            url: "file:///origin".to_string(),
            reference: "main".to_string(),
            sparse_path: String::new(),
            auth: None,
        };

        assert!(matches!(
            worktree.fetch().await,
            Err(GitError::NotARepository(_))
        ));
        assert!(matches!(
            worktree.pull().await,
            Err(GitError::NotARepository(_))
        ));
    }
}
