//! Shared test fixtures.

#![allow(dead_code)]

use std::path::Path;
use std::process::Command;

use tempfile::TempDir;

/// A local git repository standing in for a remote.
///
/// Commits are created directly in its worktree; engine clones fetch from it
/// over the `file://` transport, which keeps repository settings off the SSH
/// authentication path.
pub struct OriginRepo {
    dir: TempDir,
}

impl OriginRepo {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let origin = Self { dir };
        origin.git(&["init", "-b", "main"]);
        origin.git(&["config", "user.email", "test@test.com"]);
        origin.git(&["config", "user.name", "Test"]);
        origin
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn url(&self) -> String {
        format!("file://{}", self.dir.path().display())
    }

    /// Writes `content` at `rel` (creating parents), commits everything, and
    /// returns the new head hash.
    pub fn commit_file(&self, rel: &str, content: &str, message: &str) -> String {
        let full = self.dir.path().join(rel);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).expect("mkdir");
        }
        std::fs::write(&full, content).expect("write");

        self.git(&["add", "."]);
        self.git(&["commit", "-m", message]);
        self.head()
    }

    pub fn head(&self) -> String {
        let output = Command::new("git")
            .current_dir(self.dir.path())
            .args(["rev-parse", "HEAD"])
            .output()
            .expect("rev-parse");
        assert!(output.status.success());
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    fn git(&self, args: &[&str]) {
        let output = Command::new("git")
            .current_dir(self.dir.path())
            .args(args)
            .output()
            .expect("spawn git");
        assert!(
            output.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
}
