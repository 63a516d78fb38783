//! Git authentication handling.
//!
//! Authentication is resolved once per repository. When the remote is reached
//! over SSH, the private key from the repository's secret is materialized on
//! disk with owner-only permissions and exported to every git invocation via
//! `GIT_SSH_COMMAND`. Host keys are either checked against the known-hosts
//! file under the user's home or ignored entirely when the repository opts
//! into insecure verification.

use std::path::Path;

use secrecy::{ExposeSecret, SecretString};

use crate::gitops::error::{GitError, Result};

/// Environment applied to git invocations that reach the remote.
#[derive(Debug, Clone, Default)]
pub struct GitAuth {
    env: Vec<(String, String)>,
}

impl GitAuth {
    /// Environment variables to set on the git command.
    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }
}

/// Whether a repository URL should be treated as SSH.
///
/// An explicit `ssh://` scheme counts, and so does a URL with no scheme at
/// all (the scp-like `git@host:path` form does not parse as a URL).
pub fn is_ssh_url(url: &str) -> bool {
    url.starts_with("ssh://") || !url.contains("://")
}

/// Escapes a path for safe use inside a single-quoted shell word.
fn shell_escape(path: &str) -> String {
    format!("'{}'", path.replace('\'', "'\\''"))
}

/// Materializes `key` at `key_path` (mode 0600) and builds the SSH command
/// environment for git.
pub fn build_ssh_auth(
    key: &SecretString,
    key_path: &Path,
    known_hosts: &Path,
    insecure_ignore_host_key: bool,
) -> Result<GitAuth> {
    if let Some(parent) = key_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| GitError::Auth(format!("failed to create key directory: {e}")))?;
    }

    write_key_file(key_path, key.expose_secret().as_bytes())
        .map_err(|e| GitError::Auth(format!("failed to write key file: {e}")))?;

    let key_arg = shell_escape(&key_path.display().to_string());

    let ssh_command = if insecure_ignore_host_key {
        format!(
            "ssh -i {key_arg} -o IdentitiesOnly=yes \
             -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null"
        )
    } else {
        let hosts_arg = shell_escape(&known_hosts.display().to_string());
        format!(
            "ssh -i {key_arg} -o IdentitiesOnly=yes \
             -o StrictHostKeyChecking=yes -o UserKnownHostsFile={hosts_arg}"
        )
    };

    Ok(GitAuth {
        env: vec![
            ("GIT_SSH_COMMAND".to_string(), ssh_command),
            ("GIT_TERMINAL_PROMPT".to_string(), "0".to_string()),
        ],
    })
}

#[cfg(unix)]
fn write_key_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)
}

#[cfg(not(unix))]
fn write_key_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, data)
}
