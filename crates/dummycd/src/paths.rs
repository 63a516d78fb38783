//! Well-known filesystem locations.
//!
//! The `_at` variants accept an explicit `home`/`workspace` root so tests can
//! run against a `TempDir` without ever touching the real home directory.

use std::path::{Path, PathBuf};

/// Returns `<home>/.dummycd/storage`, the root of all application worktrees.
pub fn workspace_dir_at(home: &Path) -> PathBuf {
    home.join(".dummycd").join("storage")
}

/// Returns `<home>/.ssh/knownhosts`, consulted for strict host-key checks.
pub fn known_hosts_path_at(home: &Path) -> PathBuf {
    home.join(".ssh").join("knownhosts")
}

/// Returns the directory holding materialized repository SSH keys.
pub fn ssh_key_dir_at(workspace: &Path) -> PathBuf {
    workspace.join(".ssh")
}

/// Returns the storage directory owned by a single application.
pub fn app_storage_path(workspace: &Path, app_name: &str) -> PathBuf {
    workspace.join(app_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_is_under_dot_dummycd() {
        let dir = workspace_dir_at(Path::new("/home/me"));
        assert_eq!(dir, PathBuf::from("/home/me/.dummycd/storage"));
    }

    #[test]
    fn app_storage_is_per_name() {
        let workspace = Path::new("/w");
        assert_eq!(
            app_storage_path(workspace, "billing"),
            PathBuf::from("/w/billing")
        );
    }

    #[test]
    fn known_hosts_under_home_ssh() {
        assert_eq!(
            known_hosts_path_at(Path::new("/home/me")),
            PathBuf::from("/home/me/.ssh/knownhosts")
        );
    }
}
