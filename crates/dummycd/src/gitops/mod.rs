//! Git façade for the repository worker.
//!
//! All repository access goes through the `git` CLI: long-running network
//! operations use `tokio::process` with authentication injected through the
//! environment, short local queries use `std::process`. Worktrees are
//! sparse-checkout restricted to the application's sparse path, which bounds
//! every materialization and reset to that subtree.

pub mod auth;
pub mod error;
mod parse;
pub mod worktree;

pub use auth::{build_ssh_auth, is_ssh_url, GitAuth};
pub use error::{GitError, Result};
pub use worktree::{FetchOutcome, GitWorktree, PullOutcome, Revision, RevisionEntry};
