//! Git-specific error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during git operations.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("git {op} failed: {message}")]
    Command { op: &'static str, message: String },

    #[error("failed to spawn git: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("not a git repository: {0}")]
    NotARepository(PathBuf),

    #[error("reference '{reference}' not found")]
    ReferenceNotFound { reference: String },

    #[error("unexpected: no commit on '{reference}' touches '{path}'")]
    EmptyHistory { reference: String, path: String },

    #[error("git authentication setup failed: {0}")]
    Auth(String),
}

/// Result type for git operations.
pub type Result<T> = std::result::Result<T, GitError>;
