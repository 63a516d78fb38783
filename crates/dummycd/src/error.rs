//! Engine-level error types.

use std::path::PathBuf;

use thiserror::Error;

use crate::cluster::SecretError;
use crate::gitops::GitError;
use crate::provider::DeliveryError;

/// Errors surfaced by the control plane and the reconciliation loop.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("repository already exists for url '{url}'")]
    RepositoryAlreadyExists { url: String },

    #[error("repository config not found: {0}")]
    RepositoryConfigNotFound(String),

    #[error("application not found: {0}")]
    ApplicationNotFound(String),

    /// Soft signal: nothing needed to change. Callers log at debug and
    /// treat the operation as a success.
    #[error("already up to date")]
    AlreadyUpToDate,

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error("storage operation failed for '{path}': {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
