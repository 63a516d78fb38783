//! Delivery-specific error types.

use std::path::PathBuf;

use thiserror::Error;

use crate::cluster::KubectlError;

/// Errors from the delivery providers.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("helm {action} failed: {message}")]
    Helm { action: &'static str, message: String },

    #[error("failed to spawn helm: {0}")]
    Spawn(#[source] std::io::Error),

    #[error(transparent)]
    Kubectl(#[from] KubectlError),

    #[error("no resource file found under '{0}'")]
    NoManifests(PathBuf),

    #[error("failed to read values file '{path}': {source}")]
    ReadValues {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse values file '{path}': {message}")]
    ParseValues { path: PathBuf, message: String },

    #[error("failed to parse helm output: {0}")]
    ParseOutput(String),
}

/// Result type for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;
