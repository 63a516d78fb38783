//! Delivery providers.
//!
//! A provider brings the cluster in line with an application's on-disk tree
//! (`deliver`) and removes its footprint (`uninstall`). Both operations are
//! idempotent on converged state. The variant is fixed at construction by the
//! content kind of the handled path: a chart directory delivers as a Helm
//! release, anything else as raw labelled resources.

pub mod error;
pub mod helm;
pub mod raw;

use std::path::Path;

pub use error::{DeliveryError, Result};
pub use helm::{HelmOptions, HelmProvider};
pub use raw::RawProvider;

use crate::gitops::Revision;

/// Whether `path` is a Helm chart directory.
pub fn is_chart_dir(path: &Path) -> bool {
    path.join("Chart.yaml").is_file()
}

/// The delivery backend bound to one application.
pub enum DeliveryProvider {
    Helm(HelmProvider),
    Raw(RawProvider),
}

impl DeliveryProvider {
    /// Builds the provider matching the content kind of `handled_path`.
    pub async fn for_path(
        app_name: &str,
        handled_path: &Path,
        namespace: &str,
        options: HelmOptions,
    ) -> Result<Self> {
        if is_chart_dir(handled_path) {
            Ok(Self::Helm(
                HelmProvider::new(
                    app_name.to_string(),
                    handled_path.to_path_buf(),
                    namespace.to_string(),
                    options,
                )
                .await?,
            ))
        } else {
            Ok(Self::Raw(
                RawProvider::new(
                    app_name.to_string(),
                    handled_path.to_path_buf(),
                    namespace.to_string(),
                )
                .await?,
            ))
        }
    }

    /// Brings the cluster state in line with the on-disk tree at `revision`.
    pub async fn deliver(&self, revision: &Revision) -> Result<()> {
        match self {
            Self::Helm(helm) => helm.deliver(revision).await,
            Self::Raw(raw) => raw.deliver(revision).await,
        }
    }

    /// Removes the application's cluster footprint.
    pub async fn uninstall(&self, revision: &Revision) -> Result<()> {
        match self {
            Self::Helm(helm) => helm.uninstall().await,
            Self::Raw(raw) => raw.uninstall(revision).await,
        }
    }

    /// Human-readable content kind for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Helm(_) => "helm release",
            Self::Raw(_) => "raw k8s resources",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn chart_dir_detection() {
        let dir = TempDir::new().unwrap();
        assert!(!is_chart_dir(dir.path()));

        std::fs::write(dir.path().join("Chart.yaml"), "name: demo\n").unwrap();
        assert!(is_chart_dir(dir.path()));
    }
}
