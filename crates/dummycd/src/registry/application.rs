//! Per-application reconciliation.
//!
//! An application couples one subtree of one repository at one reference with
//! one delivery provider. Its lifecycle state (the currently delivered
//! revision) lives behind the application-tier mutex; holding that mutex is
//! what guarantees at most one reconciliation pass per application at a time.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{EngineError, Result};
use crate::gitops::{FetchOutcome, GitAuth, GitWorktree, PullOutcome, Revision, RevisionEntry};
use crate::paths;
use crate::provider::{DeliveryProvider, HelmOptions};

/// The user-declared shape of an application. Structural equality of two
/// declarations (and nothing else: not the delivered revision, not provider
/// internals) decides whether an update is a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationDecl {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub namespace: String,
    pub reference: String,
    #[serde(default)]
    pub sparse_path: String,
    #[serde(default)]
    pub helm: HelmOptions,
}

impl ApplicationDecl {
    /// An empty namespace means the `default` namespace.
    fn normalized(mut self) -> Self {
        if self.namespace.is_empty() {
            self.namespace = "default".to_string();
        }
        self
    }
}

/// Mutable reconciliation state, guarded by the application mutex.
#[derive(Debug, Default)]
pub struct LifecycleState {
    pub current_revision: Revision,
}

/// One unit of delivery: worktree + provider + lifecycle state.
pub struct Application {
    decl: ApplicationDecl,
    storage_path: PathBuf,
    worktree: GitWorktree,
    provider: DeliveryProvider,
    pub(crate) state: Arc<Mutex<LifecycleState>>,
}

impl Application {
    /// Clones (or opens) the repository under `<workspace>/<name>` with a
    /// sparse checkout of the declared path, then binds the delivery provider
    /// matching the content kind.
    pub async fn new(
        decl: ApplicationDecl,
        auth: Option<GitAuth>,
        workspace: &Path,
    ) -> Result<Arc<Self>> {
        let decl = decl.normalized();

        let storage_path = paths::app_storage_path(workspace, &decl.name);
        let handled_path = storage_path.join(&decl.sparse_path);

        let worktree = GitWorktree::clone_or_open(
            storage_path.clone(),
            decl.url.clone(),
            decl.reference.clone(),
            decl.sparse_path.clone(),
            auth,
        )
        .await?;

        let provider =
            DeliveryProvider::for_path(&decl.name, &handled_path, &decl.namespace, decl.helm.clone())
                .await?;

        info!("{}: delivery as {}", decl.name, provider.kind());

        Ok(Arc::new(Self {
            decl,
            storage_path,
            worktree,
            provider,
            state: Arc::new(Mutex::new(LifecycleState::default())),
        }))
    }

    pub fn name(&self) -> &str {
        &self.decl.name
    }

    pub fn url(&self) -> &str {
        &self.decl.url
    }

    pub fn decl(&self) -> &ApplicationDecl {
        &self.decl
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    /// Whether `decl` declares the same shape as this application.
    pub fn matches(&self, decl: &ApplicationDecl) -> bool {
        self.decl == decl.clone().normalized()
    }

    /// The currently delivered revision. Blocks while a reconciliation pass
    /// holds the state.
    pub async fn current_revision(&self) -> Revision {
        self.state.lock().await.current_revision.clone()
    }

    /// One reconciliation pass. The caller must hold the application mutex
    /// and pass in the guarded state.
    ///
    /// fetch → read refs → align worktree → checkout → compute head →
    /// skip-or-deliver, per the delivery state machine. `AlreadyUpToDate`
    /// outcomes short-circuit: a fetch with nothing new re-runs delivery to
    /// reconcile cluster drift once a revision has been delivered before.
    pub async fn run_lifecycle(&self, state: &mut LifecycleState) -> Result<()> {
        match self.worktree.fetch().await {
            Ok(FetchOutcome::AlreadyUpToDate) if !state.current_revision.is_zero() => {
                // Nothing new upstream; re-deliver to converge cluster drift.
                self.provider.deliver(&state.current_revision).await?;
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => return Err(e.into()),
        }

        debug!("{}: updates fetched, starting update repository", self.name());

        let local = self.worktree.local_hash()?;
        let remote = self.worktree.remote_hash()?;

        if local != remote {
            debug!("{}: local and remote hash are different", self.name());
            self.worktree.reset_hard(&remote).await?;
            debug!("{}: git hard reset done", self.name());
        } else {
            self.worktree.checkout().await?;

            match self.worktree.pull().await? {
                PullOutcome::AlreadyUpToDate if !state.current_revision.is_zero() => {
                    debug!("{}: already up to date", self.name());
                    return Ok(());
                }
                _ => {}
            }

            debug!("{}: pulled updates", self.name());
        }

        // Guards against a partially applied align step.
        self.worktree.checkout().await?;

        let head = self.worktree.head_revision()?;

        if head == state.current_revision {
            debug!("{}: already up to date", self.name());
            return Ok(());
        }

        state.current_revision = head;
        debug!(
            "{}: done update repository, revision {}",
            self.name(),
            state.current_revision
        );

        self.provider.deliver(&state.current_revision).await?;
        Ok(())
    }

    /// Removes the cluster footprint, then the storage directory. The caller
    /// must hold the application mutex.
    pub async fn uninstall(&self, state: &LifecycleState) -> Result<()> {
        self.provider.uninstall(&state.current_revision).await?;

        if let Err(source) = std::fs::remove_dir_all(&self.storage_path) {
            if source.kind() != std::io::ErrorKind::NotFound {
                return Err(EngineError::Storage {
                    path: self.storage_path.clone(),
                    source,
                });
            }
        }

        Ok(())
    }

    /// Path-filtered revision history for the control surface.
    pub fn revision_history(&self) -> Result<Vec<RevisionEntry>> {
        Ok(self.worktree.revision_history()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl(name: &str) -> ApplicationDecl {
        ApplicationDecl {
            name: name.to_string(),
            url: "file:///origin/repo".to_string(),
            namespace: "apps".to_string(),
            reference: "main".to_string(),
            sparse_path: "deploy".to_string(),
            helm: HelmOptions::default(),
        }
    }

    #[test]
    fn empty_namespace_normalizes_to_default() {
        let mut d = decl("a");
        d.namespace = String::new();
        assert_eq!(d.normalized().namespace, "default");
    }

    #[test]
    fn declared_shape_equality_ignores_nothing_declared() {
        let a = decl("a");
        let mut b = decl("a");
        assert_eq!(a, b.clone());

        b.sparse_path = "other".to_string();
        assert_ne!(a, b);

        let mut c = decl("a");
        c.helm.values_files.push("values-prod.yaml".to_string());
        assert_ne!(a, c);
    }

    #[test]
    fn decl_wire_shape() {
        let json = r#"{
            "name": "a",
            "url": "ssh://git@h/r.git",
            "namespace": "ns",
            "reference": "main",
            "sparsePath": "deploy",
            "helm": {"checkValuesEqual": true}
        }"#;
        let d: ApplicationDecl = serde_json::from_str(json).unwrap();
        assert_eq!(d.sparse_path, "deploy");
        assert!(d.helm.check_values_equal);
    }
}
