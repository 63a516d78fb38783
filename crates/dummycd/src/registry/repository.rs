//! Repository configs and their applications.

use std::path::Path;
use std::sync::Arc;

use log::{debug, error};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use super::application::{Application, ApplicationDecl};
use super::EngineEnv;
use crate::error::{EngineError, Result};
use crate::gitops::{build_ssh_auth, is_ssh_url, GitAuth};
use crate::paths;

/// The user-declared shape of a repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositorySettings {
    pub url: String,
    #[serde(default)]
    pub private_key_secret: String,
    #[serde(default)]
    pub insecure_ignore_host_key: bool,
}

/// A declared repository and the applications it owns.
pub struct RepositoryConfig {
    name: String,
    settings: RepositorySettings,
    auth: Option<GitAuth>,
    pub(crate) apps: Mutex<Vec<Arc<Application>>>,
}

impl RepositoryConfig {
    /// Builds the repository, resolving git authentication eagerly: an SSH
    /// URL (explicit scheme or scp-like form) reads the private key from the
    /// secret store and materializes it for `GIT_SSH_COMMAND`.
    pub fn new(name: String, settings: RepositorySettings, env: &EngineEnv) -> Result<Self> {
        let auth = if is_ssh_url(&settings.url) {
            let key = env.secrets.ssh_private_key(&settings.private_key_secret)?;
            let key_path = paths::ssh_key_dir_at(&env.workspace).join(format!("{name}.key"));
            let known_hosts = paths::known_hosts_path_at(&env.home);

            Some(build_ssh_auth(
                &key,
                &key_path,
                &known_hosts,
                settings.insecure_ignore_host_key,
            )?)
        } else {
            None
        };

        Ok(Self {
            name,
            settings,
            auth,
            apps: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.settings.url
    }

    pub fn settings(&self) -> &RepositorySettings {
        &self.settings
    }

    /// Adds the application, or rebuilds it when the declaration changed.
    /// An unchanged declaration is reported as [`EngineError::AlreadyUpToDate`].
    pub async fn add_or_update_application(
        &self,
        decl: ApplicationDecl,
        workspace: &Path,
    ) -> Result<()> {
        let mut apps = self.apps.lock().await;

        let Some(index) = apps.iter().position(|app| app.name() == decl.name) else {
            let app = Application::new(decl, self.auth.clone(), workspace).await?;
            apps.push(app);
            return Ok(());
        };

        if apps[index].matches(&decl) {
            return Err(EngineError::AlreadyUpToDate);
        }

        // Changed shape: tear down the storage directory and rebuild. The
        // state lock waits out any in-flight reconciliation pass first.
        {
            let app = &apps[index];
            let _state = app.state.lock().await;

            if let Err(source) = std::fs::remove_dir_all(app.storage_path()) {
                if source.kind() != std::io::ErrorKind::NotFound {
                    return Err(EngineError::Storage {
                        path: app.storage_path().to_path_buf(),
                        source,
                    });
                }
            }
        }

        apps[index] = Application::new(decl, self.auth.clone(), workspace).await?;
        Ok(())
    }

    /// Uninstalls and removes the application. Removing an application that
    /// does not exist is a no-op: the callers are level-triggered controllers.
    pub async fn delete_application(&self, name: &str) -> Result<()> {
        let mut apps = self.apps.lock().await;

        let Some(index) = apps.iter().position(|app| app.name() == name) else {
            return Ok(());
        };

        let app = Arc::clone(&apps[index]);
        {
            let state = app.state.lock().await;
            if let Err(e) = app.uninstall(&state).await {
                // The entry is removed regardless; the next declaration
                // rebuilds from scratch.
                error!("{}: uninstall failed: {e}", app.name());
            }
        }

        apps.swap_remove(index);
        Ok(())
    }

    /// Uninstalls every application concurrently and empties the list. One
    /// task per application, each blocking on the application mutex.
    pub async fn uninstall_all(&self) {
        let mut apps = self.apps.lock().await;

        let mut tasks = JoinSet::new();
        for app in apps.iter().cloned() {
            tasks.spawn(async move {
                let state = app.state.lock().await;
                if let Err(e) = app.uninstall(&state).await {
                    error!("{}: uninstall failed: {e}", app.name());
                }
            });
        }

        debug!("{}: waiting for all applications uninstall", self.name);
        while tasks.join_next().await.is_some() {}

        apps.clear();
    }

    pub async fn get_application(&self, name: &str) -> Option<Arc<Application>> {
        self.apps
            .lock()
            .await
            .iter()
            .find(|app| app.name() == name)
            .cloned()
    }

    /// Snapshot of the owned applications.
    pub async fn applications(&self) -> Vec<Arc<Application>> {
        self.apps.lock().await.clone()
    }
}
