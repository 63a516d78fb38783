//! Registry of repositories and applications.
//!
//! Lock hierarchy, strictly ordered:
//!
//! ```text
//! Registry mutex ⊐ Repository mutex ⊐ Application mutex ⊐ Provider mutex
//! ```
//!
//! Control-plane operations acquire from the top down and block. The
//! scheduler acquires opportunistically (try-lock only) and skips on
//! contention. A task holding a lower mutex never acquires a higher one.

pub mod application;
pub mod repository;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

pub use application::{Application, ApplicationDecl, LifecycleState};
pub use repository::{RepositoryConfig, RepositorySettings};

use crate::cluster::SecretStore;
use crate::error::{EngineError, Result};

/// Shared engine environment; read-only after construction.
pub struct EngineEnv {
    /// Root of all application worktrees.
    pub workspace: PathBuf,
    /// User home, for the known-hosts file.
    pub home: PathBuf,
    /// The engine's own namespace (where repository secrets live).
    pub namespace: String,
    /// Repository credential source.
    pub secrets: Arc<dyn SecretStore>,
}

/// Mutable store of repositories. URL is the true repository key: no two
/// live repositories share one.
pub struct Registry {
    pub(crate) repos: Mutex<Vec<Arc<RepositoryConfig>>>,
    env: EngineEnv,
}

impl Registry {
    pub fn new(env: EngineEnv) -> Self {
        Self {
            repos: Mutex::new(Vec::new()),
            env,
        }
    }

    pub fn env(&self) -> &EngineEnv {
        &self.env
    }

    /// Adds a repository. Git authentication material is built eagerly
    /// during this call.
    pub async fn add_repository(&self, name: &str, settings: RepositorySettings) -> Result<()> {
        let mut repos = self.repos.lock().await;

        if repos.iter().any(|repo| repo.url() == settings.url) {
            return Err(EngineError::RepositoryAlreadyExists { url: settings.url });
        }

        let repo = RepositoryConfig::new(name.to_string(), settings, &self.env)?;
        repos.push(Arc::new(repo));
        Ok(())
    }

    /// Uninstalls every owned application, then drops the repository.
    /// Order of the remaining entries is not preserved.
    pub async fn delete_repository(&self, name: &str) -> Result<()> {
        let mut repos = self.repos.lock().await;

        let Some(index) = repos.iter().position(|repo| repo.name() == name) else {
            return Err(EngineError::RepositoryConfigNotFound(name.to_string()));
        };

        repos[index].uninstall_all().await;
        repos.swap_remove(index);
        Ok(())
    }

    /// Linear scan by URL. Callers must hold no application mutex.
    pub async fn get_repository_config(&self, url: &str) -> Option<Arc<RepositoryConfig>> {
        self.repos
            .lock()
            .await
            .iter()
            .find(|repo| repo.url() == url)
            .cloned()
    }

    /// Linear scan across all repositories.
    pub async fn get_application(&self, name: &str, url: &str) -> Option<Arc<Application>> {
        let repos = self.repos.lock().await.clone();
        for repo in repos {
            if repo.url() != url {
                continue;
            }
            if let Some(app) = repo.get_application(name).await {
                return Some(app);
            }
        }
        None
    }

    /// Routes the declaration to the repository owning its URL.
    pub async fn add_or_update_application(&self, decl: ApplicationDecl) -> Result<()> {
        let Some(repo) = self.get_repository_config(&decl.url).await else {
            return Err(EngineError::RepositoryConfigNotFound(decl.url));
        };

        repo.add_or_update_application(decl, &self.env.workspace)
            .await
    }

    /// Removes the application from the repository owning `url`. Unknown
    /// URLs and names are no-ops for the level-triggered callers.
    pub async fn delete_application(&self, name: &str, url: &str) -> Result<()> {
        match self.get_repository_config(url).await {
            Some(repo) => repo.delete_application(name).await,
            None => Ok(()),
        }
    }

    /// Snapshot of every application across all repositories.
    pub async fn applications(&self) -> Vec<Arc<Application>> {
        let repos = self.repos.lock().await.clone();

        let mut all = Vec::new();
        for repo in repos {
            all.extend(repo.applications().await);
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use secrecy::SecretString;
    use tempfile::TempDir;

    use crate::cluster::secrets::{SecretError, SecretStore};

    /// Counts lookups; returns a fixed key.
    struct CountingStore {
        calls: AtomicUsize,
    }

    impl CountingStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl SecretStore for CountingStore {
        fn ssh_private_key(
            &self,
            _secret_name: &str,
        ) -> std::result::Result<SecretString, SecretError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(SecretString::from("fake-key-material".to_string()))
        }
    }

    fn registry(store: Arc<CountingStore>, dir: &TempDir) -> Registry {
        Registry::new(EngineEnv {
            workspace: dir.path().join("storage"),
            home: dir.path().to_path_buf(),
            namespace: "dummycd".to_string(),
            secrets: store,
        })
    }

    fn https_settings(url: &str) -> RepositorySettings {
        RepositorySettings {
            url: url.to_string(),
            private_key_secret: String::new(),
            insecure_ignore_host_key: false,
        }
    }

    #[tokio::test]
    async fn url_uniqueness_is_enforced() {
        let dir = TempDir::new().unwrap();
        let reg = registry(CountingStore::new(), &dir);

        reg.add_repository("r1", https_settings("https://h/r.git"))
            .await
            .unwrap();

        let err = reg
            .add_repository("r2", https_settings("https://h/r.git"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RepositoryAlreadyExists { .. }));

        // Different URL is fine even under the same name.
        reg.add_repository("r1", https_settings("https://h/other.git"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn delete_missing_repository_fails() {
        let dir = TempDir::new().unwrap();
        let reg = registry(CountingStore::new(), &dir);

        let err = reg.delete_repository("ghost").await.unwrap_err();
        assert!(matches!(err, EngineError::RepositoryConfigNotFound(_)));
    }

    #[tokio::test]
    async fn deleted_repository_vanishes() {
        let dir = TempDir::new().unwrap();
        let reg = registry(CountingStore::new(), &dir);

        reg.add_repository("r", https_settings("https://h/r.git"))
            .await
            .unwrap();
        assert!(reg.get_repository_config("https://h/r.git").await.is_some());

        reg.delete_repository("r").await.unwrap();
        assert!(reg.get_repository_config("https://h/r.git").await.is_none());
    }

    #[tokio::test]
    async fn non_ssh_urls_never_touch_the_secret_store() {
        let dir = TempDir::new().unwrap();
        let store = CountingStore::new();
        let reg = registry(Arc::clone(&store), &dir);

        reg.add_repository("r", https_settings("https://h/r.git"))
            .await
            .unwrap();
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ssh_urls_build_auth_eagerly() {
        let dir = TempDir::new().unwrap();
        let store = CountingStore::new();
        let reg = registry(Arc::clone(&store), &dir);

        reg.add_repository(
            "r",
            RepositorySettings {
                url: "ssh://git@h/r.git".to_string(),
                private_key_secret: "repo-key".to_string(),
                insecure_ignore_host_key: true,
            },
        )
        .await
        .unwrap();

        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
        assert!(dir.path().join("storage/.ssh/r.key").is_file());
    }

    #[tokio::test]
    async fn application_update_on_unknown_repository_fails() {
        let dir = TempDir::new().unwrap();
        let reg = registry(CountingStore::new(), &dir);

        let err = reg
            .add_or_update_application(ApplicationDecl {
                name: "a".to_string(),
                url: "https://h/unknown.git".to_string(),
                namespace: "ns".to_string(),
                reference: "main".to_string(),
                sparse_path: String::new(),
                helm: Default::default(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RepositoryConfigNotFound(_)));
    }

    #[tokio::test]
    async fn delete_application_is_idempotent_for_unknown_urls() {
        let dir = TempDir::new().unwrap();
        let reg = registry(CountingStore::new(), &dir);

        reg.delete_application("a", "https://h/unknown.git")
            .await
            .unwrap();
    }
}
