//! Raw manifest delivery provider.
//!
//! Applies every `.yaml`/`.yml` file under the application's sparse directory
//! as a single-document Kubernetes object. Managed objects carry two labels:
//! `dummy.cd/app` (stable identity) and `dummy.cd/revision` (generation).
//! These labels are the sole basis for pruning: after an apply pass, every
//! object bearing the app label but a stale revision label is deleted.
//! Resource records live for one delivery call and are re-read from disk
//! every time.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error, warn};
use serde_json::{json, Value};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use walkdir::WalkDir;

use super::error::{DeliveryError, Result};
use crate::cluster::Kubectl;
use crate::gitops::Revision;

/// Stable identity label.
pub const APP_LABEL: &str = "dummy.cd/app";
/// Generation label, rewritten on every successful delivery.
pub const REVISION_LABEL: &str = "dummy.cd/revision";

/// Concurrent resource sweeps during a prune pass.
const PRUNE_CONCURRENCY: usize = 10;

/// One parsed manifest file.
#[derive(Debug, Clone)]
struct ManifestResource {
    file: PathBuf,
    object: Value,
}

/// Label-scoped apply + prune delivery for one application.
pub struct RawProvider {
    app_name: String,
    resource_path: PathBuf,
    namespace: String,
    kubectl: Kubectl,
    prune_lock: Arc<Mutex<()>>,
}

impl RawProvider {
    /// Ensures the target namespace exists and validates that the sparse
    /// directory holds at least one usable manifest.
    pub async fn new(app_name: String, resource_path: PathBuf, namespace: String) -> Result<Self> {
        let kubectl = Kubectl;
        kubectl.ensure_namespace(&namespace).await?;

        let provider = Self {
            app_name,
            resource_path,
            namespace,
            kubectl,
            prune_lock: Arc::new(Mutex::new(())),
        };

        if provider.load_resources().is_empty() {
            return Err(DeliveryError::NoManifests(provider.resource_path));
        }

        Ok(provider)
    }

    /// Applies every manifest in parallel, then kicks off an asynchronous
    /// prune pass unless one is already in flight.
    pub async fn deliver(&self, revision: &Revision) -> Result<()> {
        let resources = self.load_resources();

        let mut tasks = JoinSet::new();
        for resource in resources {
            let object = self.stamped(&resource.object, revision);
            let kubectl = self.kubectl;
            let app_name = self.app_name.clone();
            let revision = revision.clone();
            let file = resource.file.clone();

            tasks.spawn(async move {
                apply_object(kubectl, &app_name, &revision, &file, object).await;
            });
        }
        while tasks.join_next().await.is_some() {}

        debug!("{}: done apply resources", self.app_name);

        match Arc::clone(&self.prune_lock).try_lock_owned() {
            Ok(guard) => {
                let kubectl = self.kubectl;
                let app_name = self.app_name.clone();
                let namespace = self.namespace.clone();
                let revision = revision.clone();

                tokio::spawn(async move {
                    let _guard = guard;
                    match prune(kubectl, &app_name, &namespace, &revision, false).await {
                        Ok(()) => debug!("{app_name}: cleanup task is done"),
                        Err(e) => debug!("{app_name}: cleanup failed: {e}"),
                    }
                });
            }
            Err(_) => {
                debug!("{}: skip running cleanup, task already in process", self.app_name);
            }
        }

        Ok(())
    }

    /// Deletes everything labelled with this application's identity,
    /// regardless of revision.
    pub async fn uninstall(&self, revision: &Revision) -> Result<()> {
        let _guard = self.prune_lock.lock().await;
        prune(
            self.kubectl,
            &self.app_name,
            &self.namespace,
            revision,
            true,
        )
        .await
    }

    /// All `.yaml`/`.yml` files under the sparse directory, recursively.
    fn manifest_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = WalkDir::new(&self.resource_path)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| {
                matches!(
                    path.extension().and_then(|ext| ext.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .collect();
        files.sort();
        files
    }

    /// Parses the manifest files. Empty documents and parse failures are
    /// skipped with a log; they never fail the pass.
    fn load_resources(&self) -> Vec<ManifestResource> {
        let mut resources = Vec::new();

        for file in self.manifest_files() {
            let contents = match std::fs::read_to_string(&file) {
                Ok(contents) => contents,
                Err(e) => {
                    warn!("{}: skipping unreadable {}: {e}", self.app_name, file.display());
                    continue;
                }
            };

            let object: Value = match serde_yaml::from_str(&contents) {
                Ok(object) => object,
                Err(e) => {
                    warn!("{}: skipping unparsable {}: {e}", self.app_name, file.display());
                    continue;
                }
            };

            if !is_usable_manifest(&object) {
                warn!(
                    "{}: empty or incomplete resource found, skipping {}",
                    self.app_name,
                    file.display()
                );
                continue;
            }

            resources.push(ManifestResource { file, object });
        }

        resources
    }

    /// Returns a copy of `object` carrying the engine labels and the target
    /// namespace. Labels declared in the manifest are preserved; the engine's
    /// two labels overwrite any manifest values.
    fn stamped(&self, object: &Value, revision: &Revision) -> Value {
        let mut object = object.clone();

        object["metadata"]["namespace"] = json!(self.namespace);

        let labels = &mut object["metadata"]["labels"];
        if !labels.is_object() {
            *labels = json!({});
        }
        labels[APP_LABEL] = json!(self.app_name);
        labels[REVISION_LABEL] = json!(revision.as_str());

        object
    }
}

/// Whether a parsed document can be applied at all.
fn is_usable_manifest(object: &Value) -> bool {
    object.is_object()
        && object["apiVersion"].is_string()
        && object["kind"].is_string()
        && object["metadata"]["name"].is_string()
}

/// Label selector for a prune pass. `clean_all` drops the revision clause.
fn prune_selector(app_name: &str, revision: &Revision, clean_all: bool) -> String {
    if clean_all {
        format!("{APP_LABEL}={app_name}")
    } else {
        format!(
            "{APP_LABEL}={app_name},{REVISION_LABEL}!={}",
            revision.as_str()
        )
    }
}

/// Creates or updates one object. Failures are logged and skipped; the
/// delivery pass itself never fails on a single object.
async fn apply_object(
    kubectl: Kubectl,
    app_name: &str,
    revision: &Revision,
    file: &Path,
    object: Value,
) {
    let display = object_display(&object);

    let remote = match kubectl.get_object(&object).await {
        Ok(remote) => remote,
        Err(e) => {
            error!("{app_name}: {e}: {}", file.display());
            return;
        }
    };

    let Some(remote) = remote else {
        match kubectl.create_object(&object).await {
            Ok(()) => debug!("{app_name}: resource created {display}"),
            Err(e) => error!("{app_name}: {e}: {}", file.display()),
        }
        return;
    };

    let Some(remote_revision) = remote["metadata"]["labels"][REVISION_LABEL].as_str() else {
        error!("{app_name}: label {REVISION_LABEL} not exist on {display}");
        return;
    };

    if remote_revision == revision.as_str() {
        debug!("{app_name}: revision already applied for {display}");
        return;
    }

    let mut object = object;
    object["metadata"]["resourceVersion"] = remote["metadata"]["resourceVersion"].clone();

    match kubectl.replace_object(&object).await {
        Ok(()) => debug!("{app_name}: resource updated {display}"),
        Err(e) => error!("{app_name}: error while updating {display}: {e}"),
    }
}

/// Deletes every object in the namespace bearing the app label but not the
/// current revision label (`clean_all` deletes regardless of revision).
/// A zero revision means nothing was ever delivered under these labels.
async fn prune(
    kubectl: Kubectl,
    app_name: &str,
    namespace: &str,
    revision: &Revision,
    clean_all: bool,
) -> Result<()> {
    if revision.is_zero() {
        return Ok(());
    }

    let selector = prune_selector(app_name, revision, clean_all);
    let resources = kubectl.api_resources().await?;

    let semaphore = Arc::new(Semaphore::new(PRUNE_CONCURRENCY));
    let mut tasks = JoinSet::new();

    for resource in resources {
        let permit = Arc::clone(&semaphore)
            .acquire_owned()
            .await
            .expect("prune semaphore closed");
        let selector = selector.clone();
        let namespace = namespace.to_string();
        let app_name = app_name.to_string();

        tasks.spawn(async move {
            let _permit = permit;

            let names = match kubectl.list_names(&resource, &namespace, &selector).await {
                Ok(names) => names,
                Err(e) => {
                    debug!("{app_name}: {resource}: {e}");
                    return;
                }
            };

            for name in names {
                match kubectl.delete_foreground(&resource, &namespace, &name).await {
                    Ok(()) => debug!("{app_name}: deleted {resource}/{name}"),
                    Err(e) => debug!("{app_name}: error deleting {resource}/{name}: {e}"),
                }
            }
        });
    }

    while tasks.join_next().await.is_some() {}
    Ok(())
}

fn object_display(object: &Value) -> String {
    format!(
        "{}/{}",
        object["kind"].as_str().unwrap_or("<unknown>"),
        object["metadata"]["name"].as_str().unwrap_or("<unnamed>")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn provider(path: &Path) -> RawProvider {
        RawProvider {
            app_name: "demo".to_string(),
            resource_path: path.to_path_buf(),
            namespace: "apps".to_string(),
            kubectl: Kubectl,
            prune_lock: Arc::new(Mutex::new(())),
        }
    }

    #[test]
    fn discovers_nested_yaml_files_only() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.yaml"), "kind: ConfigMap").unwrap();
        std::fs::write(dir.path().join("sub/b.yml"), "kind: Secret").unwrap();
        std::fs::write(dir.path().join("README.md"), "docs").unwrap();

        let files = provider(dir.path()).manifest_files();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| {
            matches!(
                f.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
        }));
    }

    #[test]
    fn skips_empty_and_broken_manifests() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("empty.yaml"), "").unwrap();
        std::fs::write(dir.path().join("broken.yaml"), ": not yaml: [").unwrap();
        std::fs::write(dir.path().join("incomplete.yaml"), "kind: ConfigMap\n").unwrap();
        std::fs::write(
            dir.path().join("good.yaml"),
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm-a\n",
        )
        .unwrap();

        let resources = provider(dir.path()).load_resources();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].object["metadata"]["name"], "cm-a");
    }

    #[test]
    fn stamping_sets_labels_and_namespace_preserving_existing() {
        let dir = TempDir::new().unwrap();
        let p = provider(dir.path());
        let object: Value = serde_yaml::from_str(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm-a\n  labels:\n    team: billing\n",
        )
        .unwrap();

        let revision = Revision::from("abc123".to_string());
        let stamped = p.stamped(&object, &revision);

        assert_eq!(stamped["metadata"]["namespace"], "apps");
        assert_eq!(stamped["metadata"]["labels"][APP_LABEL], "demo");
        assert_eq!(stamped["metadata"]["labels"][REVISION_LABEL], "abc123");
        assert_eq!(stamped["metadata"]["labels"]["team"], "billing");
    }

    #[test]
    fn prune_selector_shapes() {
        let revision = Revision::from("abc".to_string());
        assert_eq!(
            prune_selector("demo", &revision, false),
            "dummy.cd/app=demo,dummy.cd/revision!=abc"
        );
        assert_eq!(prune_selector("demo", &revision, true), "dummy.cd/app=demo");
    }

    #[test]
    fn usable_manifest_requires_identity() {
        let good: Value = serde_yaml::from_str(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: x\n",
        )
        .unwrap();
        assert!(is_usable_manifest(&good));

        let no_name: Value = serde_yaml::from_str("apiVersion: v1\nkind: ConfigMap\n").unwrap();
        assert!(!is_usable_manifest(&no_name));

        assert!(!is_usable_manifest(&Value::Null));
    }

    #[tokio::test]
    async fn prune_is_a_noop_for_zero_revision() {
        // Would need a live cluster otherwise; the zero guard returns first.
        prune(Kubectl, "demo", "apps", &Revision::zero(), true)
            .await
            .unwrap();
    }
}
