//! Helm delivery provider.
//!
//! Wraps the `helm` CLI. The release description carries the delivered
//! revision hash and is the provider's drift marker: a release whose
//! description matches the application's current revision needs no action.
//! All actions run with a fixed 360-second timeout.

use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::time::Duration;

use log::{debug, info};
use serde::Deserialize;
use tokio::process::Command;

use super::error::{DeliveryError, Result};
use crate::gitops::Revision;

const ACTION_TIMEOUT: Duration = Duration::from_secs(360);

/// User-declared Helm behavior for one application.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HelmOptions {
    /// Skip the upgrade when the released values deep-equal the merged
    /// value files.
    pub check_values_equal: bool,
    /// Uninstall and reinstall instead of upgrading.
    pub re_install_release: bool,
    /// Create the target namespace on install.
    pub create_namespace: bool,
    /// Roll back automatically on a failed action.
    pub atomic: bool,
    /// Include CRDs in install/upgrade.
    #[serde(rename = "includeCRDs")]
    pub include_crds: bool,
    /// Value files, relative to the chart directory.
    pub values_files: Vec<String>,
}

/// One entry of `helm list -o json`.
#[derive(Debug, Deserialize)]
struct ReleaseListItem {
    name: String,
}

/// Relevant slice of `helm status -o json`.
#[derive(Debug, Deserialize)]
struct ReleaseStatus {
    info: ReleaseInfo,
}

#[derive(Debug, Deserialize)]
struct ReleaseInfo {
    #[serde(default)]
    description: String,
}

/// Helm release lifecycle for one application.
pub struct HelmProvider {
    release_name: String,
    chart_path: PathBuf,
    namespace: String,
    options: HelmOptions,
    value_files: Vec<PathBuf>,
}

impl HelmProvider {
    pub async fn new(
        release_name: String,
        chart_path: PathBuf,
        namespace: String,
        options: HelmOptions,
    ) -> Result<Self> {
        let value_files = options
            .values_files
            .iter()
            .map(|file| chart_path.join(file))
            .collect();

        let provider = Self {
            release_name,
            chart_path,
            namespace,
            options,
            value_files,
        };

        provider.update_dependencies().await?;
        Ok(provider)
    }

    /// Install, upgrade, reinstall or skip, depending on what the cluster
    /// already holds for this release.
    pub async fn deliver(&self, revision: &Revision) -> Result<()> {
        let current = self.current_release().await?;
        self.update_dependencies().await?;

        let Some(current) = current else {
            self.install(revision).await?;
            info!("{}: {} delivered", self.release_name, revision);
            return Ok(());
        };

        let deployed = self.deployed_description().await?;
        if deployed.as_deref() == Some(revision.as_str()) {
            debug!(
                "{}: release already at {}, skip delivery",
                current.name, revision
            );
            return Ok(());
        }

        if self.options.check_values_equal {
            let wanted = self.merged_values()?;
            let deployed_values = self.deployed_values().await?;
            if values_equal(&deployed_values, &wanted) {
                debug!(
                    "{}: values not changed, skip delivery due checkValuesEqual option",
                    self.release_name
                );
                return Ok(());
            }
        }

        if self.options.re_install_release {
            self.uninstall().await?;
            self.install(revision).await?;
        } else {
            self.upgrade(revision).await?;
        }

        info!("{}: {} delivered", self.release_name, revision);
        Ok(())
    }

    /// Synchronous uninstall; helm drops the release history by default.
    /// A release that is already gone counts as success.
    pub async fn uninstall(&self) -> Result<()> {
        let output = self
            .run_helm_raw(&[
                "uninstall",
                &self.release_name,
                "--namespace",
                &self.namespace,
                "--wait",
                "--timeout",
                &timeout_arg(),
            ])
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("not found") {
                return Err(DeliveryError::Helm {
                    action: "uninstall",
                    message: stderr.trim().to_string(),
                });
            }
        }

        debug!("{}: release uninstalled", self.release_name);
        Ok(())
    }

    async fn install(&self, revision: &Revision) -> Result<()> {
        let args = self.install_args(revision);
        self.run_helm("install", &args).await?;
        Ok(())
    }

    async fn upgrade(&self, revision: &Revision) -> Result<()> {
        let args = self.upgrade_args(revision);
        self.run_helm("upgrade", &args).await?;
        Ok(())
    }

    fn install_args(&self, revision: &Revision) -> Vec<String> {
        let mut args = vec![
            "install".to_string(),
            self.release_name.clone(),
            self.chart_path.display().to_string(),
            "--namespace".to_string(),
            self.namespace.clone(),
            "--wait".to_string(),
            "--timeout".to_string(),
            timeout_arg(),
            "--dependency-update".to_string(),
            "--description".to_string(),
            revision.as_str().to_string(),
        ];

        if self.options.atomic {
            args.push("--atomic".to_string());
        }
        if self.options.create_namespace {
            args.push("--create-namespace".to_string());
        }
        if !self.options.include_crds {
            args.push("--skip-crds".to_string());
        }
        self.push_value_files(&mut args);

        args
    }

    fn upgrade_args(&self, revision: &Revision) -> Vec<String> {
        let mut args = vec![
            "upgrade".to_string(),
            self.release_name.clone(),
            self.chart_path.display().to_string(),
            "--namespace".to_string(),
            self.namespace.clone(),
            "--install".to_string(),
            "--cleanup-on-fail".to_string(),
            "--wait".to_string(),
            "--timeout".to_string(),
            timeout_arg(),
            "--dependency-update".to_string(),
            "--description".to_string(),
            revision.as_str().to_string(),
        ];

        if self.options.atomic {
            args.push("--atomic".to_string());
        }
        if !self.options.include_crds {
            args.push("--skip-crds".to_string());
        }
        self.push_value_files(&mut args);

        args
    }

    fn push_value_files(&self, args: &mut Vec<String>) {
        for file in &self.value_files {
            args.push("--values".to_string());
            args.push(file.display().to_string());
        }
    }

    /// Finds this application's release among all releases in the namespace.
    async fn current_release(&self) -> Result<Option<ReleaseListItem>> {
        let output = self
            .run_helm(
                "list",
                &[
                    "list".to_string(),
                    "--all".to_string(),
                    "--namespace".to_string(),
                    self.namespace.clone(),
                    "--output".to_string(),
                    "json".to_string(),
                ],
            )
            .await?;

        let releases: Vec<ReleaseListItem> = serde_json::from_slice(&output.stdout)
            .map_err(|e| DeliveryError::ParseOutput(e.to_string()))?;

        Ok(releases
            .into_iter()
            .find(|release| release.name == self.release_name))
    }

    /// The revision marker of the deployed release, if any.
    async fn deployed_description(&self) -> Result<Option<String>> {
        let output = self
            .run_helm_raw(&[
                "status",
                &self.release_name,
                "--namespace",
                &self.namespace,
                "--output",
                "json",
            ])
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("not found") {
                return Ok(None);
            }
            return Err(DeliveryError::Helm {
                action: "status",
                message: stderr.trim().to_string(),
            });
        }

        let status: ReleaseStatus = serde_json::from_slice(&output.stdout)
            .map_err(|e| DeliveryError::ParseOutput(e.to_string()))?;
        Ok(Some(status.info.description))
    }

    /// User-supplied values of the deployed release.
    async fn deployed_values(&self) -> Result<serde_yaml::Value> {
        let output = self
            .run_helm(
                "get values",
                &[
                    "get".to_string(),
                    "values".to_string(),
                    self.release_name.clone(),
                    "--namespace".to_string(),
                    self.namespace.clone(),
                    "--output".to_string(),
                    "yaml".to_string(),
                ],
            )
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        serde_yaml::from_str(&stdout).map_err(|e| DeliveryError::ParseOutput(e.to_string()))
    }

    /// Deep merge of the configured value files, later files winning.
    fn merged_values(&self) -> Result<serde_yaml::Value> {
        let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

        for file in &self.value_files {
            let contents =
                std::fs::read_to_string(file).map_err(|source| DeliveryError::ReadValues {
                    path: file.clone(),
                    source,
                })?;
            let value: serde_yaml::Value =
                serde_yaml::from_str(&contents).map_err(|e| DeliveryError::ParseValues {
                    path: file.clone(),
                    message: e.to_string(),
                })?;
            merge_yaml(&mut merged, value);
        }

        Ok(merged)
    }

    async fn update_dependencies(&self) -> Result<()> {
        self.run_helm(
            "dependency update",
            &[
                "dependency".to_string(),
                "update".to_string(),
                self.chart_path.display().to_string(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn run_helm(&self, action: &'static str, args: &[String]) -> Result<Output> {
        let output = Command::new("helm")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(DeliveryError::Spawn)?;

        if !output.status.success() {
            return Err(DeliveryError::Helm {
                action,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Like `run_helm` but leaves status interpretation to the caller.
    async fn run_helm_raw(&self, args: &[&str]) -> Result<Output> {
        Command::new("helm")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(DeliveryError::Spawn)
    }
}

fn timeout_arg() -> String {
    format!("{}s", ACTION_TIMEOUT.as_secs())
}

/// Compares value trees, treating an absent document as an empty mapping.
fn values_equal(left: &serde_yaml::Value, right: &serde_yaml::Value) -> bool {
    normalize(left) == normalize(right)
}

fn normalize(value: &serde_yaml::Value) -> serde_yaml::Value {
    match value {
        serde_yaml::Value::Null => serde_yaml::Value::Mapping(serde_yaml::Mapping::new()),
        other => other.clone(),
    }
}

/// Merges `overlay` into `base`: mappings merge recursively, everything else
/// is replaced.
fn merge_yaml(base: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(slot) => merge_yaml(slot, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(options: HelmOptions) -> HelmProvider {
        let chart_path = PathBuf::from("/work/demo/chart");
        let value_files = options
            .values_files
            .iter()
            .map(|f| chart_path.join(f))
            .collect();
        HelmProvider {
            release_name: "demo".to_string(),
            chart_path,
            namespace: "apps".to_string(),
            options,
            value_files,
        }
    }

    fn yaml(input: &str) -> serde_yaml::Value {
        serde_yaml::from_str(input).unwrap()
    }

    #[test]
    fn install_args_follow_options() {
        let p = provider(HelmOptions {
            atomic: true,
            create_namespace: true,
            include_crds: true,
            values_files: vec!["values.yaml".to_string()],
            ..Default::default()
        });
        let args = p.install_args(&Revision::from("abc123".to_string()));

        assert_eq!(args[0], "install");
        assert!(args.contains(&"--atomic".to_string()));
        assert!(args.contains(&"--create-namespace".to_string()));
        assert!(!args.contains(&"--skip-crds".to_string()));
        assert!(args.contains(&"--description".to_string()));
        assert!(args.contains(&"abc123".to_string()));
        assert!(args.contains(&"/work/demo/chart/values.yaml".to_string()));
    }

    #[test]
    fn install_skips_crds_when_excluded() {
        let p = provider(HelmOptions::default());
        let args = p.install_args(&Revision::from("abc".to_string()));
        assert!(args.contains(&"--skip-crds".to_string()));
        assert!(!args.contains(&"--atomic".to_string()));
    }

    #[test]
    fn upgrade_args_always_install_and_cleanup() {
        let p = provider(HelmOptions::default());
        let args = p.upgrade_args(&Revision::from("abc".to_string()));

        assert_eq!(args[0], "upgrade");
        assert!(args.contains(&"--install".to_string()));
        assert!(args.contains(&"--cleanup-on-fail".to_string()));
        assert!(args.contains(&"--timeout".to_string()));
        assert!(args.contains(&"360s".to_string()));
    }

    #[test]
    fn merge_later_files_win_deep() {
        let mut base = yaml("image:\n  tag: v1\n  pullPolicy: IfNotPresent\nreplicas: 1\n");
        let overlay = yaml("image:\n  tag: v2\n");
        merge_yaml(&mut base, overlay);

        assert_eq!(base["image"]["tag"], yaml("v2"));
        assert_eq!(base["image"]["pullPolicy"], yaml("IfNotPresent"));
        assert_eq!(base["replicas"], yaml("1"));
    }

    #[test]
    fn null_values_equal_empty_mapping() {
        let empty = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
        assert!(values_equal(&serde_yaml::Value::Null, &empty));
        assert!(!values_equal(&yaml("a: 1"), &empty));
    }

    #[test]
    fn release_list_parsing() {
        let json = r#"[{"name":"demo","namespace":"apps","revision":"2","status":"deployed","chart":"demo-0.1.0","app_version":"1.0"}]"#;
        let releases: Vec<ReleaseListItem> = serde_json::from_str(json).unwrap();
        assert_eq!(releases[0].name, "demo");
    }

    #[test]
    fn release_status_parsing() {
        let json = r#"{"name":"demo","info":{"description":"abc123","status":"deployed"}}"#;
        let status: ReleaseStatus = serde_json::from_str(json).unwrap();
        assert_eq!(status.info.description, "abc123");
    }

    #[test]
    fn helm_options_wire_shape() {
        let json = r#"{"checkValuesEqual":true,"includeCRDs":true,"valuesFiles":["a.yaml"]}"#;
        let options: HelmOptions = serde_json::from_str(json).unwrap();
        assert!(options.check_values_equal);
        assert!(options.include_crds);
        assert_eq!(options.values_files, vec!["a.yaml".to_string()]);
        assert!(!options.atomic);
    }
}
