//! `kubectl` façade for dynamic resource access.
//!
//! Per-object operations pipe the full JSON object through `kubectl ... -f -`,
//! which leaves group/version/resource resolution to the server's discovery
//! information instead of guessing resource names from kinds. The prune sweep
//! enumerates listable, deletable namespaced resources via `api-resources`.

use std::process::Stdio;

use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Errors from kubectl invocations.
#[derive(Debug, Error)]
pub enum KubectlError {
    #[error("kubectl {op} failed: {message}")]
    Command { op: &'static str, message: String },

    #[error("failed to spawn kubectl: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to parse kubectl output: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, KubectlError>;

/// Whether a kubectl error message indicates a missing object.
fn is_not_found(stderr: &str) -> bool {
    stderr.contains("(NotFound)")
}

/// Thin handle over the `kubectl` binary. Cluster credentials are whatever
/// the process environment provides (in-cluster serviceaccount or kubeconfig).
#[derive(Debug, Clone, Copy, Default)]
pub struct Kubectl;

impl Kubectl {
    /// Fetches the live counterpart of `object`. Returns `None` when the
    /// object does not exist on the cluster.
    pub async fn get_object(&self, object: &Value) -> Result<Option<Value>> {
        let output = self
            .run_with_stdin(&["get", "-f", "-", "-o", "json"], object)
            .await?;

        if output.status.success() {
            let parsed = serde_json::from_slice(&output.stdout)
                .map_err(|e| KubectlError::Parse(e.to_string()))?;
            return Ok(Some(parsed));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_not_found(&stderr) {
            Ok(None)
        } else {
            Err(KubectlError::Command {
                op: "get",
                message: stderr.trim().to_string(),
            })
        }
    }

    pub async fn create_object(&self, object: &Value) -> Result<()> {
        let output = self.run_with_stdin(&["create", "-f", "-"], object).await?;
        self.expect_success("create", output)
    }

    /// Replaces the live object. The caller must have copied the remote
    /// `resourceVersion` onto `object`.
    pub async fn replace_object(&self, object: &Value) -> Result<()> {
        let output = self.run_with_stdin(&["replace", "-f", "-"], object).await?;
        self.expect_success("replace", output)
    }

    /// Namespaced resources supporting both list and delete, as kubectl type
    /// names (`<plural>.<group>`, bare plural for the core group).
    pub async fn api_resources(&self) -> Result<Vec<String>> {
        let output = self
            .run(&[
                "api-resources",
                "--verbs=list,delete",
                "--namespaced=true",
                "-o",
                "name",
            ])
            .await?;
        if !output.status.success() {
            return Err(KubectlError::Command {
                op: "api-resources",
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Names of the objects of `resource` in `namespace` matching `selector`.
    pub async fn list_names(
        &self,
        resource: &str,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<String>> {
        let output = self
            .run(&["get", resource, "-n", namespace, "-l", selector, "-o", "json"])
            .await?;
        if !output.status.success() {
            return Err(KubectlError::Command {
                op: "get",
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let list: Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| KubectlError::Parse(e.to_string()))?;
        let names = list["items"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item["metadata"]["name"].as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(names)
    }

    /// Deletes an object with foreground propagation, without waiting for the
    /// deletion to complete.
    pub async fn delete_foreground(
        &self,
        resource: &str,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        let output = self
            .run(&[
                "delete",
                resource,
                name,
                "-n",
                namespace,
                "--cascade=foreground",
                "--wait=false",
            ])
            .await?;
        self.expect_success("delete", output)
    }

    /// Creates `namespace` if it does not exist yet.
    pub async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        let output = self
            .run(&["get", "namespace", namespace, "-o", "name"])
            .await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !is_not_found(&stderr) {
            return Err(KubectlError::Command {
                op: "get",
                message: stderr.trim().to_string(),
            });
        }

        let output = self.run(&["create", "namespace", namespace]).await?;
        self.expect_success("create", output)
    }

    fn expect_success(
        &self,
        op: &'static str,
        output: std::process::Output,
    ) -> Result<()> {
        if output.status.success() {
            Ok(())
        } else {
            Err(KubectlError::Command {
                op,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new("kubectl")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(KubectlError::Spawn)
    }

    async fn run_with_stdin(
        &self,
        args: &[&str],
        object: &Value,
    ) -> Result<std::process::Output> {
        let payload =
            serde_json::to_vec(object).map_err(|e| KubectlError::Parse(e.to_string()))?;

        let mut child = Command::new("kubectl")
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(KubectlError::Spawn)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .map_err(KubectlError::Spawn)?;
        }

        child.wait_with_output().await.map_err(KubectlError::Spawn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_detection() {
        assert!(is_not_found(
            "Error from server (NotFound): configmaps \"cm-a\" not found"
        ));
        assert!(!is_not_found("Error from server (Forbidden): denied"));
    }
}
