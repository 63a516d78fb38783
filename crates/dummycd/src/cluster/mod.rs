//! Shared cluster-access material.
//!
//! Delivery providers talk to the cluster through the `kubectl` façade;
//! repository credentials come from the [`SecretStore`] interface. Both are
//! read-only after initialization and safe to share across applications.

pub mod kubectl;
pub mod secrets;

pub use kubectl::{Kubectl, KubectlError};
pub use secrets::{KubectlSecretStore, SecretError, SecretStore};
