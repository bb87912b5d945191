//! Secret store adapter: where credentials come from.

use crate::config::EnvSnapshot;
use crate::errors::SecretError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

/// The credentials privileged stages can reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretKey {
    /// Minified cluster configuration of the current context.
    Kubeconfig,
    /// Container image registry URL.
    ContainerRepositoryUrl,
    /// Chart repository URL.
    HelmRepositoryUrl,
}

impl SecretKey {
    /// Logical name of the secret.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Kubeconfig => "kubeconfig",
            Self::ContainerRepositoryUrl => "container_repository_url",
            Self::HelmRepositoryUrl => "helm_repository_url",
        }
    }

    /// Environment variable the secret is read from.
    #[must_use]
    pub fn env_var(self) -> &'static str {
        match self {
            Self::Kubeconfig => "KUBECONFIG_CONTENT",
            Self::ContainerRepositoryUrl => "CONTAINER_REPOSITORY_URL",
            Self::HelmRepositoryUrl => "HELM_REPOSITORY_URL",
        }
    }
}

impl fmt::Display for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A secret value that never prints itself.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    /// Wraps a raw value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the raw value. Only the injector should call this.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(***)")
    }
}

impl fmt::Display for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Source of secret values.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Looks up a secret. An absent secret is `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the source exists but could not be read.
    async fn lookup(&self, key: SecretKey) -> Result<Option<SecretValue>, SecretError>;
}

/// Reads secrets from the ambient environment.
///
/// Repository URLs come from the environment snapshot. The cluster
/// configuration comes from `KUBECONFIG_CONTENT` when set, otherwise from
/// `kubectl config view --minify --raw` for the current (or configured)
/// context.
#[derive(Debug, Clone)]
pub struct AmbientSecretStore {
    env: EnvSnapshot,
    kubectl_bin: String,
    kubectl_context: Option<String>,
    kubeconfig: Option<PathBuf>,
}

impl AmbientSecretStore {
    /// Creates a store over an environment snapshot.
    #[must_use]
    pub fn new(env: EnvSnapshot, kubectl_bin: impl Into<String>, kubectl_context: Option<String>) -> Self {
        Self {
            env,
            kubectl_bin: kubectl_bin.into(),
            kubectl_context,
            kubeconfig: None,
        }
    }

    /// Reads the cluster configuration from `kubeconfig` instead of
    /// kubectl's default location.
    #[must_use]
    pub fn with_kubeconfig(mut self, kubeconfig: Option<PathBuf>) -> Self {
        self.kubeconfig = kubeconfig;
        self
    }

    fn capture_args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["config", "view", "--minify", "--raw"]
            .into_iter()
            .map(ToString::to_string)
            .collect();
        if let Some(path) = &self.kubeconfig {
            args.extend(["--kubeconfig".to_string(), path.display().to_string()]);
        }
        if let Some(context) = &self.kubectl_context {
            args.extend(["--context".to_string(), context.clone()]);
        }
        args
    }

    async fn capture_kubeconfig(&self) -> Result<Option<SecretValue>, SecretError> {
        let output = Command::new(&self.kubectl_bin)
            .args(self.capture_args())
            .kill_on_drop(true)
            .output()
            .await;
        let output = match output {
            Ok(output) => output,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(bin = %self.kubectl_bin, "kubectl not found, no kubeconfig");
                return Ok(None);
            }
            Err(e) => {
                return Err(SecretError::KubeconfigUnavailable {
                    reason: e.to_string(),
                })
            }
        };

        if !output.status.success() {
            return Err(SecretError::KubeconfigUnavailable {
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let content = String::from_utf8_lossy(&output.stdout).into_owned();
        if content.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(SecretValue::new(content)))
    }
}

#[async_trait]
impl SecretStore for AmbientSecretStore {
    async fn lookup(&self, key: SecretKey) -> Result<Option<SecretValue>, SecretError> {
        if let Some(value) = self.env.get(key.env_var()) {
            return Ok(Some(SecretValue::new(value)));
        }
        match key {
            SecretKey::Kubeconfig => self.capture_kubeconfig().await,
            SecretKey::ContainerRepositoryUrl | SecretKey::HelmRepositoryUrl => Ok(None),
        }
    }
}

/// In-memory secret store.
#[derive(Debug, Clone, Default)]
pub struct StaticSecretStore {
    values: HashMap<SecretKey, SecretValue>,
}

impl StaticSecretStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a secret.
    #[must_use]
    pub fn with(mut self, key: SecretKey, value: impl Into<String>) -> Self {
        self.values.insert(key, SecretValue::new(value));
        self
    }
}

#[async_trait]
impl SecretStore for StaticSecretStore {
    async fn lookup(&self, key: SecretKey) -> Result<Option<SecretValue>, SecretError> {
        Ok(self.values.get(&key).cloned())
    }
}
