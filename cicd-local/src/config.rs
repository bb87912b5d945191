//! Run configuration.
//!
//! Everything the engine needs from the ambient environment is read once,
//! into an [`EnvSnapshot`], and turned into an explicit [`Config`] that is
//! passed down to every component. Nothing below this module reads
//! `std::env` directly.

use crate::errors::{CicdError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default name of the optional environment file in the working directory.
pub const DEFAULT_ENV_FILE: &str = "local_cicd.env";

/// A frozen view of the process environment merged with an env file.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    /// Captures the current process environment.
    #[must_use]
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// Builds a snapshot from explicit pairs.
    #[must_use]
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Merges variables from a `.env`-style file. Variables already present
    /// win over the file. A missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns a precondition error if the file exists but cannot be parsed.
    pub fn with_env_file(mut self, path: &Path) -> Result<Self> {
        if !path.is_file() {
            debug!(path = %path.display(), "No env file, using process environment only");
            return Ok(self);
        }
        let iter = dotenvy::from_path_iter(path).map_err(|e| {
            CicdError::precondition(format!("cannot read env file {}: {e}", path.display()))
        })?;
        let mut loaded = 0usize;
        for item in iter {
            let (key, value) = item.map_err(|e| {
                CicdError::precondition(format!("invalid env file {}: {e}", path.display()))
            })?;
            if !self.vars.contains_key(&key) {
                self.vars.insert(key, value);
                loaded += 1;
            }
        }
        debug!(path = %path.display(), loaded, "Env file merged");
        Ok(self)
    }

    /// Returns a non-empty variable.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Interprets a variable as a boolean flag.
    #[must_use]
    pub fn flag(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| {
            matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
    }

    /// Sets a variable, for tests and overrides.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }
}

/// Settings for the port-forward tunnel used by acceptance testing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Local port the tunnel listens on.
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    /// HTTP path polled for health.
    #[serde(default = "default_health_path")]
    pub health_path: String,
    /// Maximum number of health probes.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay between probes in milliseconds.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Timeout of a single probe in milliseconds.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_local_port() -> u16 {
    8080
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_max_attempts() -> u32 {
    30
}

fn default_interval_ms() -> u64 {
    2000
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            local_port: default_local_port(),
            health_path: default_health_path(),
            max_attempts: default_max_attempts(),
            interval_ms: default_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl TunnelConfig {
    /// Delay between probes.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Timeout of a single probe.
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Full configuration of one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Working directory the run is scoped to.
    pub workdir: PathBuf,
    /// Directory of the module the backend calls into.
    pub module_dir: PathBuf,
    /// Directory passed to stages as `source`.
    pub source_dir: PathBuf,
    /// Run output directory for artifacts and logs.
    pub output_dir: PathBuf,
    /// Where the privileged module is materialized.
    pub privileged_dir: PathBuf,
    /// Override for the privileged template set.
    #[serde(default)]
    pub template_dir: Option<PathBuf>,
    /// Execution backend executable.
    #[serde(default = "default_dagger_bin")]
    pub dagger_bin: String,
    /// Cluster CLI executable.
    #[serde(default = "default_kubectl_bin")]
    pub kubectl_bin: String,
    /// Version-control executable.
    #[serde(default = "default_git_bin")]
    pub git_bin: String,
    /// Cluster context to use instead of the current one.
    #[serde(default)]
    pub kubectl_context: Option<String>,
    /// Cluster configuration file kubectl reads; kubectl's own default
    /// when unset.
    #[serde(default)]
    pub kubeconfig_path: Option<PathBuf>,
    /// Keep the materialized privileged module after the run.
    #[serde(default)]
    pub keep_privileged: bool,
    /// Namespace override for tunnels and diagnostics.
    #[serde(default)]
    pub namespace: Option<String>,
    /// Tunnel settings.
    #[serde(default)]
    pub tunnel: TunnelConfig,
}

fn default_dagger_bin() -> String {
    "dagger".to_string()
}

fn default_kubectl_bin() -> String {
    "kubectl".to_string()
}

fn default_git_bin() -> String {
    "git".to_string()
}

impl Config {
    /// Creates a configuration with defaults relative to `workdir`.
    #[must_use]
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        let workdir = workdir.into();
        Self {
            module_dir: workdir.clone(),
            source_dir: workdir.clone(),
            output_dir: workdir.join("output"),
            privileged_dir: workdir.join("privileged"),
            template_dir: None,
            dagger_bin: default_dagger_bin(),
            kubectl_bin: default_kubectl_bin(),
            git_bin: default_git_bin(),
            kubectl_context: None,
            kubeconfig_path: None,
            keep_privileged: false,
            namespace: None,
            tunnel: TunnelConfig::default(),
            workdir,
        }
    }

    /// Builds the configuration from an environment snapshot.
    #[must_use]
    pub fn from_env(workdir: impl Into<PathBuf>, env: &EnvSnapshot) -> Self {
        let mut config = Self::new(workdir);
        let root = config.workdir.clone();
        let resolve = |value: &str| root.join(value);

        if let Some(dir) = env.get("CICD_MODULE_DIR") {
            config.module_dir = resolve(dir);
        }
        if let Some(dir) = env.get("CICD_SOURCE_DIR") {
            config.source_dir = resolve(dir);
        }
        if let Some(dir) = env.get("CICD_OUTPUT_DIR") {
            config.output_dir = resolve(dir);
        }
        config.privileged_dir = env
            .get("CICD_PRIVILEGED_DIR")
            .map_or_else(|| config.module_dir.join("privileged"), resolve);
        config.template_dir = env.get("CICD_TEMPLATE_DIR").map(resolve);

        if let Some(bin) = env.get("DAGGER_BIN") {
            config.dagger_bin = bin.to_string();
        }
        if let Some(bin) = env.get("KUBECTL_BIN") {
            config.kubectl_bin = bin.to_string();
        }
        if let Some(bin) = env.get("GIT_BIN") {
            config.git_bin = bin.to_string();
        }
        config.kubectl_context = env.get("KUBECTL_CONTEXT").map(ToString::to_string);
        config.kubeconfig_path = env
            .get("KUBECONFIG")
            .and_then(|list| list.split(':').find(|p| !p.is_empty()))
            .map(resolve);
        config.keep_privileged = env.flag("CICD_KEEP_PRIVILEGED");
        config.namespace = env.get("CICD_NAMESPACE").map(ToString::to_string);

        if let Some(port) = env.get("CICD_TUNNEL_PORT").and_then(|p| p.parse().ok()) {
            config.tunnel.local_port = port;
        }
        if let Some(path) = env.get("CICD_HEALTH_PATH") {
            config.tunnel.health_path = path.to_string();
        }

        config
    }

    /// Sets the module directory. A privileged directory still at its
    /// default location follows the module; an explicit one stays put.
    #[must_use]
    pub fn with_module_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        let follows = self.privileged_dir == self.module_dir.join("privileged");
        self.module_dir = self.workdir.join(dir.into());
        if follows {
            self.privileged_dir = self.module_dir.join("privileged");
        }
        self
    }

    /// Sets the source directory.
    #[must_use]
    pub fn with_source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.source_dir = self.workdir.join(dir.into());
        self
    }

    /// Sets the run output directory.
    #[must_use]
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = self.workdir.join(dir.into());
        self
    }

    /// Keeps the privileged module after the run.
    #[must_use]
    pub fn with_keep_privileged(mut self, keep: bool) -> Self {
        self.keep_privileged = keep;
        self
    }

    /// Sets the namespace override.
    #[must_use]
    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        if namespace.is_some() {
            self.namespace = namespace;
        }
        self
    }

    /// Sets the tunnel settings.
    #[must_use]
    pub fn with_tunnel(mut self, tunnel: TunnelConfig) -> Self {
        self.tunnel = tunnel;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults_relative_to_workdir() {
        let config = Config::from_env("/work", &EnvSnapshot::from_pairs([("HOME", "/home/dev")]));

        assert_eq!(config.output_dir, PathBuf::from("/work/output"));
        assert_eq!(config.privileged_dir, PathBuf::from("/work/privileged"));
        assert_eq!(config.kubeconfig_path, None);
        assert_eq!(config.dagger_bin, "dagger");
        assert!(!config.keep_privileged);
        assert_eq!(config.tunnel, TunnelConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        let env = EnvSnapshot::from_pairs([
            ("CICD_MODULE_DIR", "ci"),
            ("CICD_KEEP_PRIVILEGED", "true"),
            ("KUBECONFIG", "/etc/kube/a:/etc/kube/b"),
            ("KUBECTL_CONTEXT", "kind-local"),
            ("CICD_TUNNEL_PORT", "9090"),
            ("DAGGER_BIN", "/opt/dagger"),
        ]);
        let config = Config::from_env("/work", &env);

        assert_eq!(config.module_dir, PathBuf::from("/work/ci"));
        assert_eq!(config.privileged_dir, PathBuf::from("/work/ci/privileged"));
        assert!(config.keep_privileged);
        assert_eq!(config.kubeconfig_path, Some(PathBuf::from("/etc/kube/a")));
        assert_eq!(config.kubectl_context.as_deref(), Some("kind-local"));
        assert_eq!(config.tunnel.local_port, 9090);
        assert_eq!(config.dagger_bin, "/opt/dagger");
    }

    #[test]
    fn test_explicit_privileged_dir_survives_module_override() {
        let env = EnvSnapshot::from_pairs([("CICD_PRIVILEGED_DIR", "/secure/privileged")]);
        let config = Config::from_env("/work", &env).with_module_dir("dagger");

        assert_eq!(config.module_dir, PathBuf::from("/work/dagger"));
        assert_eq!(config.privileged_dir, PathBuf::from("/secure/privileged"));
    }

    #[test]
    fn test_relative_kubeconfig_resolves_against_workdir() {
        let env = EnvSnapshot::from_pairs([("KUBECONFIG", ":kube/dev.yaml")]);
        let config = Config::from_env("/work", &env);
        assert_eq!(config.kubeconfig_path, Some(PathBuf::from("/work/kube/dev.yaml")));
        assert_eq!(Config::new("/work").kubeconfig_path, None);
    }

    #[test]
    fn test_env_file_does_not_override_process_env() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "CONTAINER_REPOSITORY_URL=registry.from.file").unwrap();
        writeln!(file, "HELM_REPOSITORY_URL=oci://charts.from.file").unwrap();

        let env = EnvSnapshot::from_pairs([("CONTAINER_REPOSITORY_URL", "registry.from.process")])
            .with_env_file(file.path())
            .unwrap();

        assert_eq!(env.get("CONTAINER_REPOSITORY_URL"), Some("registry.from.process"));
        assert_eq!(env.get("HELM_REPOSITORY_URL"), Some("oci://charts.from.file"));
    }

    #[test]
    fn test_missing_env_file_is_fine() {
        let env = EnvSnapshot::default()
            .with_env_file(Path::new("/nonexistent/local_cicd.env"))
            .unwrap();
        assert_eq!(env.get("ANYTHING"), None);
    }

    #[test]
    fn test_empty_values_are_unset() {
        let env = EnvSnapshot::from_pairs([("HELM_REPOSITORY_URL", "")]);
        assert_eq!(env.get("HELM_REPOSITORY_URL"), None);
        assert!(!env.flag("HELM_REPOSITORY_URL"));
    }

    #[test]
    fn test_builder_methods() {
        let config = Config::new("/work")
            .with_module_dir("dagger")
            .with_output_dir("out")
            .with_namespace(Some("staging".to_string()))
            .with_namespace(None);

        assert_eq!(config.privileged_dir, PathBuf::from("/work/dagger/privileged"));
        assert_eq!(config.output_dir, PathBuf::from("/work/out"));
        assert_eq!(config.namespace.as_deref(), Some("staging"));
    }
}
