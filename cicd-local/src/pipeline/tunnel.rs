//! Port-forward tunnel to a deployed service, and health polling through it.

use crate::context::ContextArtifact;
use crate::errors::{CicdError, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Name under which tunnel teardown is registered for cleanup.
pub const TEARDOWN_CLEANUP_NAME: &str = "tunnel-teardown";

const DEFAULT_NAMESPACE: &str = "default";

static ENDPOINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?P<scheme>[a-zA-Z][a-zA-Z0-9+.-]*)://)?(?P<host>[^/:?#]+)(?::(?P<port>\d+))?")
        .unwrap_or_else(|e| unreachable!("endpoint pattern: {e}"))
});

/// Where a tunnel points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelTarget {
    /// Service name.
    pub service: String,
    /// Namespace of the service.
    pub namespace: String,
    /// Port of the service.
    pub remote_port: u16,
    /// Local port the tunnel listens on.
    pub local_port: u16,
}

impl TunnelTarget {
    /// Parses an in-cluster endpoint such as
    /// `http://app.staging.svc.cluster.local:8080`.
    ///
    /// The namespace comes from `namespace_override`, else from the host
    /// name, else `default`. A missing port defaults by scheme.
    #[must_use]
    pub fn from_endpoint(endpoint: &str, namespace_override: Option<&str>, local_port: u16) -> Option<Self> {
        let caps = ENDPOINT.captures(endpoint.trim())?;
        let host = caps.name("host")?.as_str();
        let scheme = caps.name("scheme").map(|m| m.as_str().to_ascii_lowercase());
        let remote_port = match caps.name("port") {
            Some(port) => port.as_str().parse().ok()?,
            None if scheme.as_deref() == Some("https") => 443,
            None => 80,
        };

        let mut labels = host.split('.');
        let service = labels.next().filter(|s| !s.is_empty())?.to_string();
        let namespace = namespace_override
            .map(ToString::to_string)
            .or_else(|| labels.next().map(ToString::to_string))
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

        Some(Self {
            service,
            namespace,
            remote_port,
            local_port,
        })
    }

    /// Derives the target from a deployment context artifact.
    ///
    /// A `namespace` field in the artifact is used when the endpoint host
    /// does not carry one.
    ///
    /// # Errors
    ///
    /// Returns a precondition error if the artifact has no usable `endpoint`.
    pub fn from_deployment(
        artifact: &ContextArtifact,
        namespace_override: Option<&str>,
        local_port: u16,
    ) -> Result<Self> {
        let endpoint = artifact.str_field("endpoint").ok_or_else(|| {
            CicdError::precondition(format!(
                "deployment context {} has no endpoint",
                artifact.path().display()
            ))
        })?;

        let artifact_namespace = artifact.str_field("namespace");
        let host_has_namespace = ENDPOINT
            .captures(endpoint.trim())
            .and_then(|c| c.name("host"))
            .is_some_and(|h| h.as_str().contains('.'));
        let namespace = namespace_override.or(if host_has_namespace {
            None
        } else {
            artifact_namespace.as_deref()
        });

        Self::from_endpoint(&endpoint, namespace, local_port).ok_or_else(|| {
            CicdError::precondition(format!("cannot parse deployment endpoint '{endpoint}'"))
        })
    }

    /// Local URL of `path` through the tunnel.
    #[must_use]
    pub fn local_url(&self, path: &str) -> String {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        format!("http://127.0.0.1:{}{path}", self.local_port)
    }
}

impl std::fmt::Display for TunnelTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "svc/{} -n {} {}:{}",
            self.service, self.namespace, self.local_port, self.remote_port
        )
    }
}

/// An open tunnel.
pub trait Tunnel: Send {
    /// Tears the tunnel down. Closing twice is harmless.
    ///
    /// # Errors
    ///
    /// Returns a description of what could not be torn down.
    fn close(&mut self) -> std::result::Result<(), String>;
}

/// Opens tunnels and reports cluster state when they do not work.
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    /// Starts a tunnel in the background.
    ///
    /// # Errors
    ///
    /// Returns an error if the tunnel process cannot be started.
    async fn open(&self, target: &TunnelTarget) -> Result<Box<dyn Tunnel>>;

    /// Dumps the state of the resources in `namespace`.
    async fn diagnostics(&self, namespace: &str) -> String;
}

/// Tunnels through `kubectl port-forward`.
#[derive(Debug, Clone)]
pub struct KubectlTunnelProvider {
    bin: String,
    context: Option<String>,
    kubeconfig: Option<PathBuf>,
}

impl KubectlTunnelProvider {
    /// Creates a provider using the given executable and optional context.
    #[must_use]
    pub fn new(bin: impl Into<String>, context: Option<String>) -> Self {
        Self {
            bin: bin.into(),
            context,
            kubeconfig: None,
        }
    }

    /// Points kubectl at a specific cluster configuration file.
    #[must_use]
    pub fn with_kubeconfig(mut self, kubeconfig: Option<PathBuf>) -> Self {
        self.kubeconfig = kubeconfig;
        self
    }

    fn context_args(&self) -> Vec<String> {
        let kubeconfig = self
            .kubeconfig
            .iter()
            .flat_map(|p| ["--kubeconfig".to_string(), p.display().to_string()]);
        let context = self
            .context
            .iter()
            .flat_map(|c| ["--context".to_string(), c.clone()]);
        kubeconfig.chain(context).collect()
    }
}

/// A `kubectl port-forward` child process.
///
/// The child is spawned with `kill_on_drop`, so the runtime reaps it even
/// when `close` returns before the kill has taken effect.
#[derive(Debug)]
pub struct PortForward {
    child: Option<Child>,
}

impl PortForward {
    /// Wraps a spawned port-forward process.
    #[must_use]
    pub fn new(child: Child) -> Self {
        Self { child: Some(child) }
    }
}

impl Tunnel for PortForward {
    fn close(&mut self) -> std::result::Result<(), String> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        match child.start_kill() {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::InvalidInput => {}
            Err(e) => return Err(format!("cannot stop port-forward: {e}")),
        }
        match child.try_wait() {
            Ok(Some(status)) => debug!(status = %status, "Port-forward stopped"),
            Ok(None) => debug!("Port-forward kill sent"),
            Err(e) => return Err(format!("cannot reap port-forward: {e}")),
        }
        Ok(())
    }
}

impl Drop for PortForward {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Port-forward teardown on drop failed");
        }
    }
}

#[async_trait]
impl TunnelProvider for KubectlTunnelProvider {
    async fn open(&self, target: &TunnelTarget) -> Result<Box<dyn Tunnel>> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(self.context_args())
            .arg("port-forward")
            .arg(format!("svc/{}", target.service))
            .arg(format!("{}:{}", target.local_port, target.remote_port))
            .args(["-n", target.namespace.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CicdError::precondition(format!("'{}' not found on PATH", self.bin)));
            }
            Err(e) => return Err(e.into()),
        };
        info!(tunnel = %target, pid = ?child.id(), "Port-forward started");
        Ok(Box::new(PortForward::new(child)))
    }

    async fn diagnostics(&self, namespace: &str) -> String {
        let output = Command::new(&self.bin)
            .args(self.context_args())
            .args(["get", "pods,svc,endpoints", "-n", namespace, "-o", "wide"])
            .output()
            .await;
        match output {
            Ok(out) => format!(
                "{}{}",
                String::from_utf8_lossy(&out.stdout),
                String::from_utf8_lossy(&out.stderr)
            ),
            Err(e) => format!("(cannot collect diagnostics: {e})"),
        }
    }
}

/// Checks whether a URL answers healthy.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Returns true if `url` is healthy right now.
    async fn check(&self, url: &str) -> bool;
}

/// Health probe issuing an HTTP GET, healthy on any 2xx.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    /// Creates a probe with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns a precondition error if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CicdError::precondition(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(url, error = %e, "Health probe failed");
                false
            }
        }
    }
}

/// Polls `url` until it is healthy, at most `max_attempts` times with
/// `interval` between attempts.
///
/// Returns the attempt that succeeded, or `None` once the ceiling is hit.
pub async fn wait_until_healthy(
    probe: &dyn HealthProbe,
    url: &str,
    max_attempts: u32,
    interval: Duration,
) -> Option<u32> {
    for attempt in 1..=max_attempts {
        if probe.check(url).await {
            info!(url, attempt, "Target healthy");
            return Some(attempt);
        }
        debug!(url, attempt, max_attempts, "Target not healthy yet");
        if attempt < max_attempts {
            tokio::time::sleep(interval).await;
        }
    }
    warn!(url, max_attempts, "Target never became healthy");
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ArtifactSlot;
    use crate::testing::ScriptedHealthProbe;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_target_from_cluster_endpoint() {
        let target =
            TunnelTarget::from_endpoint("http://goserv.staging.svc.cluster.local:8080", None, 18080).unwrap();
        assert_eq!(
            target,
            TunnelTarget {
                service: "goserv".to_string(),
                namespace: "staging".to_string(),
                remote_port: 8080,
                local_port: 18080,
            }
        );
        assert_eq!(target.local_url("health"), "http://127.0.0.1:18080/health");
    }

    #[test]
    fn test_namespace_override_and_defaults() {
        let target = TunnelTarget::from_endpoint("http://goserv.staging.svc:8080/api", Some("qa"), 8080).unwrap();
        assert_eq!(target.namespace, "qa");

        let bare = TunnelTarget::from_endpoint("goserv", None, 8080).unwrap();
        assert_eq!(bare.namespace, "default");
        assert_eq!(bare.remote_port, 80);

        let tls = TunnelTarget::from_endpoint("https://goserv.prod", None, 8443).unwrap();
        assert_eq!(tls.remote_port, 443);

        assert!(TunnelTarget::from_endpoint("", None, 8080).is_none());
    }

    #[test]
    fn test_target_from_deployment_artifact() {
        let artifact = ContextArtifact::new(
            ArtifactSlot::DeploymentContext,
            "deploy/deployment-context.json",
            br#"{"endpoint": "http://goserv:8080", "namespace": "team-a", "releaseName": "goserv"}"#.to_vec(),
        );
        let target = TunnelTarget::from_deployment(&artifact, None, 8080).unwrap();
        assert_eq!(target.namespace, "team-a");

        let empty = ContextArtifact::new(ArtifactSlot::DeploymentContext, "d.json", b"{}".to_vec());
        assert!(TunnelTarget::from_deployment(&empty, None, 8080).is_err());
    }

    #[test]
    fn test_kubectl_args_carry_kubeconfig_and_context() {
        let provider = KubectlTunnelProvider::new("kubectl", Some("kind-dev".into()))
            .with_kubeconfig(Some(PathBuf::from("/etc/kube/dev.yaml")));
        assert_eq!(
            provider.context_args(),
            vec!["--kubeconfig", "/etc/kube/dev.yaml", "--context", "kind-dev"]
        );
        assert!(KubectlTunnelProvider::new("kubectl", None).context_args().is_empty());
    }

    #[tokio::test]
    async fn test_missing_kubectl_is_precondition_failure() {
        let provider = KubectlTunnelProvider::new("kubectl-that-does-not-exist", None);
        let target = TunnelTarget::from_endpoint("http://goserv:8080", None, 18080).unwrap();
        let err = provider.open(&target).await.err().unwrap();
        assert_eq!(err.exit_code(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_port_forward_close_stops_child() {
        let child = Command::new("sleep").arg("30").kill_on_drop(true).spawn().unwrap();
        let mut tunnel = PortForward::new(child);

        assert!(tunnel.close().is_ok());
        assert!(tunnel.child.is_none());
        assert!(tunnel.close().is_ok());
    }

    #[tokio::test]
    async fn test_wait_until_healthy_succeeds_eventually() {
        let probe = ScriptedHealthProbe::healthy_after(3);
        let attempt = wait_until_healthy(&probe, "http://127.0.0.1:1/health", 5, Duration::ZERO).await;
        assert_eq!(attempt, Some(3));
    }

    #[tokio::test]
    async fn test_wait_until_healthy_respects_ceiling() {
        let probe = ScriptedHealthProbe::never();
        let attempt = wait_until_healthy(&probe, "http://127.0.0.1:1/health", 4, Duration::ZERO).await;
        assert_eq!(attempt, None);
        assert_eq!(probe.checks(), 4);
    }

    #[tokio::test]
    async fn test_http_probe_unreachable_is_unhealthy() {
        let probe = HttpHealthProbe::new(Duration::from_millis(200)).unwrap();
        assert!(!probe.check("http://127.0.0.1:9/health").await);
    }
}
