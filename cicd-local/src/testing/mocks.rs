//! Test doubles for the external collaborators of a pipeline run.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::backend::{BackendCall, BackendOutcome, ExecutionBackend};
use crate::core::StageName;
use crate::errors::{CicdError, Result};
use crate::pipeline::{OriginalRef, Tunnel, TunnelProvider, TunnelTarget, Vcs};
use crate::pipeline::HealthProbe;

/// Deployment context written by default for `deploy`.
pub const DEFAULT_DEPLOYMENT_CONTEXT: &str = r#"{"endpoint":"http://goserv.default.svc.cluster.local:8080","releaseName":"goserv","namespace":"default"}"#;

fn default_export(stage: StageName) -> Vec<u8> {
    match stage {
        StageName::Build => b"build-artifact".to_vec(),
        StageName::Deliver => br#"{"imageReference":"registry.local/goserv:1.0.0","chartReference":"oci://registry.local/charts/goserv:1.0.0"}"#.to_vec(),
        StageName::Deploy => DEFAULT_DEPLOYMENT_CONTEXT.as_bytes().to_vec(),
        StageName::Validate => br#"{"status":"healthy","checks":["rollout","endpoint"]}"#.to_vec(),
        StageName::UnitTest | StageName::IntegrationTest => Vec::new(),
    }
}

/// A backend that records every call instead of running anything.
///
/// Calls succeed and export a plausible artifact unless a failure is
/// configured for the stage.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    calls: Mutex<Vec<BackendCall>>,
    failures: Mutex<HashMap<StageName, (u32, i32)>>,
    exports: Mutex<HashMap<StageName, Vec<u8>>>,
    silent: Mutex<Vec<StageName>>,
    require_files: AtomicBool,
    counts: Mutex<HashMap<StageName, u32>>,
}

impl RecordingBackend {
    /// Creates a backend where every call succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every call of `stage` with `exit_code`.
    #[must_use]
    pub fn fail_on(self, stage: StageName, exit_code: i32) -> Self {
        self.fail_nth(stage, 0, exit_code)
    }

    /// Fails the `nth` call (1-based) of `stage`; 0 fails every call.
    #[must_use]
    pub fn fail_nth(self, stage: StageName, nth: u32, exit_code: i32) -> Self {
        self.failures.lock().insert(stage, (nth, exit_code));
        self
    }

    /// Exports `bytes` for `stage` instead of the default artifact.
    #[must_use]
    pub fn with_export(self, stage: StageName, bytes: impl Into<Vec<u8>>) -> Self {
        self.exports.lock().insert(stage, bytes.into());
        self
    }

    /// Makes `stage` succeed without writing its export.
    #[must_use]
    pub fn without_export(self, stage: StageName) -> Self {
        self.silent.lock().push(stage);
        self
    }

    /// Fails calls whose `file://` arguments do not exist, the way the
    /// real backend does.
    #[must_use]
    pub fn require_files(self) -> Self {
        self.require_files.store(true, Ordering::SeqCst);
        self
    }

    /// All calls received, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().clone()
    }

    /// The stages called, in order.
    #[must_use]
    pub fn stages(&self) -> Vec<StageName> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| StageName::parse(&c.function))
            .collect()
    }

    /// Calls of one stage.
    #[must_use]
    pub fn calls_of(&self, stage: StageName) -> Vec<BackendCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.function == stage.function_name())
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ExecutionBackend for RecordingBackend {
    async fn execute(&self, call: &BackendCall, log_path: &Path) -> Result<BackendOutcome> {
        self.calls.lock().push(call.clone());
        std::fs::write(log_path, format!("{}\n", call.to_args().join(" ")))?;

        let Some(stage) = StageName::parse(&call.function) else {
            return Ok(BackendOutcome::failure(127));
        };
        let count = {
            let mut counts = self.counts.lock();
            let entry = counts.entry(stage).or_insert(0);
            *entry += 1;
            *entry
        };
        if self.require_files.load(Ordering::SeqCst) {
            let missing = call
                .flags
                .iter()
                .filter_map(|f| f.split_once("=file://").map(|(_, path)| Path::new(path)))
                .any(|path| !path.is_file());
            if missing {
                return Ok(BackendOutcome::failure(66));
            }
        }
        if let Some(&(nth, code)) = self.failures.lock().get(&stage) {
            if nth == 0 || nth == count {
                return Ok(BackendOutcome::failure(code));
            }
        }

        if self.silent.lock().contains(&stage) {
            return Ok(BackendOutcome::success());
        }
        if let Some(dest) = &call.export {
            let bytes = self
                .exports
                .lock()
                .get(&stage)
                .cloned()
                .unwrap_or_else(|| default_export(stage));
            std::fs::write(dest, bytes)?;
        }
        Ok(BackendOutcome::success())
    }
}

/// What a [`FakeVcs`] observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VcsEvent {
    /// A checkout of the given revision.
    Checkout(String),
    /// A version read at the given revision.
    ReadVersion(String),
}

/// An in-memory repository.
#[derive(Debug)]
pub struct FakeVcs {
    original: OriginalRef,
    head: Mutex<String>,
    tags: Vec<String>,
    versions: HashMap<String, String>,
    failing_checkouts: Mutex<Vec<String>>,
    events: Mutex<Vec<VcsEvent>>,
}

impl FakeVcs {
    /// Creates a repository on branch `branch` with the given tags.
    #[must_use]
    pub fn on_branch(branch: &str, tags: &[&str]) -> Self {
        Self::new(OriginalRef::Branch(branch.to_string()), tags)
    }

    /// Creates a repository with a detached HEAD.
    #[must_use]
    pub fn detached(sha: &str, tags: &[&str]) -> Self {
        Self::new(OriginalRef::Detached(sha.to_string()), tags)
    }

    fn new(original: OriginalRef, tags: &[&str]) -> Self {
        let versions = tags
            .iter()
            .map(|t| ((*t).to_string(), t.trim_start_matches('v').to_string()))
            .collect();
        Self {
            head: Mutex::new(original.revision().to_string()),
            original,
            tags: tags.iter().map(ToString::to_string).collect(),
            versions,
            failing_checkouts: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Makes checkouts of `revision` fail.
    #[must_use]
    pub fn fail_checkout(self, revision: &str) -> Self {
        self.failing_checkouts.lock().push(revision.to_string());
        self
    }

    /// The revision currently checked out.
    #[must_use]
    pub fn head(&self) -> String {
        self.head.lock().clone()
    }

    /// Everything that happened, in order.
    #[must_use]
    pub fn events(&self) -> Vec<VcsEvent> {
        self.events.lock().clone()
    }

    /// Revisions checked out, in order.
    #[must_use]
    pub fn checkouts(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                VcsEvent::Checkout(rev) => Some(rev.clone()),
                VcsEvent::ReadVersion(_) => None,
            })
            .collect()
    }
}

impl FakeVcs {
    fn switch_to(&self, revision: &str) -> Result<()> {
        self.events.lock().push(VcsEvent::Checkout(revision.to_string()));
        if self.failing_checkouts.lock().iter().any(|r| r == revision) {
            return Err(CicdError::precondition(format!("checkout of {revision} refused")));
        }
        *self.head.lock() = revision.to_string();
        Ok(())
    }
}

#[async_trait]
impl Vcs for FakeVcs {
    async fn current_ref(&self) -> Result<OriginalRef> {
        Ok(self.original.clone())
    }

    async fn tags(&self) -> Result<Vec<String>> {
        Ok(self.tags.clone())
    }

    async fn checkout(&self, revision: &str) -> Result<()> {
        self.switch_to(revision)
    }

    fn checkout_blocking(&self, revision: &str) -> Result<()> {
        self.switch_to(revision)
    }

    async fn read_version(&self) -> Result<String> {
        let head = self.head();
        self.events.lock().push(VcsEvent::ReadVersion(head.clone()));
        self.versions
            .get(&head)
            .cloned()
            .ok_or_else(|| CicdError::precondition(format!("no VERSION at {head}")))
    }
}

/// A tunnel provider that opens nothing and counts open and closed tunnels.
#[derive(Debug, Default)]
pub struct FakeTunnelProvider {
    opened: Mutex<Vec<TunnelTarget>>,
    closed: Arc<AtomicU32>,
    diagnostics_requests: AtomicU32,
}

impl FakeTunnelProvider {
    /// Creates a provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Targets of every tunnel opened.
    #[must_use]
    pub fn opened(&self) -> Vec<TunnelTarget> {
        self.opened.lock().clone()
    }

    /// Number of tunnels closed.
    #[must_use]
    pub fn closed(&self) -> u32 {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of diagnostics dumps requested.
    #[must_use]
    pub fn diagnostics_requests(&self) -> u32 {
        self.diagnostics_requests.load(Ordering::SeqCst)
    }
}

struct FakeTunnel {
    closed: Option<Arc<AtomicU32>>,
}

impl Tunnel for FakeTunnel {
    fn close(&mut self) -> std::result::Result<(), String> {
        if let Some(counter) = self.closed.take() {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[async_trait]
impl TunnelProvider for FakeTunnelProvider {
    async fn open(&self, target: &TunnelTarget) -> Result<Box<dyn Tunnel>> {
        self.opened.lock().push(target.clone());
        Ok(Box::new(FakeTunnel {
            closed: Some(Arc::clone(&self.closed)),
        }))
    }

    async fn diagnostics(&self, namespace: &str) -> String {
        self.diagnostics_requests.fetch_add(1, Ordering::SeqCst);
        format!("NAME READY STATUS\npod/goserv-0 0/1 CrashLoopBackOff ({namespace})")
    }
}

/// A health probe that turns healthy after a fixed number of checks.
#[derive(Debug)]
pub struct ScriptedHealthProbe {
    healthy_from: Option<u32>,
    checks: AtomicU32,
}

impl ScriptedHealthProbe {
    /// Healthy from the `n`-th check on.
    #[must_use]
    pub fn healthy_after(n: u32) -> Self {
        Self {
            healthy_from: Some(n),
            checks: AtomicU32::new(0),
        }
    }

    /// Healthy on the first check.
    #[must_use]
    pub fn always() -> Self {
        Self::healthy_after(1)
    }

    /// Never healthy.
    #[must_use]
    pub fn never() -> Self {
        Self {
            healthy_from: None,
            checks: AtomicU32::new(0),
        }
    }

    /// Number of checks made.
    #[must_use]
    pub fn checks(&self) -> u32 {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for ScriptedHealthProbe {
    async fn check(&self, _url: &str) -> bool {
        let n = self.checks.fetch_add(1, Ordering::SeqCst) + 1;
        self.healthy_from.is_some_and(|from| n >= from)
    }
}
