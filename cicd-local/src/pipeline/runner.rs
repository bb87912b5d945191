//! Executes pipeline plans.
//!
//! A run acquires secrets according to the plan, invokes its steps one at a
//! time and stops at the first failure. Whatever the outcome, the resources
//! the run registered (the privileged module, the tunnel) are released
//! before the run returns, and a JSON summary is written next to the logs.

use super::plan::{PipelineKind, PipelineOptions, PipelinePlan, PlanStep, StageStep, Trigger};
use super::tunnel::{
    wait_until_healthy, HealthProbe, HttpHealthProbe, KubectlTunnelProvider, TunnelProvider, TunnelTarget,
    TEARDOWN_CLEANUP_NAME,
};
use crate::backend::ExecutionBackend;
use crate::cancellation::CleanupRegistry;
use crate::config::Config;
use crate::context::{ArtifactSlot, ContextStore, RunIdentity};
use crate::core::{StageInvocationRecord, StageName};
use crate::errors::{CicdError, CleanupFailure, ErrorCategory, Result};
use crate::invoker::StageInvoker;
use crate::observability::SpanTimer;
use crate::secrets::{SecretInjector, SecretRequirement, SecretStore, ERASE_CLEANUP_NAME};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// The outcome of one pipeline run.
#[derive(Debug)]
pub struct PipelineRun {
    /// Identity of the run.
    pub identity: RunIdentity,
    /// The pipeline that ran.
    pub kind: PipelineKind,
    /// Trigger, for continuous integration.
    pub trigger: Option<Trigger>,
    /// One record per stage that was reached, in order.
    pub records: Vec<StageInvocationRecord>,
    /// Whether the privileged module was available.
    pub privileged: bool,
    /// Cleanup actions that failed while the run was terminating.
    pub cleanup_failures: Vec<CleanupFailure>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: f64,
    /// Where the summary was written.
    pub summary_path: Option<PathBuf>,
    /// The error that ended the run.
    pub error: Option<CicdError>,
}

impl PipelineRun {
    /// Returns true if every reached stage succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    /// Stages that were actually invoked, in order.
    #[must_use]
    pub fn invoked_stages(&self) -> Vec<StageName> {
        self.records
            .iter()
            .filter(|r| r.skip_reason.is_none())
            .map(|r| r.stage)
            .collect()
    }

    /// Serializable view of the run.
    #[must_use]
    pub fn summary(&self) -> PipelineRunSummary {
        PipelineRunSummary {
            run_id: self.identity.pipeline_run_id,
            parent_run_id: self.identity.parent_run_id,
            pipeline: self.kind,
            trigger: self.trigger,
            started_at: self.identity.started_at,
            duration_ms: self.duration_ms,
            succeeded: self.succeeded(),
            privileged: self.privileged,
            stages: self.records.clone(),
            cleanup_failures: self.cleanup_failures.clone(),
            error: self.error.as_ref().map(ToString::to_string),
            error_category: self.error.as_ref().map(CicdError::category),
        }
    }

    /// Converts the run into a `Result`, keeping the run on success.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the run.
    pub fn into_result(mut self) -> Result<Self> {
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }
}

/// The JSON document written for every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRunSummary {
    /// Run ID.
    pub run_id: Uuid,
    /// Run that started this one, for blue-green phases.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<Uuid>,
    /// The pipeline.
    pub pipeline: PipelineKind,
    /// Trigger, for continuous integration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<Trigger>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Duration in milliseconds.
    pub duration_ms: f64,
    /// Whether the run succeeded.
    pub succeeded: bool,
    /// Whether the privileged module was available.
    pub privileged: bool,
    /// Stage records.
    pub stages: Vec<StageInvocationRecord>,
    /// Cleanup failures.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cleanup_failures: Vec<CleanupFailure>,
    /// Error message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Error category.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
}

/// Runs pipeline plans against one configuration.
pub struct PipelineRunner {
    config: Config,
    invoker: StageInvoker,
    injector: SecretInjector,
    secrets: Arc<dyn SecretStore>,
    tunnels: Arc<dyn TunnelProvider>,
    probe: Arc<dyn HealthProbe>,
    cleanup: Arc<CleanupRegistry>,
}

impl std::fmt::Debug for PipelineRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRunner")
            .field("config", &self.config)
            .field("invoker", &self.invoker)
            .field("injector", &self.injector)
            .field("cleanup", &self.cleanup)
            .finish_non_exhaustive()
    }
}

impl PipelineRunner {
    /// Creates a runner that tunnels with `kubectl` and probes over HTTP.
    ///
    /// # Errors
    ///
    /// Returns a secret error if a configured template directory is unusable,
    /// or a precondition error if the HTTP client cannot be built.
    pub fn new(
        config: Config,
        backend: Arc<dyn ExecutionBackend>,
        secrets: Arc<dyn SecretStore>,
    ) -> Result<Self> {
        let store = Arc::new(ContextStore::new(&config.output_dir));
        let invoker = StageInvoker::new(backend, store, &config.module_dir);
        let injector = SecretInjector::from_config(&config)?;
        let tunnels = Arc::new(
            KubectlTunnelProvider::new(config.kubectl_bin.clone(), config.kubectl_context.clone())
                .with_kubeconfig(config.kubeconfig_path.clone()),
        );
        let probe = Arc::new(HttpHealthProbe::new(config.tunnel.probe_timeout())?);

        Ok(Self {
            config,
            invoker,
            injector,
            secrets,
            tunnels,
            probe,
            cleanup: Arc::new(CleanupRegistry::new()),
        })
    }

    /// Replaces the tunnel provider and health probe.
    #[must_use]
    pub fn with_tunnels(mut self, tunnels: Arc<dyn TunnelProvider>, probe: Arc<dyn HealthProbe>) -> Self {
        self.tunnels = tunnels;
        self.probe = probe;
        self
    }

    /// Shares a cleanup registry with the caller.
    #[must_use]
    pub fn with_cleanup(mut self, cleanup: Arc<CleanupRegistry>) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// Replaces the secret injector.
    #[must_use]
    pub fn with_injector(mut self, injector: SecretInjector) -> Self {
        self.injector = injector;
        self
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The context store of the run.
    #[must_use]
    pub fn store(&self) -> &ContextStore {
        self.invoker.store()
    }

    /// The cleanup registry of the run.
    #[must_use]
    pub fn cleanup(&self) -> &Arc<CleanupRegistry> {
        &self.cleanup
    }

    /// Builds the plan of `kind` for this runner's configuration.
    ///
    /// # Errors
    ///
    /// See [`PipelinePlan::for_kind`].
    pub fn plan(&self, kind: PipelineKind, options: &PipelineOptions) -> Result<PipelinePlan> {
        PipelinePlan::for_kind(kind, &self.config, options, self.store())
    }

    /// Runs `plan` and returns the finished run, successful or not.
    pub async fn execute(&self, plan: &PipelinePlan) -> PipelineRun {
        self.execute_as(plan, RunIdentity::new(plan.name())).await
    }

    /// Runs `plan` under a given identity.
    pub async fn execute_as(&self, plan: &PipelinePlan, identity: RunIdentity) -> PipelineRun {
        let span = info_span!("pipeline", pipeline = %plan.kind, run_id = %identity.short_id());
        self.run_plan(plan, identity).instrument(span).await
    }

    async fn run_plan(&self, plan: &PipelinePlan, identity: RunIdentity) -> PipelineRun {
        let timer = SpanTimer::start(plan.name());
        info!(trigger = ?plan.trigger, steps = plan.steps.len(), "Pipeline started");

        let mut run = PipelineRun {
            identity,
            kind: plan.kind,
            trigger: plan.trigger,
            records: Vec::new(),
            privileged: false,
            cleanup_failures: Vec::new(),
            duration_ms: 0.0,
            summary_path: None,
            error: None,
        };

        let requirement = if plan.has_privileged_stage() {
            plan.secrets
        } else {
            SecretRequirement::NotNeeded
        };
        let mut owned: Vec<&'static str> = Vec::new();
        match self
            .injector
            .acquire(requirement, self.secrets.as_ref(), &self.cleanup)
            .await
        {
            Ok(Some(_)) => {
                run.privileged = true;
                owned.push(ERASE_CLEANUP_NAME);
            }
            Ok(None) => {}
            Err(e) => run.error = Some(e),
        }

        if run.error.is_none() {
            for step in &plan.steps {
                let outcome = match step {
                    PlanStep::Invoke(step) => self.invoke_step(plan, step, &mut run.records).await,
                    PlanStep::OpenTunnel => {
                        owned.push(TEARDOWN_CLEANUP_NAME);
                        self.open_tunnel(plan).await
                    }
                };
                if let Err(e) = outcome {
                    run.error = Some(e);
                    break;
                }
            }
        }

        for name in owned.iter().rev() {
            if let Err(failure) = self.cleanup.run_named(name) {
                run.cleanup_failures.push(failure);
            }
        }

        run.duration_ms = timer.finish();
        run.summary_path = self.write_summary(&run);

        match &run.error {
            None => info!(duration_ms = run.duration_ms, "Pipeline succeeded"),
            Some(e) => error!(error = %e, category = %e.category(), "Pipeline failed"),
        }
        run
    }

    async fn invoke_step(
        &self,
        plan: &PipelinePlan,
        step: &StageStep,
        records: &mut Vec<StageInvocationRecord>,
    ) -> Result<()> {
        if let Some(reason) = &step.skip_reason {
            info!(stage = %step.stage, reason = %reason, "Stage skipped");
            records.push(StageInvocationRecord::skipped(step.stage, reason.clone()));
            return Ok(());
        }

        let started_at = Utc::now();
        match self
            .invoker
            .invoke(plan.name(), step.stage, step.args.clone(), step.export)
            .await
        {
            Ok(invocation) => {
                records.push(invocation.record);
                Ok(())
            }
            Err(e) => {
                let log_path = match &e {
                    CicdError::StageInvocation { log_path, .. } => Some(log_path.clone()),
                    _ => None,
                };
                records.push(StageInvocationRecord::failed(step.stage, started_at, log_path, e.to_string()));
                Err(e)
            }
        }
    }

    async fn open_tunnel(&self, plan: &PipelinePlan) -> Result<()> {
        let deployment = self.store().read(ArtifactSlot::DeploymentContext)?.ok_or_else(|| {
            CicdError::precondition(format!(
                "no deployment context at {} to open a tunnel to",
                self.store().canonical_path(ArtifactSlot::DeploymentContext).display()
            ))
        })?;
        let namespace = plan.namespace.as_deref().or(self.config.namespace.as_deref());
        let settings = &self.config.tunnel;
        let target = TunnelTarget::from_deployment(&deployment, namespace, settings.local_port)?;

        let mut tunnel = self.tunnels.open(&target).await?;
        self.cleanup.register(TEARDOWN_CLEANUP_NAME, move || tunnel.close());

        let url = target.local_url(&settings.health_path);
        info!(tunnel = %target, url = %url, "Waiting for target to become healthy");
        match wait_until_healthy(self.probe.as_ref(), &url, settings.max_attempts, settings.interval()).await {
            Some(_) => Ok(()),
            None => Err(CicdError::Readiness {
                target: format!("{url} via {target}"),
                attempts: settings.max_attempts,
                diagnostics: self.tunnels.diagnostics(&target.namespace).await,
            }),
        }
    }

    fn write_summary(&self, run: &PipelineRun) -> Option<PathBuf> {
        let written = self
            .store()
            .summary_path(&run.identity.pipeline_run_id.to_string())
            .and_then(|path| {
                let json = serde_json::to_vec_pretty(&run.summary())?;
                std::fs::write(&path, json)?;
                Ok(path)
            });
        match written {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(error = %e, "Cannot write run summary");
                None
            }
        }
    }
}
