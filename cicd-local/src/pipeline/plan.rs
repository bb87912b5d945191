//! The named pipelines as fixed, ordered plans of stage invocations.
//!
//! Plans are built up front from the configuration and the options of one
//! invocation; building one never runs anything, so every branch condition
//! is unit-testable.

use crate::config::Config;
use crate::context::{ArtifactSlot, ContextStore};
use crate::core::{ArgValue, StageArgs, StageName};
use crate::errors::{CicdError, Result};
use crate::secrets::{SecretRequirement, KUBECONFIG_FILE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// One of the named pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineKind {
    /// Build, test and, on merge, deliver.
    ContinuousIntegration,
    /// Build and deliver.
    Delivery,
    /// Deploy and validate.
    Deployment,
    /// Deploy, validate and run integration tests through a tunnel.
    AcceptanceTesting,
    /// Three-phase current/previous/current deployment.
    BlueGreenStaging,
}

impl PipelineKind {
    /// Name used on the command line and in log file names.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::ContinuousIntegration => "continuous-integration",
            Self::Delivery => "delivery",
            Self::Deployment => "deployment",
            Self::AcceptanceTesting => "acceptance-testing",
            Self::BlueGreenStaging => "blue-green-staging",
        }
    }

    /// Returns true if the pipeline talks to a cluster.
    #[must_use]
    pub fn needs_cluster(self) -> bool {
        matches!(
            self,
            Self::Deployment | Self::AcceptanceTesting | Self::BlueGreenStaging
        )
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What kind of change started a continuous-integration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// A commit on a working branch.
    #[default]
    Commit,
    /// A merge into the main line.
    Merge,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Commit => write!(f, "commit"),
            Self::Merge => write!(f, "merge"),
        }
    }
}

/// Options of one pipeline invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineOptions {
    /// Trigger classification.
    pub trigger: Trigger,
    /// Mark the produced artifacts as a release candidate.
    pub release_candidate: bool,
    /// Stages the operator asked to skip.
    pub skip: BTreeSet<StageName>,
    /// Override of the image registry passed to deliver and deploy.
    pub container_repository: Option<String>,
    /// Override of the chart repository passed to deliver and deploy.
    pub helm_repository: Option<String>,
    /// Namespace override for tunnels and diagnostics.
    pub namespace: Option<String>,
}

impl PipelineOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the trigger.
    #[must_use]
    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = trigger;
        self
    }

    /// Sets the release-candidate flag.
    #[must_use]
    pub fn with_release_candidate(mut self, release_candidate: bool) -> Self {
        self.release_candidate = release_candidate;
        self
    }

    /// Adds a stage to skip.
    #[must_use]
    pub fn with_skip(mut self, stage: StageName) -> Self {
        self.skip.insert(stage);
        self
    }

    /// Sets the repository overrides.
    #[must_use]
    pub fn with_repositories(mut self, container: Option<String>, helm: Option<String>) -> Self {
        self.container_repository = container;
        self.helm_repository = helm;
        self
    }

    /// Sets the namespace override.
    #[must_use]
    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }

    fn skips(&self, stage: StageName) -> bool {
        self.skip.contains(&stage)
    }
}

/// A stage invocation within a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStep {
    /// The stage.
    pub stage: StageName,
    /// Arguments, with artifact references still unresolved.
    pub args: StageArgs,
    /// Whether the returned file is exported to the context store.
    pub export: bool,
    /// Set when the stage is skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl StageStep {
    fn new(stage: StageName, args: StageArgs) -> Self {
        Self {
            stage,
            args,
            export: false,
            skip_reason: None,
        }
    }

    fn exported(mut self) -> Self {
        self.export = true;
        self
    }

    fn skipped(mut self, reason: impl Into<String>) -> Self {
        self.skip_reason = Some(reason.into());
        self
    }
}

/// One step of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum PlanStep {
    /// Invoke a stage.
    Invoke(StageStep),
    /// Open a tunnel to the deployed service and wait until it is healthy.
    OpenTunnel,
}

/// A fully determined pipeline run, before execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelinePlan {
    /// The pipeline.
    pub kind: PipelineKind,
    /// The trigger, for continuous integration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<Trigger>,
    /// Whether privileged stages need injected secrets.
    pub secrets: SecretRequirement,
    /// Namespace override for the tunnel.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Steps in execution order.
    pub steps: Vec<PlanStep>,
}

impl PipelinePlan {
    /// Builds the plan of `kind`.
    ///
    /// # Errors
    ///
    /// Returns a precondition error for an unsupported skip request, or for
    /// blue-green staging, which is driven by its own controller.
    pub fn for_kind(
        kind: PipelineKind,
        config: &Config,
        options: &PipelineOptions,
        store: &ContextStore,
    ) -> Result<Self> {
        match kind {
            PipelineKind::ContinuousIntegration => Self::continuous_integration(config, options),
            PipelineKind::Delivery => Self::delivery(config, options, store),
            PipelineKind::Deployment => Self::deployment(config, options),
            PipelineKind::AcceptanceTesting => Self::acceptance_testing(config, options),
            PipelineKind::BlueGreenStaging => Err(CicdError::precondition(
                "blue-green staging has no linear plan; run it through the staging controller",
            )),
        }
    }

    /// Build → UnitTest → Deliver (merge only).
    ///
    /// A merge forces the release-candidate flag on every stage and requires
    /// secrets; a commit runs unprivileged if secrets are unavailable.
    ///
    /// # Errors
    ///
    /// Returns a precondition error if any stage is asked to be skipped.
    pub fn continuous_integration(config: &Config, options: &PipelineOptions) -> Result<Self> {
        reject_skips(PipelineKind::ContinuousIntegration, options, &[])?;

        let merge = options.trigger == Trigger::Merge;
        let release_candidate = merge || options.release_candidate;

        let mut steps = vec![
            PlanStep::Invoke(StageStep::new(StageName::Build, build_args(config, release_candidate)).exported()),
            PlanStep::Invoke(StageStep::new(
                StageName::UnitTest,
                StageArgs::new()
                    .with_source(&config.source_dir)
                    .with("buildArtifact", ArgValue::Artifact(ArtifactSlot::BuildArtifact))
                    .with_flag("releaseCandidate", release_candidate),
            )),
        ];
        if merge {
            steps.push(PlanStep::Invoke(
                StageStep::new(StageName::Deliver, deliver_args(config, options, release_candidate)).exported(),
            ));
        }

        Ok(Self {
            kind: PipelineKind::ContinuousIntegration,
            trigger: Some(options.trigger),
            secrets: if merge {
                SecretRequirement::Required
            } else {
                SecretRequirement::Optional
            },
            namespace: options.namespace.clone(),
            steps,
        })
    }

    /// Build → Deliver. Build may be skipped when an earlier build artifact
    /// is available.
    ///
    /// # Errors
    ///
    /// Returns a precondition error if Build is skipped without an artifact
    /// to deliver, or if another stage is asked to be skipped.
    pub fn delivery(config: &Config, options: &PipelineOptions, store: &ContextStore) -> Result<Self> {
        reject_skips(PipelineKind::Delivery, options, &[StageName::Build])?;

        let mut build = StageStep::new(StageName::Build, build_args(config, options.release_candidate)).exported();
        if options.skips(StageName::Build) {
            let Some(existing) = store.latest_path(ArtifactSlot::BuildArtifact) else {
                return Err(CicdError::precondition(format!(
                    "cannot skip build: no build artifact at {}",
                    store.canonical_path(ArtifactSlot::BuildArtifact).display()
                )));
            };
            build = build.skipped(format!("reusing {}", existing.display()));
        }

        Ok(Self {
            kind: PipelineKind::Delivery,
            trigger: None,
            secrets: SecretRequirement::Required,
            namespace: options.namespace.clone(),
            steps: vec![
                PlanStep::Invoke(build),
                PlanStep::Invoke(
                    StageStep::new(
                        StageName::Deliver,
                        deliver_args(config, options, options.release_candidate),
                    )
                    .exported(),
                ),
            ],
        })
    }

    /// Deploy → Validate. Validate may be skipped.
    ///
    /// # Errors
    ///
    /// Returns a precondition error if Deploy is asked to be skipped.
    pub fn deployment(config: &Config, options: &PipelineOptions) -> Result<Self> {
        Self::deploy_then_validate(config, options, deploy_args(config, options, options.release_candidate))
    }

    /// Deploy → Validate of a published release, as checked out from its
    /// tag. Deploy gets the declared `version` instead of a delivery
    /// context, so it never picks up the artifacts of the current candidate.
    ///
    /// # Errors
    ///
    /// Returns a precondition error if Deploy is asked to be skipped.
    pub fn release_deployment(config: &Config, options: &PipelineOptions, version: &str) -> Result<Self> {
        let options = options.clone().with_release_candidate(false);
        let deploy = StageArgs::new()
            .with_source(&config.source_dir)
            .with("version", ArgValue::Str(version.to_string()))
            .with_optional_str("containerRepository", options.container_repository.as_deref())
            .with_optional_str("helmRepository", options.helm_repository.as_deref())
            .with_flag("releaseCandidate", false);
        Self::deploy_then_validate(config, &options, deploy)
    }

    fn deploy_then_validate(config: &Config, options: &PipelineOptions, deploy: StageArgs) -> Result<Self> {
        reject_skips(PipelineKind::Deployment, options, &[StageName::Validate])?;

        let mut validate = StageStep::new(
            StageName::Validate,
            validate_args(config, options.release_candidate),
        )
        .exported();
        if options.skips(StageName::Validate) {
            validate = validate.skipped("skipped by operator");
        }

        Ok(Self {
            kind: PipelineKind::Deployment,
            trigger: None,
            secrets: SecretRequirement::Required,
            namespace: options.namespace.clone(),
            steps: vec![
                PlanStep::Invoke(StageStep::new(StageName::Deploy, deploy).exported()),
                PlanStep::Invoke(validate),
            ],
        })
    }

    /// Deploy (skippable) → Validate → tunnel → IntegrationTest, always as a
    /// release candidate.
    ///
    /// # Errors
    ///
    /// Returns a precondition error if a stage other than Deploy is asked to
    /// be skipped.
    pub fn acceptance_testing(config: &Config, options: &PipelineOptions) -> Result<Self> {
        reject_skips(PipelineKind::AcceptanceTesting, options, &[StageName::Deploy])?;

        let mut deploy = StageStep::new(StageName::Deploy, deploy_args(config, options, true)).exported();
        if options.skips(StageName::Deploy) {
            deploy = deploy.skipped("skipped by operator, testing the current deployment");
        }

        let integration_args = StageArgs::new()
            .with_source(&config.source_dir)
            .with("kubeconfig", ArgValue::File(config.privileged_dir.join(KUBECONFIG_FILE)))
            .with("deploymentContext", ArgValue::Artifact(ArtifactSlot::DeploymentContext))
            .with("validationContext", ArgValue::Artifact(ArtifactSlot::ValidationContext))
            .with_flag("releaseCandidate", true);

        Ok(Self {
            kind: PipelineKind::AcceptanceTesting,
            trigger: None,
            secrets: SecretRequirement::Required,
            namespace: options.namespace.clone(),
            steps: vec![
                PlanStep::Invoke(deploy),
                PlanStep::Invoke(StageStep::new(StageName::Validate, validate_args(config, true)).exported()),
                PlanStep::OpenTunnel,
                PlanStep::Invoke(StageStep::new(StageName::IntegrationTest, integration_args)),
            ],
        })
    }

    /// The pipeline name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Stage steps in order, skipped ones included.
    pub fn stage_steps(&self) -> impl Iterator<Item = &StageStep> {
        self.steps.iter().filter_map(|step| match step {
            PlanStep::Invoke(stage) => Some(stage),
            PlanStep::OpenTunnel => None,
        })
    }

    /// Stages that will actually be invoked, in order.
    #[must_use]
    pub fn invoked_stages(&self) -> Vec<StageName> {
        self.stage_steps()
            .filter(|s| s.skip_reason.is_none())
            .map(|s| s.stage)
            .collect()
    }

    /// Returns true if any invoked stage needs the privileged module.
    #[must_use]
    pub fn has_privileged_stage(&self) -> bool {
        self.invoked_stages().iter().any(|s| s.is_privileged())
    }
}

fn reject_skips(kind: PipelineKind, options: &PipelineOptions, skippable: &[StageName]) -> Result<()> {
    match options.skip.iter().find(|stage| !skippable.contains(stage)) {
        Some(stage) => Err(CicdError::precondition(format!(
            "stage '{stage}' cannot be skipped in pipeline '{kind}'"
        ))),
        None => Ok(()),
    }
}

fn build_args(config: &Config, release_candidate: bool) -> StageArgs {
    StageArgs::new()
        .with_source(&config.source_dir)
        .with_flag("releaseCandidate", release_candidate)
}

fn deliver_args(config: &Config, options: &PipelineOptions, release_candidate: bool) -> StageArgs {
    StageArgs::new()
        .with_source(&config.source_dir)
        .with("buildArtifact", ArgValue::Artifact(ArtifactSlot::BuildArtifact))
        .with_optional_str("containerRepository", options.container_repository.as_deref())
        .with_optional_str("helmRepository", options.helm_repository.as_deref())
        .with_flag("releaseCandidate", release_candidate)
}

fn deploy_args(config: &Config, options: &PipelineOptions, release_candidate: bool) -> StageArgs {
    StageArgs::new()
        .with_source(&config.source_dir)
        .with("deliveryContext", ArgValue::Artifact(ArtifactSlot::DeliveryContext))
        .with_optional_str("containerRepository", options.container_repository.as_deref())
        .with_optional_str("helmRepository", options.helm_repository.as_deref())
        .with_flag("releaseCandidate", release_candidate)
}

fn validate_args(config: &Config, release_candidate: bool) -> StageArgs {
    StageArgs::new()
        .with_source(&config.source_dir)
        .with("deploymentContext", ArgValue::Artifact(ArtifactSlot::DeploymentContext))
        .with_flag("releaseCandidate", release_candidate)
}
