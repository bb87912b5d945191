//! Blue-green staging: deploy the current code, the previous release, then
//! the current code again, and always leave the working tree where it was.

use super::plan::{PipelineKind, PipelineOptions, PipelinePlan};
use super::runner::{PipelineRunSummary, PipelineRunner};
use super::vcs::{select_previous_release, OriginalRef, Vcs};
use crate::context::RunIdentity;
use crate::errors::{CicdError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, Instrument};

/// Name under which restoring the original ref is registered for cleanup.
pub const RESTORE_CLEANUP_NAME: &str = "restore-ref";

/// Where a blue-green run is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlueGreenPhase {
    /// Nothing deployed yet.
    Idle,
    /// The current code is deployed as a release candidate.
    GreenDeployed,
    /// The previous release is deployed.
    BlueDeployed,
    /// The current code is deployed again.
    GreenRedeployed,
    /// All phases completed.
    Done,
    /// A phase failed.
    Failed,
}

impl fmt::Display for BlueGreenPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::GreenDeployed => "green-deployed",
            Self::BlueDeployed => "blue-deployed",
            Self::GreenRedeployed => "green-redeployed",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What a blue-green run did.
#[derive(Debug)]
pub struct BlueGreenReport {
    /// Identity of the run; phase runs are its children.
    pub identity: RunIdentity,
    /// The ref the working tree was on at the start.
    pub original_ref: Option<OriginalRef>,
    /// The release tag deployed as blue.
    pub previous_release: Option<String>,
    /// The version declared by that release.
    pub previous_version: Option<String>,
    /// Phases reached, in order.
    pub phases: Vec<BlueGreenPhase>,
    /// Summaries of the deployment runs.
    pub runs: Vec<PipelineRunSummary>,
    /// Why the working tree could not be restored, if it could not.
    pub restoration_failure: Option<String>,
    /// The error that ended the run.
    pub error: Option<CicdError>,
}

impl BlueGreenReport {
    fn new(identity: RunIdentity) -> Self {
        Self {
            identity,
            original_ref: None,
            previous_release: None,
            previous_version: None,
            phases: vec![BlueGreenPhase::Idle],
            runs: Vec::new(),
            restoration_failure: None,
            error: None,
        }
    }

    fn advance(&mut self, phase: BlueGreenPhase) {
        info!(phase = %phase, "Blue-green phase reached");
        self.phases.push(phase);
    }

    /// The last phase reached.
    #[must_use]
    pub fn final_phase(&self) -> BlueGreenPhase {
        self.phases.last().copied().unwrap_or(BlueGreenPhase::Idle)
    }

    /// Returns true if all phases completed.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.final_phase() == BlueGreenPhase::Done
    }

    /// Converts the report into a `Result`, keeping it on success.
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

/// Drives the three deployment phases.
pub struct BlueGreenController {
    runner: Arc<PipelineRunner>,
    vcs: Arc<dyn Vcs>,
    options: PipelineOptions,
}

impl fmt::Debug for BlueGreenController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlueGreenController")
            .field("runner", &self.runner)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl BlueGreenController {
    /// Creates a controller. `options` apply to every phase except for the
    /// release-candidate flag, which each phase sets itself.
    #[must_use]
    pub fn new(runner: Arc<PipelineRunner>, vcs: Arc<dyn Vcs>, options: PipelineOptions) -> Self {
        Self { runner, vcs, options }
    }

    /// Runs all phases.
    ///
    /// Once the working tree has left its original ref, every exit path
    /// checks it out again. A failed restoration is reported but never
    /// replaces the error of a failed phase.
    pub async fn run(&self) -> BlueGreenReport {
        let identity = RunIdentity::new(PipelineKind::BlueGreenStaging.name());
        let span = info_span!("blue_green", run_id = %identity.short_id());
        async {
            let mut report = BlueGreenReport::new(identity);
            if let Err(e) = self.drive(&mut report).await {
                error!(error = %e, phase = %report.final_phase(), "Blue-green staging failed");
                report.phases.push(BlueGreenPhase::Failed);
                report.error = Some(e);
            }
            report
        }
        .instrument(span)
        .await
    }

    async fn drive(&self, report: &mut BlueGreenReport) -> Result<()> {
        let original = self.vcs.current_ref().await?;
        report.original_ref = Some(original.clone());

        let tags = self.vcs.tags().await?;
        let previous = select_previous_release(&tags)
            .ok_or_else(|| CicdError::precondition("no release tag found; blue-green staging needs a previous release"))?
            .to_string();
        report.previous_release = Some(previous.clone());
        info!(original = %original, previous = %previous, "Blue-green staging started");

        let green_options = self.options.clone().with_release_candidate(true);
        let green = PipelinePlan::deployment(self.runner.config(), &green_options)?;

        self.deploy(report, &green, "green").await?;
        report.advance(BlueGreenPhase::GreenDeployed);

        self.register_restore(&original);
        if let Err(e) = self.deploy_previous(report, &previous).await {
            if let Err(restoration) = self.restore(report, &original).await {
                debug!(error = %restoration, "Phase error takes precedence over restoration error");
            }
            return Err(e);
        }
        report.advance(BlueGreenPhase::BlueDeployed);

        self.restore(report, &original).await?;
        self.deploy(report, &green, "green-again").await?;
        report.advance(BlueGreenPhase::GreenRedeployed);
        report.advance(BlueGreenPhase::Done);
        Ok(())
    }

    /// Deploys the release at `tag` under the version it declares. The
    /// plan is built only after checkout, from that tree's version file.
    async fn deploy_previous(&self, report: &mut BlueGreenReport, tag: &str) -> Result<()> {
        self.vcs.checkout(tag).await?;
        let version = self.vcs.read_version().await?;
        info!(tag, version = %version, "Checked out previous release");
        report.previous_version = Some(version.clone());

        let blue = PipelinePlan::release_deployment(self.runner.config(), &self.options, &version)?;
        self.deploy(report, &blue, "blue").await
    }

    async fn deploy(&self, report: &mut BlueGreenReport, plan: &PipelinePlan, label: &str) -> Result<()> {
        info!(deployment = label, "Deploying");
        let identity = report.identity.child(plan.name());
        let mut run = self.runner.execute_as(plan, identity).await;
        let error = run.error.take();
        report.runs.push(run.summary());
        error.map_or(Ok(()), Err)
    }

    fn register_restore(&self, original: &OriginalRef) {
        let vcs = Arc::clone(&self.vcs);
        let revision = original.revision().to_string();
        self.runner.cleanup().register(RESTORE_CLEANUP_NAME, move || {
            vcs.checkout_blocking(&revision).map_err(|e| e.to_string())
        });
    }

    async fn restore(&self, report: &mut BlueGreenReport, original: &OriginalRef) -> Result<()> {
        self.runner.cleanup().unregister_by_name(RESTORE_CLEANUP_NAME);
        match self.vcs.checkout(original.revision()).await {
            Ok(()) => {
                info!(original = %original, "Working tree restored");
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                error!(
                    original = %original,
                    reason = %reason,
                    "Working tree left off its original ref; check it out by hand before the next run"
                );
                report.restoration_failure = Some(reason.clone());
                Err(CicdError::StateRestoration {
                    original_ref: original.to_string(),
                    reason,
                })
            }
        }
    }
}
