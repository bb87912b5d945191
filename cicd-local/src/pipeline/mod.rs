//! Pipeline composition and execution.
//!
//! This module provides:
//! - Plans of the named pipelines
//! - The runner executing plans fail-fast
//! - Tunnels and health polling for acceptance testing
//! - Version control and the blue-green staging controller

mod blue_green;
mod plan;
mod runner;
mod tunnel;
mod vcs;


pub use blue_green::{BlueGreenController, BlueGreenPhase, BlueGreenReport, RESTORE_CLEANUP_NAME};
pub use plan::{PipelineKind, PipelineOptions, PipelinePlan, PlanStep, StageStep, Trigger};
pub use runner::{PipelineRun, PipelineRunSummary, PipelineRunner};
pub use tunnel::{
    wait_until_healthy, HealthProbe, HttpHealthProbe, KubectlTunnelProvider, PortForward, Tunnel,
    TunnelProvider, TunnelTarget, TEARDOWN_CLEANUP_NAME,
};
pub use vcs::{compare_versions, select_previous_release, GitCli, OriginalRef, Vcs, VERSION_FILE};
