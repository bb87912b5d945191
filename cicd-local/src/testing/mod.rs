//! Testing utilities for cicd-local pipelines.
//!
//! This module provides:
//! - Recording and scripted doubles for the backend, version control,
//!   tunnels and health probes
//! - Assertions over finished runs

mod assertions;
mod mocks;

pub use assertions::{assert_invoked, assert_run_failed_with, assert_run_succeeded, assert_stage_status};
pub use mocks::{
    FakeTunnelProvider, FakeVcs, RecordingBackend, ScriptedHealthProbe, VcsEvent, DEFAULT_DEPLOYMENT_CONTEXT,
};
