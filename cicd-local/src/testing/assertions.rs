//! Test assertions for pipeline runs.

use crate::core::{StageName, StageStatus};
use crate::errors::ErrorCategory;
use crate::pipeline::PipelineRun;

/// Asserts that the run succeeded.
pub fn assert_run_succeeded(run: &PipelineRun) {
    assert!(
        run.succeeded(),
        "Expected {} to succeed, got: {:?}",
        run.kind,
        run.error
    );
}

/// Asserts that the run failed with an error of `category`.
pub fn assert_run_failed_with(run: &PipelineRun, category: ErrorCategory) {
    let actual = run.error.as_ref().map(crate::errors::CicdError::category);
    assert_eq!(
        actual,
        Some(category),
        "Expected {} to fail with {category}, got {:?}",
        run.kind,
        run.error
    );
}

/// Asserts the stages that were invoked, in order.
pub fn assert_invoked(run: &PipelineRun, expected: &[StageName]) {
    assert_eq!(
        run.invoked_stages(),
        expected,
        "Unexpected stages invoked by {}",
        run.kind
    );
}

/// Asserts the recorded status of `stage`.
pub fn assert_stage_status(run: &PipelineRun, stage: StageName, expected: StageStatus) {
    let actual = run.records.iter().find(|r| r.stage == stage).map(|r| r.status);
    assert_eq!(
        actual,
        Some(expected),
        "Expected {stage} to be {expected:?}, got {actual:?}"
    );
}
