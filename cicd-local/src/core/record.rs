//! Outcome records for stage invocations.

use super::StageName;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// The execution status of a stage invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Stage completed successfully.
    Ok,
    /// Stage was skipped.
    Skip,
    /// Stage was cancelled.
    Cancel,
    /// Stage failed.
    Fail,
    /// Stage has not started.
    #[default]
    Pending,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Skip => write!(f, "skip"),
            Self::Cancel => write!(f, "cancel"),
            Self::Fail => write!(f, "fail"),
            Self::Pending => write!(f, "pending"),
        }
    }
}

impl StageStatus {
    /// Returns true if the status indicates success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Ok | Self::Skip)
    }

    /// Returns true if the status indicates failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Fail | Self::Cancel)
    }
}

/// What happened to one stage within a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageInvocationRecord {
    /// The stage.
    pub stage: StageName,
    /// Final status.
    pub status: StageStatus,
    /// When the invocation started.
    pub started_at: DateTime<Utc>,
    /// When the invocation ended.
    pub ended_at: DateTime<Utc>,
    /// Stage log file, retained after the run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    /// Context artifact written by the stage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<PathBuf>,
    /// Error message if failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Skip reason if skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl StageInvocationRecord {
    /// Creates a successful record.
    #[must_use]
    pub fn ok(
        stage: StageName,
        started_at: DateTime<Utc>,
        log_path: PathBuf,
        artifact_path: Option<PathBuf>,
    ) -> Self {
        Self {
            stage,
            status: StageStatus::Ok,
            started_at,
            ended_at: Utc::now(),
            log_path: Some(log_path),
            artifact_path,
            error: None,
            skip_reason: None,
        }
    }

    /// Creates a failed record.
    #[must_use]
    pub fn failed(
        stage: StageName,
        started_at: DateTime<Utc>,
        log_path: Option<PathBuf>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            stage,
            status: StageStatus::Fail,
            started_at,
            ended_at: Utc::now(),
            log_path,
            artifact_path: None,
            error: Some(error.into()),
            skip_reason: None,
        }
    }

    /// Creates a skipped record.
    #[must_use]
    pub fn skipped(stage: StageName, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            stage,
            status: StageStatus::Skip,
            started_at: now,
            ended_at: now,
            log_path: None,
            artifact_path: None,
            error: None,
            skip_reason: Some(reason.into()),
        }
    }

    /// Returns the duration in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        (self.ended_at - self.started_at).num_milliseconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(StageStatus::Ok.to_string(), "ok");
        assert_eq!(StageStatus::Fail.to_string(), "fail");
        assert_eq!(StageStatus::default(), StageStatus::Pending);
    }

    #[test]
    fn test_status_predicates() {
        assert!(StageStatus::Skip.is_success());
        assert!(StageStatus::Cancel.is_failure());
        assert!(!StageStatus::Pending.is_success());
        assert!(!StageStatus::Pending.is_failure());
    }

    #[test]
    fn test_record_duration() {
        let started = Utc::now();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let record = StageInvocationRecord::ok(StageName::Build, started, "build.log".into(), None);

        assert!(record.duration_ms() >= 10);
        assert_eq!(record.status, StageStatus::Ok);
    }

    #[test]
    fn test_skipped_record_serialization() {
        let record = StageInvocationRecord::skipped(StageName::Validate, "skipped by operator");
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["stage"], "validate");
        assert_eq!(json["status"], "skip");
        assert!(json.get("error").is_none());
    }
}
