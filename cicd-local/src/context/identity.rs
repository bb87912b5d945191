//! Run identity for tracking pipeline executions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIdentity {
    /// The unique ID for this pipeline run.
    pub pipeline_run_id: Uuid,

    /// The pipeline being run.
    pub pipeline: String,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// The run this one was started from, for sub-pipelines.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<Uuid>,
}

impl RunIdentity {
    /// Creates a new run identity with a generated run ID.
    #[must_use]
    pub fn new(pipeline: impl Into<String>) -> Self {
        Self {
            pipeline_run_id: Uuid::new_v4(),
            pipeline: pipeline.into(),
            started_at: Utc::now(),
            parent_run_id: None,
        }
    }

    /// Creates the identity of a sub-pipeline started by this run.
    #[must_use]
    pub fn child(&self, pipeline: impl Into<String>) -> Self {
        Self {
            parent_run_id: Some(self.pipeline_run_id),
            ..Self::new(pipeline)
        }
    }

    /// Short form of the run ID used in file names and log fields.
    #[must_use]
    pub fn short_id(&self) -> String {
        self.pipeline_run_id.simple().to_string()[..8].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_identity() {
        let identity = RunIdentity::new("delivery");
        assert_eq!(identity.pipeline, "delivery");
        assert_eq!(identity.pipeline_run_id.get_version_num(), 4);
        assert!(identity.parent_run_id.is_none());
        assert_eq!(identity.short_id().len(), 8);
    }

    #[test]
    fn test_child_identity() {
        let parent = RunIdentity::new("blue-green-staging");
        let child = parent.child("deployment");

        assert_eq!(child.parent_run_id, Some(parent.pipeline_run_id));
        assert_ne!(child.pipeline_run_id, parent.pipeline_run_id);
    }
}
