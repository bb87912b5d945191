//! Error types for the cicd-local engine.
//!
//! The taxonomy follows the way a run can terminate: precondition failures,
//! secret failures, stage invocation failures, readiness timeouts and
//! failures to restore the working tree. Cleanup failures are collected
//! separately and never replace the error that ended the run.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for cicd-local operations.
#[derive(Debug, Error)]
pub enum CicdError {
    /// A precondition for starting the pipeline does not hold.
    #[error("Precondition failed: {message}")]
    Precondition {
        /// What is missing or invalid.
        message: String,
    },

    /// Secret lookup or injection failed.
    #[error("{0}")]
    Secret(#[from] SecretError),

    /// A stage exited non-zero in the execution backend.
    #[error(
        "Stage '{stage}' failed in pipeline '{pipeline}' (exit code {}); see {}",
        .exit_code.map_or_else(|| "none".to_string(), |c| c.to_string()),
        .log_path.display()
    )]
    StageInvocation {
        /// Backend function name of the failed stage.
        stage: String,
        /// The owning pipeline.
        pipeline: String,
        /// Exit code reported by the backend, if the process exited normally.
        exit_code: Option<i32>,
        /// Log file holding the full stage output.
        log_path: PathBuf,
    },

    /// Something never became ready within its retry ceiling.
    #[error("{target} not ready after {attempts} attempts\n{diagnostics}")]
    Readiness {
        /// What was being waited on.
        target: String,
        /// Number of attempts made.
        attempts: u32,
        /// Dump of the resource state at the time of giving up.
        diagnostics: String,
    },

    /// The working tree could not be put back on its original ref.
    #[error("Failed to restore working tree to '{original_ref}': {reason}")]
    StateRestoration {
        /// The ref the working tree was on when the run started.
        original_ref: String,
        /// Why restoration failed.
        reason: String,
    },

    /// A stage invocation violated the stage contract.
    #[error("{0}")]
    Contract(#[from] ContractError),

    /// The run was interrupted.
    #[error("Pipeline cancelled: {reason}")]
    Cancelled {
        /// Why the run was cancelled.
        reason: String,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CicdError {
    /// Creates a precondition error.
    #[must_use]
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition {
            message: message.into(),
        }
    }

    /// Returns the taxonomy bucket of this error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Precondition { .. }
            | Self::Contract(_)
            | Self::Secret(SecretError::UnsafeTarget { .. }) => ErrorCategory::Precondition,
            Self::Secret(_) => ErrorCategory::Secret,
            Self::StageInvocation { .. } | Self::Serialization(_) | Self::Io(_) => {
                ErrorCategory::StageInvocation
            }
            Self::Readiness { .. } => ErrorCategory::Readiness,
            Self::StateRestoration { .. } => ErrorCategory::StateRestoration,
            Self::Cancelled { .. } => ErrorCategory::Cancelled,
        }
    }

    /// Returns the process exit code for this error.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.category().exit_code()
    }
}

/// Coarse classification of run-terminating errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Missing tool, tag, version metadata or invalid configuration.
    Precondition,
    /// Required credential absent or injection failed.
    Secret,
    /// Non-zero exit from the execution backend.
    StageInvocation,
    /// Tunnel or rollout never became ready.
    Readiness,
    /// Working tree left away from its original ref.
    StateRestoration,
    /// Operator interruption.
    Cancelled,
}

impl ErrorCategory {
    /// Returns the process exit code used for this category.
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            Self::StageInvocation => 1,
            Self::Precondition => 2,
            Self::Secret => 3,
            Self::Readiness => 4,
            Self::StateRestoration => 5,
            Self::Cancelled => 130,
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Precondition => write!(f, "precondition"),
            Self::Secret => write!(f, "secret"),
            Self::StageInvocation => write!(f, "stage_invocation"),
            Self::Readiness => write!(f, "readiness"),
            Self::StateRestoration => write!(f, "state_restoration"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Errors raised by the secret store and the secret injector.
#[derive(Debug, Error)]
pub enum SecretError {
    /// A required secret is not present in the environment.
    #[error("Required secret '{key}' is not set (expected in ${env_var})")]
    Missing {
        /// Logical name of the secret.
        key: String,
        /// Environment variable it is read from.
        env_var: String,
    },

    /// The privileged template set could not be found.
    #[error("Privileged templates not found at {}", .path.display())]
    TemplatesMissing {
        /// Where the templates were expected.
        path: PathBuf,
    },

    /// The cluster configuration could not be captured.
    #[error("Kubeconfig unavailable: {reason}")]
    KubeconfigUnavailable {
        /// Why the capture failed.
        reason: String,
    },

    /// The module directory would overlap a directory it must never remove.
    #[error(
        "Refusing to use {} for the privileged module: it is or contains {}",
        .target.display(),
        .protected.display()
    )]
    UnsafeTarget {
        /// The configured module directory.
        target: PathBuf,
        /// The directory it overlaps.
        protected: PathBuf,
    },

    /// Writing or removing the materialized module failed.
    #[error("Secret injection IO error at {}: {source}", .path.display())]
    Io {
        /// The path being written or removed.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Error raised when stage arguments do not satisfy the stage contract.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContractError {
    /// An argument names a parameter the stage does not declare.
    #[error("Stage '{stage}' has no parameter '{param}'")]
    UnknownParameter {
        /// Stage being invoked.
        stage: String,
        /// The offending parameter.
        param: String,
    },

    /// A required parameter was not supplied.
    #[error("Stage '{stage}' requires parameter '{param}'")]
    MissingParameter {
        /// Stage being invoked.
        stage: String,
        /// The missing parameter.
        param: String,
    },

    /// An argument has the wrong kind for its parameter.
    #[error("Stage '{stage}' parameter '{param}' expects {expected}, got {actual}")]
    TypeMismatch {
        /// Stage being invoked.
        stage: String,
        /// The offending parameter.
        param: String,
        /// Declared type.
        expected: String,
        /// Supplied type.
        actual: String,
    },
}

/// A cleanup action that failed while a run was terminating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupFailure {
    /// Name of the cleanup action.
    pub name: String,
    /// What went wrong.
    pub message: String,
}

impl CleanupFailure {
    /// Creates a new cleanup failure record.
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// Result type alias for cicd-local operations.
pub type Result<T> = std::result::Result<T, CicdError>;
