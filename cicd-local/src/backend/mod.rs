//! Execution backend seam.
//!
//! This module provides:
//! - BackendCall, the command line of one stage invocation
//! - The ExecutionBackend trait the invoker talks to
//! - DaggerBackend, which shells out to the container workflow engine

mod dagger;

pub use dagger::DaggerBackend;

use crate::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One call into the execution backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendCall {
    /// Module directory the function lives in.
    pub module: PathBuf,
    /// Backend function name, e.g. `unit-test`.
    pub function: String,
    /// Rendered `--name=value` flags.
    pub flags: Vec<String>,
    /// Where the returned file is exported, for file-returning stages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export: Option<PathBuf>,
}

impl BackendCall {
    /// Creates a call without flags or export.
    #[must_use]
    pub fn new(module: impl Into<PathBuf>, function: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            function: function.into(),
            flags: Vec::new(),
            export: None,
        }
    }

    /// Sets the flags.
    #[must_use]
    pub fn with_flags(mut self, flags: Vec<String>) -> Self {
        self.flags = flags;
        self
    }

    /// Exports the returned file to `path`.
    #[must_use]
    pub fn with_export(mut self, path: impl Into<PathBuf>) -> Self {
        self.export = Some(path.into());
        self
    }

    /// Returns the flag value for `name` (kebab-case), if present.
    #[must_use]
    pub fn flag(&self, name: &str) -> Option<&str> {
        let prefix = format!("--{name}=");
        self.flags
            .iter()
            .find_map(|f| f.strip_prefix(prefix.as_str()))
    }

    /// The backend command-line arguments:
    /// `-m <module> call <function> <flags…> [export --path=<dest>]`.
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.flags.len() + 6);
        args.push("-m".to_string());
        args.push(self.module.display().to_string());
        args.push("call".to_string());
        args.push(self.function.clone());
        args.extend(self.flags.iter().cloned());
        if let Some(dest) = &self.export {
            args.push("export".to_string());
            args.push(format!("--path={}", dest.display()));
        }
        args
    }
}

/// How a backend call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendOutcome {
    /// Process exit code; `None` if it was killed by a signal.
    pub exit_code: Option<i32>,
}

impl BackendOutcome {
    /// A successful outcome.
    #[must_use]
    pub fn success() -> Self {
        Self { exit_code: Some(0) }
    }

    /// A failed outcome with the given exit code.
    #[must_use]
    pub fn failure(code: i32) -> Self {
        Self {
            exit_code: Some(code),
        }
    }

    /// Returns true if the call exited with code zero.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Something that can run stage functions.
///
/// Implementations must stream all output of the call to `log_path` as it
/// arrives, so the log is complete even when the call is interrupted.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Runs one call and waits for it to finish.
    ///
    /// # Errors
    ///
    /// Returns an error only if the call could not be run at all; a non-zero
    /// exit is reported through the outcome.
    async fn execute(&self, call: &BackendCall, log_path: &Path) -> Result<BackendOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_args_without_export() {
        let call = BackendCall::new("/work", "unit-test").with_flags(vec![
            "--release-candidate=true".to_string(),
            "--source=/work".to_string(),
        ]);

        assert_eq!(
            call.to_args(),
            vec![
                "-m",
                "/work",
                "call",
                "unit-test",
                "--release-candidate=true",
                "--source=/work"
            ]
        );
        assert_eq!(call.flag("release-candidate"), Some("true"));
        assert_eq!(call.flag("release"), None);
    }

    #[test]
    fn test_args_with_export() {
        let call = BackendCall::new("/work", "deploy")
            .with_flags(vec!["--source=/work".to_string()])
            .with_export("/work/output/deploy/deployment-context.json");

        let args = call.to_args();
        assert_eq!(args[args.len() - 2], "export");
        assert_eq!(args[args.len() - 1], "--path=/work/output/deploy/deployment-context.json");
    }

    #[test]
    fn test_outcome() {
        assert!(BackendOutcome::success().is_success());
        assert!(!BackendOutcome::failure(1).is_success());
        assert!(!BackendOutcome { exit_code: None }.is_success());
    }
}
