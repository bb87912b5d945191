//! Checks that the external tools a pipeline shells out to are installed.

use crate::config::{Config, EnvSnapshot};
use crate::errors::{CicdError, Result};
use crate::pipeline::PipelineKind;
use std::path::{Path, PathBuf};
use tracing::debug;

fn is_executable(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path)
            .map(|m| (m.permissions().mode() & 0o111) != 0)
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    {
        true
    }
}

/// Resolves `tool` against a `PATH`-style list. A tool given as a path is
/// checked as is.
#[must_use]
pub fn find_in_path(tool: &str, path: &str) -> Option<PathBuf> {
    if tool.is_empty() {
        return None;
    }
    let direct = Path::new(tool);
    if direct.components().count() > 1 {
        return is_executable(direct).then(|| direct.to_path_buf());
    }
    std::env::split_paths(path)
        .map(|dir| dir.join(tool))
        .find(|candidate| is_executable(candidate))
}

/// Executables `kind` needs: the backend always, the cluster CLI for
/// pipelines touching a cluster, git for blue-green staging.
#[must_use]
pub fn required_tools(kind: PipelineKind, config: &Config) -> Vec<&str> {
    let mut tools = vec![config.dagger_bin.as_str()];
    if kind.needs_cluster() {
        tools.push(config.kubectl_bin.as_str());
    }
    if kind == PipelineKind::BlueGreenStaging {
        tools.push(config.git_bin.as_str());
    }
    tools
}

/// Fails unless every tool `kind` needs is on `PATH`.
///
/// # Errors
///
/// Returns a precondition error naming every missing tool.
pub fn require_tools(kind: PipelineKind, config: &Config, env: &EnvSnapshot) -> Result<()> {
    let path = env.get("PATH").unwrap_or_default();
    let missing: Vec<&str> = required_tools(kind, config)
        .into_iter()
        .filter(|tool| match find_in_path(tool, path) {
            Some(found) => {
                debug!(tool, path = %found.display(), "Tool found");
                false
            }
            None => true,
        })
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(CicdError::precondition(format!(
            "required tools not found on PATH: {}",
            missing.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_required_tools_per_pipeline() {
        let config = Config::new("/work");
        assert_eq!(required_tools(PipelineKind::ContinuousIntegration, &config), vec!["dagger"]);
        assert_eq!(required_tools(PipelineKind::Deployment, &config), vec!["dagger", "kubectl"]);
        assert_eq!(
            required_tools(PipelineKind::BlueGreenStaging, &config),
            vec!["dagger", "kubectl", "git"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_find_in_path_and_require() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("dagger");
        std::fs::write(&tool, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::write(dir.path().join("kubectl"), "not executable").unwrap();

        let path = dir.path().display().to_string();
        assert_eq!(find_in_path("dagger", &path), Some(tool.clone()));
        assert_eq!(find_in_path("kubectl", &path), None);
        assert_eq!(find_in_path(&tool.display().to_string(), ""), Some(tool));

        let env = EnvSnapshot::from_pairs([("PATH", path.as_str())]);
        let config = Config::new("/work");
        assert!(require_tools(PipelineKind::Delivery, &config, &env).is_ok());
        let err = require_tools(PipelineKind::Deployment, &config, &env).unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains("kubectl"));
    }
}
