//! Stage arguments and their rendering as backend flags.

use crate::context::ArtifactSlot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// The value of one stage argument.
///
/// There is deliberately no variant carrying a raw secret: secrets reach a
/// stage either through the injected privileged module or as an `env:`
/// reference the backend resolves itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ArgValue {
    /// A boolean flag, rendered as `true`/`false`.
    Bool(bool),
    /// A plain string.
    Str(String),
    /// A host directory.
    Directory(PathBuf),
    /// A host file, rendered as `file://<path>`.
    File(PathBuf),
    /// A secret held in the named environment variable, rendered as `env:NAME`.
    SecretEnv(String),
    /// A context artifact produced earlier in the run, resolved to a file
    /// just before invocation.
    Artifact(ArtifactSlot),
}

impl ArgValue {
    /// Short name of the value kind, for diagnostics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Str(_) => "string",
            Self::Directory(_) => "directory",
            Self::File(_) => "file",
            Self::SecretEnv(_) => "secret",
            Self::Artifact(_) => "artifact",
        }
    }

    /// Renders the value the way the backend expects it on the command line.
    ///
    /// Returns `None` for an unresolved artifact reference.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        match self {
            Self::Bool(b) => Some(b.to_string()),
            Self::Str(s) => Some(s.clone()),
            Self::Directory(p) => Some(p.display().to_string()),
            Self::File(p) => Some(format!("file://{}", p.display())),
            Self::SecretEnv(var) => Some(format!("env:{var}")),
            Self::Artifact(_) => None,
        }
    }
}

/// Ordered set of named stage arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageArgs {
    values: BTreeMap<String, ArgValue>,
}

impl StageArgs {
    /// Creates an empty argument set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an argument.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: ArgValue) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    /// Adds the `source` directory argument.
    #[must_use]
    pub fn with_source(self, source: &Path) -> Self {
        self.with("source", ArgValue::Directory(source.to_path_buf()))
    }

    /// Adds a boolean argument.
    #[must_use]
    pub fn with_flag(self, name: impl Into<String>, value: bool) -> Self {
        self.with(name, ArgValue::Bool(value))
    }

    /// Adds a string argument when a value is present.
    #[must_use]
    pub fn with_optional_str(self, name: impl Into<String>, value: Option<&str>) -> Self {
        match value {
            Some(v) => self.with(name, ArgValue::Str(v.to_string())),
            None => self,
        }
    }

    /// Sets or replaces an argument in place.
    pub fn set(&mut self, name: impl Into<String>, value: ArgValue) {
        self.values.insert(name.into(), value);
    }

    /// Gets an argument by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.values.get(name)
    }

    /// Returns true if the argument is present.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Iterates over the arguments in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ArgValue)> {
        self.values.iter()
    }

    /// Number of arguments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if there are no arguments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Replaces every artifact reference with the file the lookup returns.
    ///
    /// References the lookup cannot satisfy are dropped; the contract check
    /// decides afterwards whether that was acceptable.
    #[must_use]
    pub fn resolve<F>(self, lookup: F) -> Self
    where
        F: Fn(ArtifactSlot) -> Option<PathBuf>,
    {
        let values = self
            .values
            .into_iter()
            .filter_map(|(name, value)| match value {
                ArgValue::Artifact(slot) => lookup(slot).map(|path| (name, ArgValue::File(path))),
                other => Some((name, other)),
            })
            .collect();
        Self { values }
    }

    /// Renders the arguments as `--kebab-case-name=value` flags.
    ///
    /// Unresolved artifact references are skipped.
    #[must_use]
    pub fn to_flags(&self) -> Vec<String> {
        self.values
            .iter()
            .filter_map(|(name, value)| {
                value
                    .render()
                    .map(|rendered| format!("--{}={rendered}", kebab_case(name)))
            })
            .collect()
    }
}

/// Converts a camelCase parameter name to kebab-case.
#[must_use]
pub fn kebab_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 {
                out.push('-');
            }
            out.push(ch.to_ascii_lowercase());
        } else if ch == '_' {
            out.push('-');
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_kebab_case() {
        assert_eq!(kebab_case("releaseCandidate"), "release-candidate");
        assert_eq!(kebab_case("deploymentContext"), "deployment-context");
        assert_eq!(kebab_case("source"), "source");
        assert_eq!(kebab_case("build_artifact"), "build-artifact");
    }

    #[test]
    fn test_flags_render_references() {
        let args = StageArgs::new()
            .with_source(Path::new("/work/app"))
            .with_flag("releaseCandidate", false)
            .with("kubeconfig", ArgValue::File("/home/dev/.kube/config".into()))
            .with("awsconfig", ArgValue::SecretEnv("AWS_CONFIG".into()));

        assert_eq!(
            args.to_flags(),
            vec![
                "--awsconfig=env:AWS_CONFIG".to_string(),
                "--kubeconfig=file:///home/dev/.kube/config".to_string(),
                "--release-candidate=false".to_string(),
                "--source=/work/app".to_string(),
            ]
        );
    }

    #[test]
    fn test_resolve_replaces_present_artifacts_and_drops_missing() {
        let args = StageArgs::new()
            .with_source(Path::new("."))
            .with("deploymentContext", ArgValue::Artifact(ArtifactSlot::DeploymentContext))
            .with("validationContext", ArgValue::Artifact(ArtifactSlot::ValidationContext));

        let resolved = args.resolve(|slot| match slot {
            ArtifactSlot::DeploymentContext => Some(PathBuf::from("out/deploy/deployment-context.json")),
            _ => None,
        });

        assert_eq!(
            resolved.get("deploymentContext"),
            Some(&ArgValue::File("out/deploy/deployment-context.json".into()))
        );
        assert!(!resolved.contains("validationContext"));
    }

    #[test]
    fn test_optional_str_skips_none() {
        let args = StageArgs::new()
            .with_optional_str("containerRepository", None)
            .with_optional_str("helmRepository", Some("oci://charts.local"));

        assert_eq!(args.len(), 1);
        assert_eq!(args.to_flags(), vec!["--helm-repository=oci://charts.local".to_string()]);
    }
}
