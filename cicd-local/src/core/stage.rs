//! The stage contract: the six canonical delivery operations and their
//! typed parameter lists.

use super::args::{ArgValue, StageArgs};
use crate::context::ArtifactFamily;
use crate::errors::ContractError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Version of the stage contract table below. Adding a stage kind or a
/// parameter bumps it.
pub const CONTRACT_VERSION: u32 = 1;

/// One of the six canonical delivery operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    /// Compile and package the project.
    Build,
    /// Run unit tests against the build output.
    UnitTest,
    /// Run integration tests against a deployed instance.
    IntegrationTest,
    /// Publish images and charts.
    Deliver,
    /// Install the published release into a cluster.
    Deploy,
    /// Check that a deployment is healthy.
    Validate,
}

impl StageName {
    /// All stages in contract order.
    pub const ALL: [Self; 6] = [
        Self::Build,
        Self::UnitTest,
        Self::IntegrationTest,
        Self::Deliver,
        Self::Deploy,
        Self::Validate,
    ];

    /// Returns the function name the execution backend knows this stage by.
    #[must_use]
    pub fn function_name(self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::UnitTest => "unit-test",
            Self::IntegrationTest => "integration-test",
            Self::Deliver => "deliver",
            Self::Deploy => "deploy",
            Self::Validate => "validate",
        }
    }

    /// Returns the context store family this stage writes into.
    #[must_use]
    pub fn family(self) -> ArtifactFamily {
        match self {
            Self::Build => ArtifactFamily::Build,
            Self::UnitTest | Self::IntegrationTest => ArtifactFamily::Test,
            Self::Deliver => ArtifactFamily::Deliver,
            Self::Deploy => ArtifactFamily::Deploy,
            Self::Validate => ArtifactFamily::Validate,
        }
    }

    /// Returns true if the stage needs the injected privileged module.
    #[must_use]
    pub fn is_privileged(self) -> bool {
        matches!(
            self,
            Self::Deliver | Self::Deploy | Self::Validate | Self::IntegrationTest
        )
    }

    /// Parses a backend function name or a snake_case stage name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|stage| stage.function_name() == normalized)
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.function_name())
    }
}

/// The declared type of a stage parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    /// A directory on the host.
    Directory,
    /// A file on the host, passed by reference.
    File,
    /// A secret, passed as an environment reference.
    Secret,
    /// A plain string.
    String,
    /// A boolean flag.
    Bool,
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Directory => write!(f, "directory"),
            Self::File => write!(f, "file"),
            Self::Secret => write!(f, "secret"),
            Self::String => write!(f, "string"),
            Self::Bool => write!(f, "bool"),
        }
    }
}

/// What a stage returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnType {
    /// A file, exportable as a context artifact.
    File,
    /// Plain text output.
    String,
}

/// A single declared parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ParamSpec {
    /// camelCase parameter name.
    pub name: &'static str,
    /// Declared type.
    pub ty: ParamType,
    /// Whether the stage refuses to run without it.
    pub required: bool,
}

impl ParamSpec {
    const fn required(name: &'static str, ty: ParamType) -> Self {
        Self {
            name,
            ty,
            required: true,
        }
    }

    const fn optional(name: &'static str, ty: ParamType) -> Self {
        Self {
            name,
            ty,
            required: false,
        }
    }
}

const SOURCE: ParamSpec = ParamSpec::required("source", ParamType::Directory);
const RELEASE_CANDIDATE: ParamSpec = ParamSpec::optional("releaseCandidate", ParamType::Bool);

const BUILD_PARAMS: &[ParamSpec] = &[SOURCE, RELEASE_CANDIDATE];

const UNIT_TEST_PARAMS: &[ParamSpec] = &[
    SOURCE,
    ParamSpec::optional("buildArtifact", ParamType::File),
    RELEASE_CANDIDATE,
];

const INTEGRATION_TEST_PARAMS: &[ParamSpec] = &[
    SOURCE,
    ParamSpec::required("kubeconfig", ParamType::File),
    ParamSpec::optional("awsconfig", ParamType::Secret),
    ParamSpec::optional("deploymentContext", ParamType::File),
    ParamSpec::optional("validationContext", ParamType::File),
    RELEASE_CANDIDATE,
];

const DELIVER_PARAMS: &[ParamSpec] = &[
    SOURCE,
    ParamSpec::optional("containerRepository", ParamType::String),
    ParamSpec::optional("helmRepository", ParamType::String),
    ParamSpec::optional("buildArtifact", ParamType::File),
    RELEASE_CANDIDATE,
];

const DEPLOY_PARAMS: &[ParamSpec] = &[
    SOURCE,
    ParamSpec::optional("kubeconfig", ParamType::File),
    ParamSpec::optional("awsconfig", ParamType::Secret),
    ParamSpec::optional("helmRepository", ParamType::String),
    ParamSpec::optional("containerRepository", ParamType::String),
    ParamSpec::optional("deliveryContext", ParamType::File),
    ParamSpec::optional("version", ParamType::String),
    RELEASE_CANDIDATE,
];

const VALIDATE_PARAMS: &[ParamSpec] = &[
    SOURCE,
    ParamSpec::optional("kubeconfig", ParamType::File),
    RELEASE_CANDIDATE,
    ParamSpec::optional("deploymentContext", ParamType::File),
];

/// The immutable contract of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageContract {
    /// Which stage this contract describes.
    pub stage: StageName,
    /// Declared parameters.
    pub params: &'static [ParamSpec],
    /// Declared return type.
    pub returns: ReturnType,
}

impl StageContract {
    /// Returns the contract for a stage.
    #[must_use]
    pub fn for_stage(stage: StageName) -> Self {
        let (params, returns) = match stage {
            StageName::Build => (BUILD_PARAMS, ReturnType::File),
            StageName::UnitTest => (UNIT_TEST_PARAMS, ReturnType::String),
            StageName::IntegrationTest => (INTEGRATION_TEST_PARAMS, ReturnType::String),
            StageName::Deliver => (DELIVER_PARAMS, ReturnType::File),
            StageName::Deploy => (DEPLOY_PARAMS, ReturnType::File),
            StageName::Validate => (VALIDATE_PARAMS, ReturnType::File),
        };
        Self {
            stage,
            params,
            returns,
        }
    }

    /// Looks up a parameter by name.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Returns true if the stage declares the parameter.
    #[must_use]
    pub fn accepts(&self, name: &str) -> bool {
        self.param(name).is_some()
    }

    /// Checks a resolved argument set against the contract.
    ///
    /// # Errors
    ///
    /// Returns a `ContractError` for the first unknown parameter, type
    /// mismatch or missing required parameter.
    pub fn check(&self, args: &StageArgs) -> Result<(), ContractError> {
        let stage = self.stage.function_name();

        for (name, value) in args.iter() {
            let Some(spec) = self.param(name) else {
                return Err(ContractError::UnknownParameter {
                    stage: stage.to_string(),
                    param: name.clone(),
                });
            };
            if !value_matches(spec.ty, value) {
                return Err(ContractError::TypeMismatch {
                    stage: stage.to_string(),
                    param: name.clone(),
                    expected: spec.ty.to_string(),
                    actual: value.kind().to_string(),
                });
            }
        }

        if let Some(missing) = self
            .params
            .iter()
            .find(|p| p.required && !args.contains(p.name))
        {
            return Err(ContractError::MissingParameter {
                stage: stage.to_string(),
                param: missing.name.to_string(),
            });
        }

        Ok(())
    }
}

fn value_matches(ty: ParamType, value: &ArgValue) -> bool {
    matches!(
        (ty, value),
        (ParamType::Directory, ArgValue::Directory(_))
            | (ParamType::File, ArgValue::File(_) | ArgValue::Artifact(_))
            | (ParamType::Secret, ArgValue::SecretEnv(_))
            | (ParamType::String, ArgValue::Str(_))
            | (ParamType::Bool, ArgValue::Bool(_))
    )
}
