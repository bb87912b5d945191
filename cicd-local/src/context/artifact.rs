//! Context artifacts exchanged between stages.

use crate::core::StageName;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// A subdirectory of the run output directory owned by one stage family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactFamily {
    /// Build outputs.
    Build,
    /// Test logs.
    Test,
    /// Delivery context.
    Deliver,
    /// Deployment context.
    Deploy,
    /// Validation context.
    Validate,
}

impl ArtifactFamily {
    /// Directory name under the run output directory.
    #[must_use]
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Test => "test",
            Self::Deliver => "deliver",
            Self::Deploy => "deploy",
            Self::Validate => "validate",
        }
    }
}

impl fmt::Display for ArtifactFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// A well-known artifact location, one per exporting stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactSlot {
    /// Packaged build output.
    BuildArtifact,
    /// Published image and chart references.
    DeliveryContext,
    /// Endpoint and release identifiers of a deployment.
    DeploymentContext,
    /// Status and checks of a validation.
    ValidationContext,
}

impl ArtifactSlot {
    /// Returns the slot a stage exports into, if it exports at all.
    #[must_use]
    pub fn for_stage(stage: StageName) -> Option<Self> {
        match stage {
            StageName::Build => Some(Self::BuildArtifact),
            StageName::Deliver => Some(Self::DeliveryContext),
            StageName::Deploy => Some(Self::DeploymentContext),
            StageName::Validate => Some(Self::ValidationContext),
            StageName::UnitTest | StageName::IntegrationTest => None,
        }
    }

    /// The family directory the slot lives in.
    #[must_use]
    pub fn family(self) -> ArtifactFamily {
        match self {
            Self::BuildArtifact => ArtifactFamily::Build,
            Self::DeliveryContext => ArtifactFamily::Deliver,
            Self::DeploymentContext => ArtifactFamily::Deploy,
            Self::ValidationContext => ArtifactFamily::Validate,
        }
    }

    /// Canonical file name of the first version written in a run.
    #[must_use]
    pub fn file_name(self) -> &'static str {
        match self {
            Self::BuildArtifact => "build-artifact.tar",
            Self::DeliveryContext => "delivery-context.json",
            Self::DeploymentContext => "deployment-context.json",
            Self::ValidationContext => "validation-context.json",
        }
    }
}

impl fmt::Display for ArtifactSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.family(), self.file_name())
    }
}

/// An opaque blob written by one stage and read by later ones.
///
/// No schema is enforced; the JSON helpers return `None` for anything that
/// is missing or not shaped as expected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextArtifact {
    slot: ArtifactSlot,
    path: PathBuf,
    bytes: Vec<u8>,
}

impl ContextArtifact {
    /// Creates an artifact from its location and content.
    #[must_use]
    pub fn new(slot: ArtifactSlot, path: impl Into<PathBuf>, bytes: Vec<u8>) -> Self {
        Self {
            slot,
            path: path.into(),
            bytes,
        }
    }

    /// The slot this artifact belongs to.
    #[must_use]
    pub fn slot(&self) -> ArtifactSlot {
        self.slot
    }

    /// Where the artifact is stored.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw content.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Parses the content as JSON.
    ///
    /// # Errors
    ///
    /// Returns the parse error if the content is not JSON.
    pub fn json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.bytes)
    }

    /// Returns a top-level string field of a JSON artifact.
    #[must_use]
    pub fn str_field(&self, key: &str) -> Option<String> {
        self.json()
            .ok()?
            .get(key)?
            .as_str()
            .map(ToString::to_string)
    }
}
