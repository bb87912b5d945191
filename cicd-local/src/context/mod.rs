//! Context propagation between stages.
//!
//! This module provides:
//! - Artifact slots and families with their fixed filesystem layout
//! - The per-run context store for artifacts and stage logs
//! - Run identities

mod artifact;
mod identity;
mod store;

pub use artifact::{ArtifactFamily, ArtifactSlot, ContextArtifact};
pub use identity::RunIdentity;
pub use store::{versioned_path, ContextStore};
