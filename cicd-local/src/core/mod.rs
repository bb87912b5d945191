//! Core domain model types for cicd-local.
//!
//! This module contains the stage contract shared by every pipeline:
//! - The six stage names and their typed parameter lists
//! - Stage arguments and their rendering as backend flags
//! - Invocation outcome records

mod args;
mod record;
mod stage;

pub use args::{kebab_case, ArgValue, StageArgs};
pub use record::{StageInvocationRecord, StageStatus};
pub use stage::{ParamSpec, ParamType, ReturnType, StageContract, StageName, CONTRACT_VERSION};
