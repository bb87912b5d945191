//! # cicd-local
//!
//! Runs multi-stage delivery pipelines on a developer machine.
//!
//! Stages are functions of a container-workflow module; this crate decides
//! which stages run, in what order, with which arguments, and keeps the
//! credentials the privileged stages need out of every stage's arguments:
//!
//! - **Stage contract**: the six stages and their typed parameters
//! - **Context store**: artifacts passed from one stage to the next
//! - **Secret injection**: a privileged module written for one run and erased after it
//! - **Pipelines**: continuous integration, delivery, deployment, acceptance testing
//! - **Blue-green staging**: current, previous and current release again, with the
//!   working tree always put back
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use cicd_local::prelude::*;
//! use std::sync::Arc;
//!
//! let env = EnvSnapshot::from_process();
//! let config = Config::from_env(".", &env);
//! let secrets = AmbientSecretStore::new(env, &config.kubectl_bin, config.kubectl_context.clone())
//!     .with_kubeconfig(config.kubeconfig_path.clone());
//! let backend = DaggerBackend::new(&config.dagger_bin);
//! let runner = PipelineRunner::new(config, Arc::new(backend), Arc::new(secrets))?;
//!
//! let plan = runner.plan(PipelineKind::Deployment, &PipelineOptions::new())?;
//! let run = runner.execute(&plan).await.into_result()?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod backend;
pub mod cancellation;
pub mod config;
pub mod context;
pub mod core;
pub mod errors;
pub mod invoker;
pub mod observability;
pub mod pipeline;
pub mod preflight;
pub mod secrets;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backend::{BackendCall, BackendOutcome, DaggerBackend, ExecutionBackend};
    pub use crate::cancellation::CleanupRegistry;
    pub use crate::config::{Config, EnvSnapshot, TunnelConfig, DEFAULT_ENV_FILE};
    pub use crate::context::{ArtifactSlot, ContextArtifact, ContextStore, RunIdentity};
    pub use crate::core::{ArgValue, StageArgs, StageInvocationRecord, StageName, StageStatus};
    pub use crate::errors::{CicdError, ErrorCategory, Result, SecretError};
    pub use crate::invoker::{Invocation, StageInvoker};
    pub use crate::observability::{init_tracing, LogFormat, TracingConfig};
    pub use crate::pipeline::{
        BlueGreenController, BlueGreenPhase, BlueGreenReport, GitCli, PipelineKind, PipelineOptions,
        PipelinePlan, PipelineRun, PipelineRunner, Trigger,
    };
    pub use crate::preflight::require_tools;
    pub use crate::secrets::{AmbientSecretStore, SecretInjector, SecretKey, SecretStore, StaticSecretStore};
}
