//! Invokes one stage through the execution backend.

use crate::backend::{BackendCall, ExecutionBackend};
use crate::context::{ArtifactSlot, ContextArtifact, ContextStore};
use crate::core::{StageArgs, StageContract, StageInvocationRecord, StageName};
use crate::errors::{CicdError, Result};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, info_span, warn, Instrument};

/// The result of a successful invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// What happened, for the run summary.
    pub record: StageInvocationRecord,
    /// The exported context artifact, if the stage exported one.
    pub artifact: Option<ContextArtifact>,
}

/// Turns a stage, its arguments and an export request into a backend call.
pub struct StageInvoker {
    backend: Arc<dyn ExecutionBackend>,
    store: Arc<ContextStore>,
    module: PathBuf,
}

impl std::fmt::Debug for StageInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageInvoker")
            .field("store", &self.store)
            .field("module", &self.module)
            .finish_non_exhaustive()
    }
}

impl StageInvoker {
    /// Creates an invoker for the module at `module`.
    #[must_use]
    pub fn new(
        backend: Arc<dyn ExecutionBackend>,
        store: Arc<ContextStore>,
        module: impl Into<PathBuf>,
    ) -> Self {
        Self {
            backend,
            store,
            module: module.into(),
        }
    }

    /// The context store artifacts are written to.
    #[must_use]
    pub fn store(&self) -> &Arc<ContextStore> {
        &self.store
    }

    /// Runs `stage` on behalf of `pipeline`.
    ///
    /// Artifact references in `args` are resolved against the context store
    /// first; references to artifacts that do not exist are dropped. With
    /// `export` set, the stage's returned file is written to a fresh path of
    /// its slot and committed as the newest artifact.
    ///
    /// # Errors
    ///
    /// Returns a contract error if the arguments do not fit the stage, and
    /// `StageInvocation` naming the stage if the backend exits non-zero.
    pub async fn invoke(
        &self,
        pipeline: &str,
        stage: StageName,
        args: StageArgs,
        export: bool,
    ) -> Result<Invocation> {
        let args = args.resolve(|slot| self.store.latest_path(slot));
        StageContract::for_stage(stage).check(&args)?;

        let slot = if export { ArtifactSlot::for_stage(stage) } else { None };
        if export && slot.is_none() {
            warn!(stage = %stage, "Stage exports nothing, ignoring export request");
        }

        let log_path = self.store.log_path(pipeline, stage)?;
        let mut call = BackendCall::new(&self.module, stage.function_name()).with_flags(args.to_flags());
        if let Some(slot) = slot {
            call = call.with_export(self.store.reserve(slot)?);
        }

        let started_at = Utc::now();
        let span = info_span!("stage", pipeline = %pipeline, stage = %stage);
        let outcome = async {
            info!(log = %log_path.display(), "Invoking stage");
            self.backend.execute(&call, &log_path).await
        }
        .instrument(span)
        .await?;

        if !outcome.is_success() {
            return Err(CicdError::StageInvocation {
                stage: stage.function_name().to_string(),
                pipeline: pipeline.to_string(),
                exit_code: outcome.exit_code,
                log_path,
            });
        }

        let artifact = match (slot, &call.export) {
            (Some(slot), Some(dest)) if dest.is_file() => Some(self.store.commit(slot, dest)?),
            (Some(slot), Some(dest)) => {
                warn!(stage = %stage, slot = %slot, path = %dest.display(), "Stage succeeded but exported nothing");
                None
            }
            _ => None,
        };

        let record = StageInvocationRecord::ok(
            stage,
            started_at,
            log_path,
            artifact.as_ref().map(|a| a.path().to_path_buf()),
        );
        info!(
            pipeline = %pipeline,
            stage = %stage,
            duration_ms = record.duration_ms(),
            "Stage completed"
        );
        Ok(Invocation { record, artifact })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ArgValue;
    use crate::testing::RecordingBackend;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn invoker(dir: &TempDir, backend: Arc<RecordingBackend>) -> StageInvoker {
        let store = Arc::new(ContextStore::new(dir.path().join("output")));
        StageInvoker::new(backend, store, dir.path())
    }

    #[tokio::test]
    async fn test_invoke_builds_call_and_logs() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(RecordingBackend::new());
        let invoker = invoker(&dir, Arc::clone(&backend));

        let args = StageArgs::new()
            .with_source(dir.path())
            .with_flag("releaseCandidate", true);
        let invocation = invoker
            .invoke("continuous-integration", StageName::UnitTest, args, false)
            .await
            .unwrap();

        let calls = backend.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function, "unit-test");
        assert_eq!(calls[0].flag("release-candidate"), Some("true"));
        assert!(calls[0].export.is_none());
        assert!(invocation
            .record
            .log_path
            .unwrap()
            .ends_with("test/continuous-integration-unit-test.log"));
    }

    #[tokio::test]
    async fn test_export_is_committed_and_resolved_downstream() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(RecordingBackend::new());
        let invoker = invoker(&dir, Arc::clone(&backend));

        let deployed = invoker
            .invoke("deployment", StageName::Deploy, StageArgs::new().with_source(dir.path()), true)
            .await
            .unwrap();
        let artifact = deployed.artifact.unwrap();
        assert_eq!(artifact.slot(), ArtifactSlot::DeploymentContext);

        let args = StageArgs::new()
            .with_source(dir.path())
            .with("deploymentContext", ArgValue::Artifact(ArtifactSlot::DeploymentContext));
        invoker
            .invoke("deployment", StageName::Validate, args, false)
            .await
            .unwrap();

        let expected = format!("file://{}", artifact.path().display());
        assert_eq!(backend.calls()[1].flag("deployment-context"), Some(expected.as_str()));
    }

    #[tokio::test]
    async fn test_missing_optional_artifact_is_dropped() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(RecordingBackend::new());
        let invoker = invoker(&dir, Arc::clone(&backend));

        let args = StageArgs::new()
            .with_source(dir.path())
            .with("buildArtifact", ArgValue::Artifact(ArtifactSlot::BuildArtifact));
        invoker
            .invoke("delivery", StageName::Deliver, args, false)
            .await
            .unwrap();

        assert_eq!(backend.calls()[0].flag("build-artifact"), None);
    }

    #[tokio::test]
    async fn test_stale_export_is_never_committed() {
        let dir = TempDir::new().unwrap();
        let earlier = ContextStore::new(dir.path().join("output"));
        earlier
            .write(ArtifactSlot::DeploymentContext, br#"{"endpoint":"http://stale:1"}"#)
            .unwrap();

        let backend = Arc::new(RecordingBackend::new().without_export(StageName::Deploy));
        let invoker = invoker(&dir, backend);
        let deployed = invoker
            .invoke("deployment", StageName::Deploy, StageArgs::new().with_source(dir.path()), true)
            .await
            .unwrap();

        assert!(deployed.artifact.is_none());
        assert!(deployed.record.artifact_path.is_none());
        assert!(invoker.store.read(ArtifactSlot::DeploymentContext).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failure_names_stage() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(RecordingBackend::new().fail_on(StageName::Build, 2));
        let invoker = invoker(&dir, backend);

        let err = invoker
            .invoke("delivery", StageName::Build, StageArgs::new().with_source(dir.path()), true)
            .await
            .unwrap_err();

        match err {
            CicdError::StageInvocation { stage, exit_code, log_path, .. } => {
                assert_eq!(stage, "build");
                assert_eq!(exit_code, Some(2));
                assert!(log_path.exists());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_contract_violation_never_reaches_backend() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(RecordingBackend::new());
        let invoker = invoker(&dir, Arc::clone(&backend));

        let err = invoker
            .invoke("acceptance-testing", StageName::IntegrationTest, StageArgs::new().with_source(dir.path()), false)
            .await
            .unwrap_err();

        assert!(matches!(err, CicdError::Contract(_)));
        assert!(backend.calls().is_empty());
    }
}
