//! Filesystem-backed store for context artifacts and stage logs.
//!
//! Layout under the run output directory:
//!
//! ```text
//! <output>/build/build-artifact.tar
//! <output>/deliver/delivery-context.json
//! <output>/deploy/deployment-context.json
//! <output>/validate/validation-context.json
//! <output>/<family>/<pipeline>-<stage>.log
//! <output>/runs/<run-id>.json
//! ```
//!
//! Within one run nothing is overwritten. The first artifact of a slot goes
//! to its canonical path and the n-th to `<stem>.<n>.<ext>`; logs are
//! numbered the same way. `read` returns the newest version written in this
//! run and falls back to whatever an earlier run left at the canonical path,
//! until this run reserves that path for its own artifact.

use super::{ArtifactFamily, ArtifactSlot, ContextArtifact};
use crate::core::StageName;
use crate::errors::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Per-run store for stage artifacts and logs.
#[derive(Debug)]
pub struct ContextStore {
    root: PathBuf,
    /// Paths handed out in this run, keyed by canonical path.
    reserved: Mutex<HashMap<PathBuf, u32>>,
    /// Artifacts committed in this run, oldest first.
    written: Mutex<HashMap<ArtifactSlot, Vec<PathBuf>>>,
}

impl ContextStore {
    /// Creates a store rooted at the run output directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            reserved: Mutex::new(HashMap::new()),
            written: Mutex::new(HashMap::new()),
        }
    }

    /// The run output directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of a stage family.
    #[must_use]
    pub fn family_dir(&self, family: ArtifactFamily) -> PathBuf {
        self.root.join(family.dir_name())
    }

    /// Canonical path of a slot.
    #[must_use]
    pub fn canonical_path(&self, slot: ArtifactSlot) -> PathBuf {
        self.family_dir(slot.family()).join(slot.file_name())
    }

    /// Returns the path the next version of `slot` must be written to.
    ///
    /// A file an earlier process left at that path is removed, so whatever
    /// exists there afterwards was written by this run.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the family directory cannot be created or a
    /// stale file cannot be removed.
    pub fn reserve(&self, slot: ArtifactSlot) -> Result<PathBuf> {
        let path = self.next_version(self.canonical_path(slot))?;
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(slot = %slot, path = %path.display(), "Removed stale artifact"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(path)
    }

    /// Records a file written to a reserved path as the newest version of
    /// the slot.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the file cannot be read back.
    pub fn commit(&self, slot: ArtifactSlot, path: &Path) -> Result<ContextArtifact> {
        let bytes = std::fs::read(path)?;
        self.written
            .lock()
            .entry(slot)
            .or_default()
            .push(path.to_path_buf());
        debug!(slot = %slot, path = %path.display(), bytes = bytes.len(), "Context artifact committed");
        Ok(ContextArtifact::new(slot, path, bytes))
    }

    /// Writes an artifact for `slot`.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the artifact cannot be written.
    pub fn write(&self, slot: ArtifactSlot, bytes: &[u8]) -> Result<ContextArtifact> {
        let path = self.reserve(slot)?;
        std::fs::write(&path, bytes)?;
        self.commit(slot, &path)
    }

    /// Reads the newest artifact of `slot`.
    ///
    /// A slot that was never written yields `Ok(None)`; only unexpected IO
    /// failures are errors.
    ///
    /// # Errors
    ///
    /// Returns an IO error other than "not found".
    pub fn read(&self, slot: ArtifactSlot) -> Result<Option<ContextArtifact>> {
        let Some(path) = self.latest_path(slot) else {
            return Ok(None);
        };
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(ContextArtifact::new(slot, path, bytes))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Path of the newest artifact of `slot`, if one exists.
    #[must_use]
    pub fn latest_path(&self, slot: ArtifactSlot) -> Option<PathBuf> {
        if let Some(path) = self.written.lock().get(&slot).and_then(|v| v.last()) {
            return Some(path.clone());
        }
        let canonical = self.canonical_path(slot);
        canonical.is_file().then_some(canonical)
    }

    /// Every version of `slot` committed in this run, oldest first.
    #[must_use]
    pub fn versions(&self, slot: ArtifactSlot) -> Vec<PathBuf> {
        self.written.lock().get(&slot).cloned().unwrap_or_default()
    }

    /// Returns a fresh log path for `stage` run by `pipeline`.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the family directory cannot be created.
    pub fn log_path(&self, pipeline: &str, stage: StageName) -> Result<PathBuf> {
        let canonical = self
            .family_dir(stage.family())
            .join(format!("{pipeline}-{}.log", stage.function_name()));
        self.next_version(canonical)
    }

    /// Path of the summary written for a run.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the directory cannot be created.
    pub fn summary_path(&self, run_id: &str) -> Result<PathBuf> {
        let dir = self.root.join("runs");
        std::fs::create_dir_all(&dir)?;
        Ok(dir.join(format!("{run_id}.json")))
    }

    fn next_version(&self, canonical: PathBuf) -> Result<PathBuf> {
        if let Some(parent) = canonical.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut reserved = self.reserved.lock();
        let count = reserved.entry(canonical.clone()).or_insert(0);
        *count += 1;
        Ok(versioned_path(&canonical, *count))
    }
}

/// Inserts a version number before the extension for versions after the
/// first.
#[must_use]
pub fn versioned_path(canonical: &Path, version: u32) -> PathBuf {
    if version <= 1 {
        return canonical.to_path_buf();
    }
    let stem = canonical
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match canonical.extension() {
        Some(ext) => format!("{stem}.{version}.{}", ext.to_string_lossy()),
        None => format!("{stem}.{version}"),
    };
    canonical.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn store() -> (TempDir, ContextStore) {
        let dir = TempDir::new().unwrap();
        let store = ContextStore::new(dir.path().join("output"));
        (dir, store)
    }

    #[test]
    fn test_read_missing_is_absent() {
        let (_dir, store) = store();
        for slot in [
            ArtifactSlot::BuildArtifact,
            ArtifactSlot::DeliveryContext,
            ArtifactSlot::DeploymentContext,
            ArtifactSlot::ValidationContext,
        ] {
            assert!(store.read(slot).unwrap().is_none());
            assert!(store.latest_path(slot).is_none());
        }
    }

    #[test]
    fn test_write_then_read() {
        let (_dir, store) = store();
        let written = store
            .write(ArtifactSlot::DeploymentContext, br#"{"endpoint":"http://a:1"}"#)
            .unwrap();

        assert_eq!(written.path(), store.canonical_path(ArtifactSlot::DeploymentContext));
        let read = store.read(ArtifactSlot::DeploymentContext).unwrap().unwrap();
        assert_eq!(read.str_field("endpoint").as_deref(), Some("http://a:1"));
    }

    #[test]
    fn test_second_write_in_run_is_versioned() {
        let (_dir, store) = store();
        let first = store.write(ArtifactSlot::DeploymentContext, b"{\"n\":1}").unwrap();
        let second = store.write(ArtifactSlot::DeploymentContext, b"{\"n\":2}").unwrap();

        assert_ne!(first.path(), second.path());
        assert!(second.path().ends_with("deploy/deployment-context.2.json"));
        assert_eq!(std::fs::read(first.path()).unwrap(), b"{\"n\":1}");

        let latest = store.read(ArtifactSlot::DeploymentContext).unwrap().unwrap();
        assert_eq!(latest.bytes(), b"{\"n\":2}");
        assert_eq!(store.versions(ArtifactSlot::DeploymentContext).len(), 2);
    }

    #[test]
    fn test_read_falls_back_to_previous_run() {
        let (dir, store) = store();
        store.write(ArtifactSlot::BuildArtifact, b"tarball").unwrap();

        let next_run = ContextStore::new(dir.path().join("output"));
        let artifact = next_run.read(ArtifactSlot::BuildArtifact).unwrap().unwrap();
        assert_eq!(artifact.bytes(), b"tarball");
        assert!(next_run.versions(ArtifactSlot::BuildArtifact).is_empty());
    }

    #[test]
    fn test_reserve_clears_previous_run_artifact() {
        let (dir, store) = store();
        store.write(ArtifactSlot::DeploymentContext, b"{\"old\":true}").unwrap();

        let next_run = ContextStore::new(dir.path().join("output"));
        let path = next_run.reserve(ArtifactSlot::DeploymentContext).unwrap();
        assert_eq!(path, next_run.canonical_path(ArtifactSlot::DeploymentContext));
        assert!(!path.exists());
        assert!(next_run.read(ArtifactSlot::DeploymentContext).unwrap().is_none());
    }

    #[test]
    fn test_log_paths_are_namespaced_and_never_reused() {
        let (_dir, store) = store();
        let ci = store.log_path("continuous-integration", StageName::Build).unwrap();
        let delivery = store.log_path("delivery", StageName::Build).unwrap();
        let again = store.log_path("delivery", StageName::Build).unwrap();

        assert!(ci.ends_with("build/continuous-integration-build.log"));
        assert!(delivery.ends_with("build/delivery-build.log"));
        assert!(again.ends_with("build/delivery-build.2.log"));
    }

    #[test]
    fn test_versioned_path_without_extension() {
        assert_eq!(versioned_path(Path::new("a/b"), 3), PathBuf::from("a/b.3"));
        assert_eq!(versioned_path(Path::new("a/b.json"), 1), PathBuf::from("a/b.json"));
    }
}
