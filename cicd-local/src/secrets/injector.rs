//! Materializes the privileged module with real secret values and erases it
//! again when the run ends.

use super::store::{SecretKey, SecretStore, SecretValue};
use super::template::{remaining_tokens, render, EscapeRule, Substitution};
use crate::cancellation::CleanupRegistry;
use crate::config::Config;
use crate::errors::{CicdError, SecretError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

/// Placeholder replaced with the cluster configuration.
pub const KUBECONFIG_TOKEN: &str = "__INJECTED_KUBECTL_CONTEXT__";
/// Placeholder replaced with the image registry URL.
pub const CONTAINER_REPOSITORY_TOKEN: &str = "__INJECTED_CONTAINER_REPOSITORY_URL__";
/// Placeholder replaced with the chart repository URL.
pub const HELM_REPOSITORY_TOKEN: &str = "__INJECTED_HELM_REPOSITORY_URL__";

/// Name under which the erase action is registered for cleanup.
pub const ERASE_CLEANUP_NAME: &str = "erase-privileged-module";

/// File inside the module directory holding the run's minified cluster
/// configuration, for stages that take it as a file argument.
pub const KUBECONFIG_FILE: &str = "kubeconfig.yaml";

/// File that must be present in every template set.
const SECRETS_TEMPLATE: &str = "secrets.go";

/// One source file of the privileged module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateFile {
    /// File name inside the module directory.
    pub name: String,
    /// Template contents, placeholders included.
    pub contents: String,
}

impl TemplateFile {
    /// Creates a template file.
    #[must_use]
    pub fn new(name: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contents: contents.into(),
        }
    }
}

/// The files that make up the privileged module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSet {
    files: Vec<TemplateFile>,
    source: Option<PathBuf>,
}

impl TemplateSet {
    /// The module shipped with cicd-local: the secret getters, and kubectl,
    /// helm and image-publishing helpers built on them.
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            files: vec![
                TemplateFile::new(
                    SECRETS_TEMPLATE,
                    include_str!("../../templates/privileged/secrets.go"),
                ),
                TemplateFile::new(
                    "kubectl.go",
                    include_str!("../../templates/privileged/kubectl.go"),
                ),
                TemplateFile::new("helm.go", include_str!("../../templates/privileged/helm.go")),
                TemplateFile::new(
                    "container.go",
                    include_str!("../../templates/privileged/container.go"),
                ),
            ],
            source: None,
        }
    }

    /// Loads every regular file of `dir` as a template.
    ///
    /// # Errors
    ///
    /// Returns `TemplatesMissing` if the directory or its `secrets.go` is
    /// absent, and an IO error if a file cannot be read.
    pub fn from_dir(dir: &Path) -> Result<Self, SecretError> {
        if !dir.join(SECRETS_TEMPLATE).is_file() {
            return Err(SecretError::TemplatesMissing {
                path: dir.to_path_buf(),
            });
        }

        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| SecretError::Io { path, source }
        };

        let mut files = Vec::new();
        for entry in fs::read_dir(dir).map_err(io_err(dir))? {
            let path = entry.map_err(io_err(dir))?.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            let contents = fs::read_to_string(&path).map_err(io_err(&path))?;
            files.push(TemplateFile::new(name, contents));
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));

        debug!(dir = %dir.display(), count = files.len(), "Loaded privileged templates");
        Ok(Self {
            files,
            source: Some(dir.to_path_buf()),
        })
    }

    /// Uses the configured override directory, or the built-in set.
    ///
    /// # Errors
    ///
    /// See [`TemplateSet::from_dir`].
    pub fn load(config: &Config) -> Result<Self, SecretError> {
        match &config.template_dir {
            Some(dir) => Self::from_dir(dir),
            None => Ok(Self::builtin()),
        }
    }

    /// The template files, in write order.
    #[must_use]
    pub fn files(&self) -> &[TemplateFile] {
        &self.files
    }

    /// Directory the templates were loaded from, if not built in.
    #[must_use]
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}

/// How one placeholder is filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenRule {
    /// Placeholder text in the templates.
    pub token: &'static str,
    /// Secret that replaces it.
    pub key: SecretKey,
    /// Escaping applied to the value.
    pub rule: EscapeRule,
    /// Whether materialization fails without the secret. Optional secrets
    /// are replaced with an empty literal.
    pub required: bool,
}

/// The placeholders of the built-in module.
pub const DEFAULT_RULES: [TokenRule; 3] = [
    TokenRule {
        token: KUBECONFIG_TOKEN,
        key: SecretKey::Kubeconfig,
        rule: EscapeRule::GoRawString,
        required: true,
    },
    TokenRule {
        token: CONTAINER_REPOSITORY_TOKEN,
        key: SecretKey::ContainerRepositoryUrl,
        rule: EscapeRule::Verbatim,
        required: false,
    },
    TokenRule {
        token: HELM_REPOSITORY_TOKEN,
        key: SecretKey::HelmRepositoryUrl,
        rule: EscapeRule::Verbatim,
        required: false,
    },
];

/// Whether a pipeline needs the privileged module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretRequirement {
    /// The run cannot start without secrets.
    Required,
    /// The run proceeds unprivileged if injection fails.
    Optional,
    /// No privileged stage runs.
    NotNeeded,
}

/// A privileged module written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializedSecrets {
    target: PathBuf,
    files: Vec<PathBuf>,
    injected: Vec<SecretKey>,
    defaulted: Vec<SecretKey>,
    keep: bool,
}

impl MaterializedSecrets {
    /// Directory holding the module.
    #[must_use]
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Files written.
    #[must_use]
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Secrets that were found and injected.
    #[must_use]
    pub fn injected(&self) -> &[SecretKey] {
        &self.injected
    }

    /// Optional secrets that were absent and left empty.
    #[must_use]
    pub fn defaulted(&self) -> &[SecretKey] {
        &self.defaulted
    }

    /// Registers the erase action with the run's cleanup registry.
    pub fn register_erase(&self, registry: &CleanupRegistry) {
        let target = self.target.clone();
        let keep = self.keep;
        registry.register(ERASE_CLEANUP_NAME, move || {
            erase_dir(&target, keep)
                .map(|_| ())
                .map_err(|e| e.to_string())
        });
    }
}

/// Writes and removes the privileged module.
///
/// The module directory is removed wholesale, so it must never be, or
/// contain, a directory the operator owns. The template directory is always
/// protected; [`SecretInjector::from_config`] adds the module, source and
/// working directories.
#[derive(Debug, Clone)]
pub struct SecretInjector {
    templates: TemplateSet,
    rules: Vec<TokenRule>,
    target: PathBuf,
    protected: Vec<PathBuf>,
    keep: bool,
}

impl SecretInjector {
    /// Creates an injector with the default placeholder rules.
    #[must_use]
    pub fn new(templates: TemplateSet, target: impl Into<PathBuf>) -> Self {
        let protected = templates.source().map(Path::to_path_buf).into_iter().collect();
        Self {
            templates,
            rules: DEFAULT_RULES.to_vec(),
            target: target.into(),
            protected,
            keep: false,
        }
    }

    /// Creates an injector for a run configuration.
    ///
    /// # Errors
    ///
    /// Returns `TemplatesMissing` if a configured template directory is
    /// unusable, and `UnsafeTarget` if the privileged directory overlaps
    /// the template, module, source or working directory.
    pub fn from_config(config: &Config) -> Result<Self, SecretError> {
        let injector = Self::new(TemplateSet::load(config)?, &config.privileged_dir)
            .with_protected([
                config.module_dir.clone(),
                config.source_dir.clone(),
                config.workdir.clone(),
            ])
            .with_keep(config.keep_privileged);
        injector.check_target()?;
        Ok(injector)
    }

    /// Adds directories the module directory must not be or contain.
    #[must_use]
    pub fn with_protected(mut self, dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        self.protected.extend(dirs);
        self
    }

    /// Fails if removing the module directory would remove a protected one.
    ///
    /// # Errors
    ///
    /// Returns `UnsafeTarget` naming the first overlapping directory.
    pub fn check_target(&self) -> Result<(), SecretError> {
        let target = normalize(&self.target);
        match self
            .protected
            .iter()
            .find(|dir| normalize(dir).starts_with(&target))
        {
            Some(dir) => Err(SecretError::UnsafeTarget {
                target: self.target.clone(),
                protected: dir.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Replaces the placeholder rules.
    #[must_use]
    pub fn with_rules(mut self, rules: Vec<TokenRule>) -> Self {
        self.rules = rules;
        self
    }

    /// Leaves the module on disk after the run.
    #[must_use]
    pub fn with_keep(mut self, keep: bool) -> Self {
        self.keep = keep;
        self
    }

    /// Directory the module is written to.
    #[must_use]
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Renders every template with secrets from `store` and writes the
    /// result to the target directory, replacing whatever a previous run
    /// left there.
    ///
    /// Nothing is written unless every required secret is present. If a
    /// write fails halfway the partial module is removed. When the cluster
    /// configuration was injected it is also written, unescaped, to
    /// [`KUBECONFIG_FILE`].
    ///
    /// # Errors
    ///
    /// Returns `UnsafeTarget` before touching anything if the module
    /// directory overlaps a protected one, `Missing` for an absent required
    /// secret, the store's error if a lookup fails, and `Io` if the module
    /// cannot be written.
    pub async fn materialize(&self, store: &dyn SecretStore) -> Result<MaterializedSecrets, SecretError> {
        self.check_target()?;

        let mut substitutions = Vec::with_capacity(self.rules.len());
        let mut injected = Vec::new();
        let mut defaulted = Vec::new();
        let mut kubeconfig = None;

        for rule in &self.rules {
            match store.lookup(rule.key).await? {
                Some(value) => {
                    substitutions.push(Substitution::new(rule.token, value.expose(), rule.rule));
                    injected.push(rule.key);
                    if rule.key == SecretKey::Kubeconfig {
                        kubeconfig = Some(value);
                    }
                }
                None if rule.required => {
                    return Err(SecretError::Missing {
                        key: rule.key.name().to_string(),
                        env_var: rule.key.env_var().to_string(),
                    });
                }
                None => {
                    substitutions.push(Substitution::new(rule.token, "", rule.rule));
                    defaulted.push(rule.key);
                }
            }
        }

        if self.target.exists() {
            debug!(dir = %self.target.display(), "Replacing stale privileged module");
            erase_dir(&self.target, false)?;
        }

        let files = match self.write_files(&substitutions, kubeconfig.as_ref()) {
            Ok(files) => files,
            Err(e) => {
                if let Err(cleanup) = erase_dir(&self.target, false) {
                    warn!(error = %cleanup, "Failed to remove partial privileged module");
                }
                return Err(e);
            }
        };

        info!(
            dir = %self.target.display(),
            injected = ?injected,
            defaulted = ?defaulted,
            "Privileged module materialized"
        );
        Ok(MaterializedSecrets {
            target: self.target.clone(),
            files,
            injected,
            defaulted,
            keep: self.keep,
        })
    }

    fn write_files(
        &self,
        substitutions: &[Substitution],
        kubeconfig: Option<&SecretValue>,
    ) -> Result<Vec<PathBuf>, SecretError> {
        create_private_dir(&self.target)?;

        let mut written = Vec::with_capacity(self.templates.files().len() + 1);
        for file in self.templates.files() {
            let rendered = render(&file.contents, substitutions);
            let left = remaining_tokens(&rendered, substitutions);
            if !left.is_empty() {
                warn!(file = %file.name, tokens = ?left, "Placeholders left after rendering");
            }
            let path = self.target.join(&file.name);
            write_private(&path, rendered.as_bytes())?;
            written.push(path);
        }
        if let Some(kubeconfig) = kubeconfig {
            let path = self.target.join(KUBECONFIG_FILE);
            write_private(&path, kubeconfig.expose().as_bytes())?;
            written.push(path);
        }
        Ok(written)
    }

    /// Removes the materialized module.
    ///
    /// Returns true if a directory was removed. A missing directory is not an
    /// error, and nothing is removed when the module is kept.
    ///
    /// # Errors
    ///
    /// Returns `UnsafeTarget` if the module directory overlaps a protected
    /// one, and `Io` if the directory exists but cannot be removed.
    pub fn erase(&self) -> Result<bool, SecretError> {
        self.check_target()?;
        erase_dir(&self.target, self.keep)
    }

    /// Materializes the module and registers its erase action, honouring
    /// the requirement of the pipeline.
    ///
    /// With `Optional`, a failed injection is logged and the run continues
    /// unprivileged (`Ok(None)`).
    ///
    /// # Errors
    ///
    /// With `Required`, any injection failure is returned as
    /// `CicdError::Secret`. An unsafe module directory is fatal either way.
    pub async fn acquire(
        &self,
        requirement: SecretRequirement,
        store: &dyn SecretStore,
        cleanup: &CleanupRegistry,
    ) -> Result<Option<MaterializedSecrets>, CicdError> {
        if requirement == SecretRequirement::NotNeeded {
            return Ok(None);
        }
        match self.materialize(store).await {
            Ok(materialized) => {
                materialized.register_erase(cleanup);
                Ok(Some(materialized))
            }
            Err(e @ SecretError::UnsafeTarget { .. }) => Err(e.into()),
            Err(e) if requirement == SecretRequirement::Optional => {
                warn!(error = %e, "Secrets unavailable, running unprivileged");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn erase_dir(target: &Path, keep: bool) -> Result<bool, SecretError> {
    if keep {
        info!(dir = %target.display(), "Keeping privileged module");
        return Ok(false);
    }
    match fs::remove_dir_all(target) {
        Ok(()) => {
            debug!(dir = %target.display(), "Privileged module erased");
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(source) => Err(SecretError::Io {
            path: target.to_path_buf(),
            source,
        }),
    }
}

/// Absolute form of `path` with `.` and `..` folded away, without touching
/// the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

fn create_private_dir(dir: &Path) -> Result<(), SecretError> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir).map_err(|source| SecretError::Io {
        path: dir.to_path_buf(),
        source,
    })
}

fn write_private(path: &Path, bytes: &[u8]) -> Result<(), SecretError> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
        .open(path)
        .and_then(|mut file| file.write_all(bytes))
        .map_err(|source| SecretError::Io {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::StaticSecretStore;
    use tempfile::TempDir;

    const KUBECONFIG: &str = "apiVersion: v1\nkind: Config\nusers:\n- name: `dev`\n";

    fn full_store() -> StaticSecretStore {
        StaticSecretStore::new()
            .with(SecretKey::Kubeconfig, KUBECONFIG)
            .with(SecretKey::ContainerRepositoryUrl, "registry.local:5000")
            .with(SecretKey::HelmRepositoryUrl, "oci://registry.local:5000/charts")
    }

    fn injector(dir: &TempDir) -> SecretInjector {
        SecretInjector::new(TemplateSet::builtin(), dir.path().join("privileged"))
    }

    #[test]
    fn test_builtin_templates_carry_every_placeholder() {
        let set = TemplateSet::builtin();
        let names: Vec<_> = set.files().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["secrets.go", "kubectl.go", "helm.go", "container.go"]);

        let secrets = set.files().iter().find(|f| f.name == "secrets.go").unwrap();
        for rule in DEFAULT_RULES {
            assert!(secrets.contents.contains(rule.token), "{}", rule.token);
        }
        for file in set.files() {
            assert!(file.contents.contains("package privileged"), "{}", file.name);
        }
    }

    #[test]
    fn test_builtin_helpers_reach_secrets_through_getters() {
        let set = TemplateSet::builtin();
        let helper = |name: &str| &set.files().iter().find(|f| f.name == name).unwrap().contents;

        assert!(helper("helm.go").contains("func HelmInstall("));
        assert!(helper("helm.go").contains("HELM_TIMEOUT"));
        assert!(helper("helm.go").contains("HelmRepositoryURL()"));
        assert!(helper("container.go").contains("ContainerRepositoryURL()"));
        assert!(helper("kubectl.go").contains("func KubectlApply("));
        assert!(helper("secrets.go").contains("func EnvOrSecret("));
        for file in set.files().iter().filter(|f| f.name != "secrets.go") {
            assert!(!file.contents.contains("__INJECTED_"), "{}", file.name);
        }
    }

    #[tokio::test]
    async fn test_materialize_substitutes_all_tokens() {
        let dir = TempDir::new().unwrap();
        let materialized = injector(&dir).materialize(&full_store()).await.unwrap();

        let secrets = fs::read_to_string(materialized.target().join("secrets.go")).unwrap();
        assert!(!secrets.contains("__INJECTED_KUBECTL_CONTEXT__"));
        assert!(!secrets.contains("__INJECTED_CONTAINER_REPOSITORY_URL__"));
        assert!(secrets.contains("registry.local:5000"));
        assert!(secrets.contains("- name: ` + \"`\" + `dev` + \"`\" + `"));
        assert_eq!(materialized.files().len(), 5);
        assert_eq!(materialized.injected().len(), 3);
    }

    #[tokio::test]
    async fn test_kubeconfig_file_is_written_raw_and_erased() {
        let dir = TempDir::new().unwrap();
        let injector = injector(&dir);
        let materialized = injector.materialize(&full_store()).await.unwrap();

        let path = materialized.target().join(KUBECONFIG_FILE);
        assert!(materialized.files().contains(&path));
        assert_eq!(fs::read_to_string(&path).unwrap(), KUBECONFIG);

        injector.erase().unwrap();
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_materialized_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let materialized = injector(&dir).materialize(&full_store()).await.unwrap();
        for file in materialized.files() {
            let mode = fs::metadata(file).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_missing_required_secret_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let store = StaticSecretStore::new().with(SecretKey::ContainerRepositoryUrl, "registry.local");

        let err = injector(&dir).materialize(&store).await.unwrap_err();
        assert!(matches!(err, SecretError::Missing { ref env_var, .. } if env_var == "KUBECONFIG_CONTENT"));
        assert!(!dir.path().join("privileged").exists());
    }

    #[tokio::test]
    async fn test_optional_urls_default_to_empty() {
        let dir = TempDir::new().unwrap();
        let store = StaticSecretStore::new().with(SecretKey::Kubeconfig, KUBECONFIG);

        let materialized = injector(&dir).materialize(&store).await.unwrap();
        let secrets = fs::read_to_string(materialized.target().join("secrets.go")).unwrap();
        assert!(secrets.contains("containerRepositoryURL = ``"));
        assert_eq!(
            materialized.defaulted(),
            &[SecretKey::ContainerRepositoryUrl, SecretKey::HelmRepositoryUrl]
        );
    }

    #[tokio::test]
    async fn test_stale_module_is_replaced() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("privileged");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("leftover.go"), "package privileged").unwrap();

        injector(&dir).materialize(&full_store()).await.unwrap();
        assert!(!target.join("leftover.go").exists());
        assert!(target.join("secrets.go").exists());
    }

    #[tokio::test]
    async fn test_template_dir_is_never_the_module_dir() {
        let dir = TempDir::new().unwrap();
        let templates = dir.path().join("privileged");
        fs::create_dir_all(&templates).unwrap();
        fs::write(templates.join("secrets.go"), "const k = `__INJECTED_KUBECTL_CONTEXT__`").unwrap();

        let injector = SecretInjector::new(TemplateSet::from_dir(&templates).unwrap(), &templates);
        let err = injector.materialize(&full_store()).await.unwrap_err();
        assert!(matches!(err, SecretError::UnsafeTarget { .. }));
        assert!(injector.erase().is_err());

        let nested = SecretInjector::new(TemplateSet::from_dir(&templates).unwrap(), dir.path().join("."));
        assert!(nested.materialize(&full_store()).await.is_err());

        let source = fs::read_to_string(templates.join("secrets.go")).unwrap();
        assert!(source.contains("__INJECTED_KUBECTL_CONTEXT__"));
    }

    #[test]
    fn test_from_config_rejects_overlapping_module_dir() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::new(dir.path());

        config.privileged_dir = dir.path().join("sub").join("..");
        let err = SecretInjector::from_config(&config).unwrap_err();
        assert!(matches!(err, SecretError::UnsafeTarget { ref protected, .. } if protected == dir.path()));
        assert_eq!(CicdError::from(err).exit_code(), 2);

        config.privileged_dir = dir.path().join("privileged");
        assert!(SecretInjector::from_config(&config).is_ok());
    }

    #[tokio::test]
    async fn test_unsafe_module_dir_is_fatal_even_when_optional() {
        let dir = TempDir::new().unwrap();
        let registry = CleanupRegistry::new();
        let injector = injector(&dir).with_protected([dir.path().join("privileged").join("src")]);

        let err = injector
            .acquire(SecretRequirement::Optional, &full_store(), &registry)
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_erase_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let injector = injector(&dir);
        injector.materialize(&full_store()).await.unwrap();

        assert!(injector.erase().unwrap());
        assert!(!injector.erase().unwrap());
        assert!(!injector.target().exists());
    }

    #[tokio::test]
    async fn test_keep_skips_erase() {
        let dir = TempDir::new().unwrap();
        let injector = injector(&dir).with_keep(true);
        injector.materialize(&full_store()).await.unwrap();

        assert!(!injector.erase().unwrap());
        assert!(injector.target().join("secrets.go").exists());
    }

    #[tokio::test]
    async fn test_acquire_registers_erase() {
        let dir = TempDir::new().unwrap();
        let registry = CleanupRegistry::new();
        let injector = injector(&dir);

        let materialized = injector
            .acquire(SecretRequirement::Required, &full_store(), &registry)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(registry.pending_names(), vec![ERASE_CLEANUP_NAME.to_string()]);

        assert!(registry.run_all().is_empty());
        assert!(!materialized.target().exists());
    }

    #[tokio::test]
    async fn test_acquire_optional_runs_unprivileged() {
        let dir = TempDir::new().unwrap();
        let registry = CleanupRegistry::new();

        let acquired = injector(&dir)
            .acquire(SecretRequirement::Optional, &StaticSecretStore::new(), &registry)
            .await
            .unwrap();
        assert!(acquired.is_none());
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_acquire_required_is_fatal() {
        let dir = TempDir::new().unwrap();
        let registry = CleanupRegistry::new();

        let err = injector(&dir)
            .acquire(SecretRequirement::Required, &StaticSecretStore::new(), &registry)
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_from_dir_requires_secrets_template() {
        let dir = TempDir::new().unwrap();
        let err = TemplateSet::from_dir(dir.path()).unwrap_err();
        assert!(matches!(err, SecretError::TemplatesMissing { .. }));

        fs::write(dir.path().join("secrets.go"), "const k = `__INJECTED_KUBECTL_CONTEXT__`").unwrap();
        fs::write(dir.path().join("extra.go"), "package privileged").unwrap();
        let set = TemplateSet::from_dir(dir.path()).unwrap();
        let names: Vec<_> = set.files().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["extra.go", "secrets.go"]);
        assert_eq!(set.source(), Some(dir.path()));
    }
}
