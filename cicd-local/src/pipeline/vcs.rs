//! Version-control access for blue-green staging.

use crate::errors::{CicdError, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::LazyLock;
use tokio::process::Command;
use tracing::debug;

/// File holding the declared version of a release.
pub const VERSION_FILE: &str = "VERSION";

static VERSION_CHUNK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+|\D+").unwrap_or_else(|e| unreachable!("version pattern: {e}")));

/// The ref the working tree was on when a run started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum OriginalRef {
    /// A branch name.
    Branch(String),
    /// A commit hash, when HEAD was detached.
    Detached(String),
}

impl OriginalRef {
    /// The revision to check out to return here.
    #[must_use]
    pub fn revision(&self) -> &str {
        match self {
            Self::Branch(name) | Self::Detached(name) => name,
        }
    }
}

impl std::fmt::Display for OriginalRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Branch(name) => write!(f, "{name}"),
            Self::Detached(sha) => write!(f, "{sha} (detached)"),
        }
    }
}

/// The version-control operations blue-green staging needs.
#[async_trait]
pub trait Vcs: Send + Sync {
    /// The current branch, or the commit when detached.
    ///
    /// # Errors
    ///
    /// Returns a precondition error if the working tree is not a repository.
    async fn current_ref(&self) -> Result<OriginalRef>;

    /// All tags.
    ///
    /// # Errors
    ///
    /// Returns a precondition error if tags cannot be listed.
    async fn tags(&self) -> Result<Vec<String>>;

    /// Checks out `revision`.
    ///
    /// # Errors
    ///
    /// Returns an error describing why the checkout failed.
    async fn checkout(&self, revision: &str) -> Result<()>;

    /// Checks out `revision` without a runtime. Used by cleanup actions,
    /// which may run from `Drop` or an interrupt handler.
    ///
    /// # Errors
    ///
    /// Returns an error describing why the checkout failed.
    fn checkout_blocking(&self, revision: &str) -> Result<()>;

    /// Reads the declared version of the checked-out tree.
    ///
    /// # Errors
    ///
    /// Returns a precondition error if the version file is missing or empty.
    async fn read_version(&self) -> Result<String>;
}

/// `Vcs` backed by the `git` executable.
#[derive(Debug, Clone)]
pub struct GitCli {
    bin: String,
    workdir: PathBuf,
}

type GitOutput = std::result::Result<String, String>;

impl GitCli {
    /// Creates a client for the repository at `workdir`.
    #[must_use]
    pub fn new(bin: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            workdir: workdir.into(),
        }
    }

    /// The repository directory.
    #[must_use]
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Runs git and returns trimmed stdout, or stderr on a non-zero exit.
    async fn run(&self, args: &[&str]) -> Result<GitOutput> {
        debug!(args = ?args, "git");
        let output = Command::new(&self.bin)
            .args(args)
            .current_dir(&self.workdir)
            .kill_on_drop(true)
            .output()
            .await;
        self.interpret(output)
    }

    fn run_blocking(&self, args: &[&str]) -> Result<GitOutput> {
        debug!(args = ?args, "git (blocking)");
        let output = std::process::Command::new(&self.bin)
            .args(args)
            .current_dir(&self.workdir)
            .output();
        self.interpret(output)
    }

    fn interpret(&self, output: std::io::Result<Output>) -> Result<GitOutput> {
        let output = match output {
            Ok(output) => output,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CicdError::precondition(format!("'{}' not found on PATH", self.bin)));
            }
            Err(e) => return Err(e.into()),
        };
        if output.status.success() {
            Ok(Ok(String::from_utf8_lossy(&output.stdout).trim().to_string()))
        } else {
            Ok(Err(String::from_utf8_lossy(&output.stderr).trim().to_string()))
        }
    }
}

fn checkout_result(revision: &str, output: GitOutput) -> Result<()> {
    output.map(|_| ()).map_err(|stderr| {
        CicdError::precondition(format!("git checkout {revision} failed: {stderr}"))
    })
}

#[async_trait]
impl Vcs for GitCli {
    async fn current_ref(&self) -> Result<OriginalRef> {
        if let Ok(branch) = self.run(&["symbolic-ref", "--short", "-q", "HEAD"]).await? {
            if !branch.is_empty() {
                return Ok(OriginalRef::Branch(branch));
            }
        }
        match self.run(&["rev-parse", "HEAD"]).await? {
            Ok(sha) if !sha.is_empty() => Ok(OriginalRef::Detached(sha)),
            Ok(_) => Err(CicdError::precondition("git rev-parse HEAD returned nothing")),
            Err(stderr) => Err(CicdError::precondition(format!("not a git repository: {stderr}"))),
        }
    }

    async fn tags(&self) -> Result<Vec<String>> {
        match self.run(&["tag", "--list"]).await? {
            Ok(out) => Ok(out
                .lines()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(ToString::to_string)
                .collect()),
            Err(stderr) => Err(CicdError::precondition(format!("cannot list tags: {stderr}"))),
        }
    }

    async fn checkout(&self, revision: &str) -> Result<()> {
        checkout_result(revision, self.run(&["checkout", "--quiet", revision]).await?)
    }

    fn checkout_blocking(&self, revision: &str) -> Result<()> {
        checkout_result(revision, self.run_blocking(&["checkout", "--quiet", revision])?)
    }

    async fn read_version(&self) -> Result<String> {
        let path = self.workdir.join(VERSION_FILE);
        let version = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| CicdError::precondition(format!("cannot read {}: {e}", path.display())))?;
        parse_version(&path, &version)
    }
}

fn parse_version(path: &Path, contents: &str) -> Result<String> {
    let version = contents.trim();
    if version.is_empty() {
        return Err(CicdError::precondition(format!("{} is empty", path.display())));
    }
    Ok(version.to_string())
}

/// Compares two version strings the way a version sort does: digit runs
/// numerically, everything else lexically, a leading `v` ignored.
#[must_use]
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let strip = |s: &str| {
        let s = s.trim();
        s.strip_prefix(['v', 'V']).unwrap_or(s).to_string()
    };
    let (a, b) = (strip(a), strip(b));
    let mut left = VERSION_CHUNK.find_iter(&a).map(|m| m.as_str());
    let mut right = VERSION_CHUNK.find_iter(&b).map(|m| m.as_str());

    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let order = match (x.parse::<u128>(), y.parse::<u128>()) {
                    (Ok(nx), Ok(ny)) => nx.cmp(&ny),
                    _ => x.cmp(y),
                };
                if order != Ordering::Equal {
                    return order;
                }
            }
        }
    }
}

/// Picks the previous release: the highest tag by version sort.
#[must_use]
pub fn select_previous_release(tags: &[String]) -> Option<&str> {
    tags.iter()
        .map(String::as_str)
        .filter(|t| !t.trim().is_empty())
        .max_by(|a, b| compare_versions(a, b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_selects_highest_tag() {
        assert_eq!(select_previous_release(&tags(&["1.0.0", "1.1.0", "2.0.0"])), Some("2.0.0"));
        assert_eq!(select_previous_release(&tags(&["2.0.0", "1.0.0", "1.1.0"])), Some("2.0.0"));
    }

    #[test]
    fn test_numeric_chunks_sort_numerically() {
        assert_eq!(select_previous_release(&tags(&["1.9.0", "1.10.0", "1.2.0"])), Some("1.10.0"));
        assert_eq!(select_previous_release(&tags(&["v1.2.0", "v1.11.3"])), Some("v1.11.3"));
    }

    #[test]
    fn test_no_tags() {
        assert_eq!(select_previous_release(&[]), None);
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("1.0.0", "v1.0.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.0", "1.0.1"), Ordering::Less);
        assert_eq!(compare_versions("2.0.0-rc1", "2.0.0-rc2"), Ordering::Less);
    }

    #[tokio::test]
    async fn test_git_cli_reads_version_of_workdir() {
        let dir = tempfile::TempDir::new().unwrap();
        let git = GitCli::new("git", dir.path());
        assert_eq!(git.read_version().await.unwrap_err().exit_code(), 2);

        std::fs::write(dir.path().join(VERSION_FILE), "  \n").unwrap();
        assert!(git.read_version().await.is_err());

        std::fs::write(dir.path().join(VERSION_FILE), "2.1.0\n").unwrap();
        assert_eq!(git.read_version().await.unwrap(), "2.1.0");
    }

    #[tokio::test]
    async fn test_missing_git_is_precondition_failure() {
        let dir = tempfile::TempDir::new().unwrap();
        let git = GitCli::new("git-that-does-not-exist", dir.path());

        assert_eq!(git.tags().await.unwrap_err().exit_code(), 2);
        assert_eq!(git.checkout_blocking("main").unwrap_err().exit_code(), 2);
    }

    #[test]
    fn test_original_ref_revision() {
        assert_eq!(OriginalRef::Branch("main".into()).revision(), "main");
        assert_eq!(OriginalRef::Detached("abc123".into()).to_string(), "abc123 (detached)");
    }
}
