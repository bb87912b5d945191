//! Execution backend that shells out to the `dagger` CLI.

use super::{BackendCall, BackendOutcome, ExecutionBackend};
use crate::errors::{CicdError, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const CHUNK_SIZE: usize = 8 * 1024;

/// Runs stage functions through `dagger -m <module> call …`.
///
/// Output is forwarded chunk by chunk, without line buffering, both to the
/// operator's terminal and to the stage log. The child is killed when the
/// future running it is dropped.
#[derive(Debug, Clone)]
pub struct DaggerBackend {
    bin: String,
    workdir: Option<PathBuf>,
    echo: bool,
}

impl DaggerBackend {
    /// Creates a backend using the given executable.
    #[must_use]
    pub fn new(bin: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            workdir: None,
            echo: true,
        }
    }

    /// Runs calls from `dir`.
    #[must_use]
    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    /// Turns forwarding to the terminal on or off. The log always gets
    /// everything.
    #[must_use]
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }
}

#[async_trait]
impl ExecutionBackend for DaggerBackend {
    async fn execute(&self, call: &BackendCall, log_path: &Path) -> Result<BackendOutcome> {
        let args = call.to_args();
        debug!(bin = %self.bin, args = ?args, log = %log_path.display(), "Spawning backend");

        let log = Arc::new(Mutex::new(File::create(log_path).await?));

        let mut cmd = Command::new(&self.bin);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CicdError::precondition(format!(
                    "execution backend '{}' not found on PATH",
                    self.bin
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let stdout = child.stdout.take().map(|out| {
            let sink = self.echo.then(tokio::io::stdout);
            tokio::spawn(tee(out, sink, Arc::clone(&log)))
        });
        let stderr = child.stderr.take().map(|err| {
            let sink = self.echo.then(tokio::io::stderr);
            tokio::spawn(tee(err, sink, Arc::clone(&log)))
        });

        let status = child.wait().await?;

        for task in [stdout, stderr].into_iter().flatten() {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Output forwarding failed"),
                Err(e) => warn!(error = %e, "Output forwarding task panicked"),
            }
        }
        log.lock().await.flush().await?;

        Ok(BackendOutcome {
            exit_code: status.code(),
        })
    }
}

/// Copies `source` to the optional operator stream and the shared log.
async fn tee<R, W>(mut source: R, mut operator: Option<W>, log: Arc<Mutex<File>>) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let chunk = &buf[..n];
        if let Some(out) = operator.as_mut() {
            out.write_all(chunk).await?;
            out.flush().await?;
        }
        log.lock().await.write_all(chunk).await?;
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Writes a shell script standing in for the backend executable.
    fn fake_bin(dir: &Path, script: &str) -> String {
        let path = dir.join("fake-dagger");
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[tokio::test]
    async fn test_output_is_logged() {
        let dir = TempDir::new().unwrap();
        let bin = fake_bin(dir.path(), "echo \"out $4\"\necho err >&2");
        let backend = DaggerBackend::new(bin).with_echo(false);
        let log = dir.path().join("stage.log");

        let outcome = backend
            .execute(&BackendCall::new(dir.path(), "build"), &log)
            .await
            .unwrap();

        assert!(outcome.is_success());
        let logged = std::fs::read_to_string(&log).unwrap();
        assert!(logged.contains("out build"));
        assert!(logged.contains("err"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_reported() {
        let dir = TempDir::new().unwrap();
        let bin = fake_bin(dir.path(), "echo failing\nexit 3");
        let backend = DaggerBackend::new(bin).with_echo(false);

        let outcome = backend
            .execute(&BackendCall::new(dir.path(), "unit-test"), &dir.path().join("u.log"))
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_missing_binary_is_precondition() {
        let dir = TempDir::new().unwrap();
        let backend = DaggerBackend::new("dagger-binary-that-does-not-exist");

        let err = backend
            .execute(&BackendCall::new(dir.path(), "build"), &dir.path().join("b.log"))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
