// file: src/runner/local.rs
// version: 2.0.0
// guid: 175499fd-016b-407b-ba8e-28b48684034f

//! Local command execution on the host being provisioned

use super::{display_command, CommandOutput, CommandRunner};
use crate::{Result, SetupError};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error};

/// Runs processes directly on this machine
pub struct LocalRunner {
    timeout: Duration,
}

impl LocalRunner {
    /// Create a runner with the default 30 minute per-command timeout
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30 * 60))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for LocalRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CommandRunner for LocalRunner {
    async fn run(&self, argv: &[&str]) -> Result<CommandOutput> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SetupError::config("empty command line"))?;
        let line = display_command(argv);
        debug!("Executing local command: {}", line);

        let child = Command::new(program)
            .args(args)
            .env("DEBIAN_FRONTEND", "noninteractive")
            .env("NEEDRESTART_MODE", "a")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| SetupError::execution(&line, None, format!("Failed to execute command: {}", e)))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                SetupError::execution(
                    &line,
                    None,
                    format!("timed out after {} seconds", self.timeout.as_secs()),
                )
            })??;

        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        };

        if result.success() {
            debug!("Command executed successfully: {} bytes of output", result.stdout.len());
        } else {
            debug!("Command '{}' exited with {}", line, result.exit_code);
        }
        Ok(result)
    }

    async fn read_file(&self, path: &Path) -> Result<Option<String>> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file(&self, path: &Path, contents: &str, mode: u32) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| SetupError::config(format!("{} has no parent directory", path.display())))?;
        std::fs::create_dir_all(parent)?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(mode))?;
        tmp.write_all(contents.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| {
            error!("Failed to replace {}: {}", path.display(), e);
            SetupError::Io(e.error)
        })?;
        debug!("Wrote {} (mode {:o})", path.display(), mode);
        Ok(())
    }

    async fn remove_file(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_run_captures_exit_code() {
        let runner = LocalRunner::new();
        let ok = runner.run(&["sh", "-c", "echo hello"]).await.unwrap();
        assert!(ok.success());
        assert_eq!(ok.stdout.trim(), "hello");

        let failed = runner.run(&["sh", "-c", "echo oops >&2; exit 7"]).await.unwrap();
        assert_eq!(failed.exit_code, 7);
        assert_eq!(failed.error_text(), "oops");
    }

    #[tokio::test]
    async fn test_run_missing_program_is_error() {
        let runner = LocalRunner::new();
        assert!(runner.run(&["definitely-not-a-real-command-12345"]).await.is_err());
        assert!(runner.run(&[]).await.is_err());
    }

    #[tokio::test]
    async fn test_write_file_sets_mode_and_replaces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/report.txt");
        let runner = LocalRunner::new();

        runner.write_file(&path, "first", 0o600).await.unwrap();
        runner.write_file(&path, "second", 0o600).await.unwrap();

        assert_eq!(runner.read_file(&path).await.unwrap().as_deref(), Some("second"));
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        runner.remove_file(&path).await.unwrap();
        runner.remove_file(&path).await.unwrap();
        assert!(runner.read_file(&path).await.unwrap().is_none());
    }
}
