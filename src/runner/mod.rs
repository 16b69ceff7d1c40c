// file: src/runner/mod.rs
// version: 2.0.0
// guid: 194c0668-cc86-44dc-9cb1-1e9c8c7b7043

//! Command execution capability shared by every component
//!
//! All interaction with the host (processes and managed files) goes through
//! [`CommandRunner`], so the whole orchestrator can run against
//! [`fake::FakeHost`] in tests.

pub mod fake;
pub mod local;

pub use fake::FakeHost;
pub use local::LocalRunner;

use crate::{Result, SetupError};
use std::path::Path;
use std::time::Duration;

/// Captured result of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stderr if present, stdout otherwise
    pub fn error_text(&self) -> &str {
        if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        }
    }
}

/// Trait for executing commands and touching managed files on the host
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a process to completion.
    ///
    /// Returns `Err` only when the process could not be started; a non-zero
    /// exit is reported through [`CommandOutput::exit_code`].
    async fn run(&self, argv: &[&str]) -> Result<CommandOutput>;

    /// Read a file, `None` when it does not exist
    async fn read_file(&self, path: &Path) -> Result<Option<String>>;

    /// Atomically replace a file and set its permission bits
    async fn write_file(&self, path: &Path, contents: &str, mode: u32) -> Result<()>;

    /// Remove a file; missing files are not an error
    async fn remove_file(&self, path: &Path) -> Result<()>;

    /// Pause between polling attempts
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Render argv as a single shell-like line for logs and diagnostics
pub fn display_command(argv: &[&str]) -> String {
    argv.iter()
        .map(|arg| {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                format!("'{}'", arg.replace('\'', "'\\''"))
            } else {
                (*arg).to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Run a command and turn a non-zero exit into [`SetupError::Execution`]
pub async fn run_checked(runner: &dyn CommandRunner, argv: &[&str]) -> Result<CommandOutput> {
    let output = runner.run(argv).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(SetupError::execution(
            display_command(argv),
            Some(output.exit_code),
            output.error_text(),
        ))
    }
}

/// Run a command as a boolean probe; spawn errors count as `false`
pub async fn check(runner: &dyn CommandRunner, argv: &[&str]) -> bool {
    runner
        .run(argv)
        .await
        .map(|output| output.success())
        .unwrap_or(false)
}

/// Run a command and return its stdout, or an empty string on failure
pub async fn output_or_empty(runner: &dyn CommandRunner, argv: &[&str]) -> String {
    match runner.run(argv).await {
        Ok(output) if output.success() => output.stdout,
        _ => String::new(),
    }
}

/// Write a file only when its contents differ; returns whether it changed
pub async fn ensure_file(
    runner: &dyn CommandRunner,
    path: &Path,
    contents: &str,
    mode: u32,
) -> Result<bool> {
    if runner.read_file(path).await?.as_deref() == Some(contents) {
        return Ok(false);
    }
    runner.write_file(path, contents, mode).await?;
    Ok(true)
}
