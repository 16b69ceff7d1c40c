// file: src/diagnostics/mod.rs
// version: 1.1.0
// guid: 5adb1572-29b2-4c5d-bae0-2fb3c441975c

//! Failure snapshot written when a run enters the failed state
//!
//! Bundles are never overwritten and never cleaned up automatically.

use crate::context::OrchestratorContext;
use crate::probe::path_exists;
use crate::recovery::recovery_instructions;
use crate::runner::{output_or_empty, CommandRunner};
use crate::stages::Stage;
use crate::{Result, SetupError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::PathBuf;
use tracing::{info, warn};

/// Lines of the run log kept in a bundle
pub const LOG_TAIL_LINES: usize = 50;

const BUNDLE_PREFIX: &str = "container-host-setup";

/// Host state captured at the moment of failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticBundle {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub exit_code: i32,
    pub stage: Option<Stage>,
    pub failing_command: Option<String>,
    pub error: String,
    pub recovery: Vec<String>,
    pub log_tail: Vec<String>,
    pub process_list: String,
    pub network_state: String,
    pub package_tail: String,
    pub journal: String,
}

/// Where a bundle ended up on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundlePaths {
    pub error_file: PathBuf,
    pub debug_file: PathBuf,
}

fn tail(contents: &str, lines: usize) -> Vec<String> {
    let all: Vec<&str> = contents.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].iter().map(|l| l.to_string()).collect()
}

pub struct DiagnosticCapture<'a> {
    ctx: &'a OrchestratorContext,
}

impl<'a> DiagnosticCapture<'a> {
    pub fn new(ctx: &'a OrchestratorContext) -> Self {
        Self { ctx }
    }

    /// Gather the snapshot; every probe is best-effort
    pub async fn snapshot(&self, err: &SetupError, stage: Option<Stage>) -> DiagnosticBundle {
        let runner: &dyn CommandRunner = self.ctx.runner();

        let log_tail = match runner.read_file(&self.ctx.paths.log_file).await {
            Ok(Some(contents)) => tail(&contents, LOG_TAIL_LINES),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Could not read run log: {}", e);
                Vec::new()
            }
        };

        DiagnosticBundle {
            run_id: self.ctx.run_id.to_string(),
            timestamp: Utc::now(),
            exit_code: err.exit_code(),
            stage,
            failing_command: err.failing_command().map(str::to_string),
            error: err.to_string(),
            recovery: recovery_instructions(err, self.ctx),
            log_tail,
            process_list: output_or_empty(runner, &["ps", "aux"]).await,
            network_state: output_or_empty(runner, &["ss", "-tulpn"]).await,
            package_tail: output_or_empty(runner, &["tail", "-n", "20", "/var/log/dpkg.log"]).await,
            journal: output_or_empty(runner, &["journalctl", "--no-pager", "-n", "50"]).await,
        }
    }

    /// Write `<prefix>-<timestamp>.error` and `.debug`; an existing bundle
    /// with the same name gets the run id appended instead of being replaced
    pub async fn write(&self, bundle: &DiagnosticBundle) -> Result<BundlePaths> {
        let runner = self.ctx.runner();
        let dir = &self.ctx.paths.diagnostics_dir;
        // The invoking directory keeps its own permissions
        if !path_exists(runner, dir).await {
            let dir_str = dir.to_string_lossy();
            let mkdir = ["install", "-d", "-m", "700", dir_str.as_ref()];
            crate::runner::run_checked(runner, &mkdir).await?;
        }

        let stamp = bundle.timestamp.format("%Y%m%d-%H%M%S").to_string();
        let mut base = format!("{}-{}", BUNDLE_PREFIX, stamp);
        if runner.read_file(&dir.join(format!("{}.error", base))).await?.is_some() {
            base = format!("{}-{}", base, bundle.run_id);
        }

        let paths = BundlePaths {
            error_file: dir.join(format!("{}.error", base)),
            debug_file: dir.join(format!("{}.debug", base)),
        };
        runner
            .write_file(&paths.error_file, &render_summary(bundle), 0o600)
            .await?;
        runner
            .write_file(&paths.debug_file, &render_debug(bundle)?, 0o600)
            .await?;

        info!("Diagnostic bundle written to {}", paths.error_file.display());
        Ok(paths)
    }
}

/// Short human-readable summary with recovery commands
pub fn render_summary(bundle: &DiagnosticBundle) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "container-host-setup failed at {}", bundle.timestamp.to_rfc3339());
    let _ = writeln!(out, "run id:    {}", bundle.run_id);
    if let Some(stage) = bundle.stage {
        let _ = writeln!(out, "stage:     {}", stage);
    }
    if let Some(command) = &bundle.failing_command {
        let _ = writeln!(out, "command:   {}", command);
    }
    let _ = writeln!(out, "exit code: {}", bundle.exit_code);
    let _ = writeln!(out, "error:     {}", bundle.error);
    let _ = writeln!(out);
    let _ = writeln!(out, "Recovery:");
    for line in &bundle.recovery {
        let _ = writeln!(out, "  {}", line);
    }
    out
}

/// Full snapshot, summary first
pub fn render_debug(bundle: &DiagnosticBundle) -> Result<String> {
    let mut out = render_summary(bundle);
    let sections = [
        ("Run Log (tail)", bundle.log_tail.join("\n")),
        ("Process List", bundle.process_list.clone()),
        ("Network State", bundle.network_state.clone()),
        ("Package Log (tail)", bundle.package_tail.clone()),
        ("Journal", bundle.journal.clone()),
    ];
    for (title, body) in sections {
        let _ = writeln!(out, "\n=== {} ===", title);
        if body.trim().is_empty() {
            out.push_str("(unavailable)\n");
        } else {
            out.push_str(body.trim_end());
            out.push('\n');
        }
    }
    let _ = writeln!(out, "\n=== JSON ===");
    out.push_str(&serde_json::to_string_pretty(bundle)?);
    out.push('\n');
    Ok(out)
}
