// file: src/steps/mod.rs
// version: 2.0.0
// guid: 3b899313-fcb9-459c-8fd4-e2b7caba5602

//! Executes a single provisioning stage: idempotence check, then preview
//! (dry-run) or action (live).

use crate::context::OrchestratorContext;
use crate::stages::Stage;
use crate::SetupError;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Status of a step execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    /// Action ran and its effect was confirmed
    Applied,

    /// Host already matched intent; nothing was run
    AlreadyConfigured,

    /// Dry-run: the action was described, not run
    Previewed,

    /// Action ran but its effect could not be confirmed
    AppliedUnverified,

    /// Action or check failed
    Failed,
}

impl StepStatus {
    pub fn label(&self) -> &'static str {
        match self {
            StepStatus::Applied => "applied",
            StepStatus::AlreadyConfigured => "already configured",
            StepStatus::Previewed => "previewed",
            StepStatus::AppliedUnverified => "applied (unverified)",
            StepStatus::Failed => "failed",
        }
    }
}

/// Result of executing a provisioning step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub stage: Stage,
    pub status: StepStatus,
    pub ok: bool,

    /// Human-readable summary, or the preview in dry-run
    pub output: String,

    pub error: Option<String>,
    pub failing_command: Option<String>,
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

impl StepResult {
    fn success(stage: Stage, status: StepStatus, output: String, duration: Duration) -> Self {
        Self {
            stage,
            status,
            ok: true,
            output,
            error: None,
            failing_command: None,
            exit_code: None,
            duration,
        }
    }

    fn failure(stage: Stage, err: &SetupError, duration: Duration) -> Self {
        let exit_code = match err {
            SetupError::Execution { exit_code, .. } | SetupError::Step { exit_code, .. } => *exit_code,
            _ => None,
        };
        Self {
            stage,
            status: StepStatus::Failed,
            ok: false,
            output: String::new(),
            error: Some(err.to_string()),
            failing_command: err.failing_command().map(str::to_string),
            exit_code,
            duration,
        }
    }

    /// Error the orchestrator raises for this failed step
    pub fn to_error(&self) -> SetupError {
        SetupError::Step {
            stage: self.stage.name().to_string(),
            criticality: self.stage.criticality(),
            command: self.failing_command.clone(),
            exit_code: self.exit_code,
            message: self
                .error
                .clone()
                .unwrap_or_else(|| self.status.label().to_string()),
        }
    }
}

/// Runs stages against the context's host
pub struct StepRunner<'a> {
    ctx: &'a OrchestratorContext,
}

impl<'a> StepRunner<'a> {
    pub fn new(ctx: &'a OrchestratorContext) -> Self {
        Self { ctx }
    }

    /// Never returns `Err`: failures are captured in the [`StepResult`]
    /// and the caller decides what they mean.
    pub async fn execute(&self, stage: Stage) -> StepResult {
        let started = Instant::now();
        info!("[{}] checking", stage);

        match stage.is_satisfied(self.ctx).await {
            Ok(true) => {
                info!("[{}] already configured", stage);
                return StepResult::success(
                    stage,
                    StepStatus::AlreadyConfigured,
                    "already configured".to_string(),
                    started.elapsed(),
                );
            }
            Ok(false) => debug!("[{}] needs changes", stage),
            Err(e) => {
                error!("[{}] idempotence check failed: {}", stage, e);
                return StepResult::failure(stage, &e, started.elapsed());
            }
        }

        if self.ctx.dry_run() {
            let preview = stage.preview(self.ctx).await;
            info!("[{}] dry-run preview:\n{}", stage, preview);
            return StepResult::success(
                stage,
                StepStatus::Previewed,
                preview.to_string(),
                started.elapsed(),
            );
        }

        match stage.apply(self.ctx).await {
            Ok(output) if output.verified => {
                info!("[{}] {}", stage, output.summary);
                StepResult::success(stage, StepStatus::Applied, output.summary, started.elapsed())
            }
            Ok(output) => {
                warn!("[{}] {}", stage, output.summary);
                StepResult::success(
                    stage,
                    StepStatus::AppliedUnverified,
                    output.summary,
                    started.elapsed(),
                )
            }
            Err(e) => {
                error!("[{}] failed: {}", stage, e);
                StepResult::failure(stage, &e, started.elapsed())
            }
        }
    }
}
