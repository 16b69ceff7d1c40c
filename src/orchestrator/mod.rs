// file: src/orchestrator/mod.rs
// version: 1.1.0
// guid: 7847da5b-8abc-4f79-a521-a3aa45aa5a30

//! Run state machine
//!
//! `Init -> PreValidate -> Installing(stage)* -> PostValidate -> Reporting ->
//! Hardening -> Done`, with `Failed` reachable from every state. This is the
//! only place that decides between abort, continue and cleanup.

pub mod interrupt;

pub use interrupt::{GatedRunner, InterruptLatch};

use crate::context::OrchestratorContext;
use crate::diagnostics::DiagnosticCapture;
use crate::ports::Service;
use crate::probe::listening_ports;
use crate::recovery::{hardening_instructions, Cleanup};
use crate::reporter::ReportGenerator;
use crate::stages::{Criticality, Stage};
use crate::steps::{StepResult, StepRunner, StepStatus};
use crate::validation::{post_checks, pre_checks, Phase, ValidationGate};
use crate::{Result, SetupError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "state")]
pub enum RunState {
    Init,
    PreValidate,
    Installing { stage: Stage },
    PostValidate,
    Reporting,
    Hardening,
    Done,
    Failed {
        stage: Option<Stage>,
        bundle: Option<PathBuf>,
    },
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Init => f.write_str("init"),
            RunState::PreValidate => f.write_str("pre-validate"),
            RunState::Installing { stage } => write!(f, "installing({})", stage),
            RunState::PostValidate => f.write_str("post-validate"),
            RunState::Reporting => f.write_str("reporting"),
            RunState::Hardening => f.write_str("hardening"),
            RunState::Done => f.write_str("done"),
            RunState::Failed { stage: Some(stage), .. } => write!(f, "failed({})", stage),
            RunState::Failed { stage: None, .. } => f.write_str("failed"),
        }
    }
}

/// Ordered record of everything the machine did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "event")]
pub enum RunEvent {
    Transition { seq: u64, from: RunState, to: RunState },
    StageStarted { seq: u64, stage: Stage },
    StageFinished { seq: u64, stage: Stage, status: StepStatus },
}

impl RunEvent {
    pub fn seq(&self) -> u64 {
        match self {
            RunEvent::Transition { seq, .. }
            | RunEvent::StageStarted { seq, .. }
            | RunEvent::StageFinished { seq, .. } => *seq,
        }
    }
}

/// What a finished run hands back to the CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub dry_run: bool,
    pub results: Vec<StepResult>,
    pub warnings: Vec<String>,
    /// sshd restarted but the new port never showed a listener
    pub hardening_unverified: bool,
    pub report_path: Option<PathBuf>,
}

impl RunSummary {
    pub fn exit_code(&self) -> i32 {
        if self.hardening_unverified {
            1
        } else {
            0
        }
    }
}

pub struct Orchestrator {
    ctx: OrchestratorContext,
    port_requests: Vec<(Service, u32)>,
    state: RunState,
    events: Vec<RunEvent>,
    seq: u64,
    results: Vec<StepResult>,
    warnings: Vec<String>,
    in_flight: Option<Stage>,
    mutated: bool,
    hardening_unverified: bool,
    report_path: Option<PathBuf>,
    latch: InterruptLatch,
}

impl Orchestrator {
    pub fn new(mut ctx: OrchestratorContext) -> Self {
        let latch = InterruptLatch::default();
        let gated = GatedRunner::new(ctx.shared_runner(), latch.clone());
        ctx.set_runner(Arc::new(gated));
        Self {
            ctx,
            port_requests: Vec::new(),
            state: RunState::Init,
            events: Vec::new(),
            seq: 0,
            results: Vec::new(),
            warnings: Vec::new(),
            in_flight: None,
            mutated: false,
            hardening_unverified: false,
            report_path: None,
            latch,
        }
    }

    /// Port allocations applied to the registry during `Init`
    pub fn with_port_requests(mut self, requests: Vec<(Service, u32)>) -> Self {
        self.port_requests = requests;
        self
    }

    pub fn context(&self) -> &OrchestratorContext {
        &self.ctx
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn events(&self) -> &[RunEvent] {
        &self.events
    }

    pub fn results(&self) -> &[StepResult] {
        &self.results
    }

    /// Bundle written on entry to `Failed`, if any
    pub fn bundle_path(&self) -> Option<&PathBuf> {
        match &self.state {
            RunState::Failed { bundle, .. } => bundle.as_ref(),
            _ => None,
        }
    }

    pub async fn run(&mut self) -> Result<RunSummary> {
        self.run_until(std::future::pending::<String>()).await
    }

    /// Run to completion unless `interrupt` resolves first; its output names
    /// the signal. The command in flight when the signal arrives is allowed
    /// to finish and nothing new is started afterwards.
    pub async fn run_until<F>(&mut self, interrupt: F) -> Result<RunSummary>
    where
        F: Future<Output = String>,
    {
        let latch = self.latch.clone();
        let outcome = {
            let drive = self.drive();
            tokio::pin!(drive);
            tokio::pin!(interrupt);
            let mut signalled = false;
            loop {
                tokio::select! {
                    biased;
                    signal = &mut interrupt, if !signalled => {
                        warn!("Received {}, stopping after the running command", signal);
                        latch.trip(signal);
                        signalled = true;
                    }
                    result = &mut drive => break result,
                }
            }
        };
        let outcome = match (outcome, latch.signal()) {
            (Err(e), Some(signal)) if !matches!(e, SetupError::Interrupted(_)) => {
                debug!("{} while interrupted: {}", signal, e);
                Err(SetupError::Interrupted(signal))
            }
            (outcome, _) => outcome,
        };
        // Nothing of the run is still executing; cleanup may use the host
        latch.release();

        match outcome {
            Ok(()) => Ok(self.summary()),
            Err(e) => Err(self.fail(e).await),
        }
    }

    fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.ctx.run_id.to_string(),
            dry_run: self.ctx.dry_run(),
            results: self.results.clone(),
            warnings: self.warnings.clone(),
            hardening_unverified: self.hardening_unverified,
            report_path: self.report_path.clone(),
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn transition(&mut self, to: RunState) {
        debug!("state {} -> {}", self.state, to);
        let seq = self.next_seq();
        let from = std::mem::replace(&mut self.state, to.clone());
        self.events.push(RunEvent::Transition { seq, from, to });
    }

    fn ensure_running(&self) -> Result<()> {
        match self.latch.signal() {
            Some(signal) => Err(SetupError::Interrupted(signal)),
            None => Ok(()),
        }
    }

    fn succeeded(&self, stage: Stage) -> bool {
        self.results.iter().any(|r| r.stage == stage && r.ok)
    }

    async fn drive(&mut self) -> Result<()> {
        self.ensure_running()?;
        self.init().await?;

        if self.ctx.options.report_only {
            self.transition(RunState::Reporting);
            let result = self.execute(Stage::Report).await;
            if !result.ok {
                return Err(result.to_error());
            }
            self.transition(RunState::Done);
            return Ok(());
        }

        self.transition(RunState::PreValidate);
        let gate = ValidationGate::new(&self.ctx);
        let pre = gate.run(Phase::Pre, &pre_checks(&self.ctx)).await;
        self.warnings.extend(pre.warnings);
        if let Some(fatal) = pre.fatal {
            return Err(SetupError::validation(fatal));
        }

        if !self.ctx.dry_run() {
            self.ctx.registry.persist()?;
        }

        for stage in Stage::INSTALL_ORDER {
            if !stage.applies(&self.ctx) {
                debug!("[{}] not configured, skipping", stage);
                continue;
            }
            self.ensure_running()?;
            self.transition(RunState::Installing { stage });
            let result = self.execute(stage).await;
            self.ensure_running()?;
            if result.ok {
                continue;
            }
            match stage.criticality() {
                Criticality::MustNotFail => return Err(result.to_error()),
                Criticality::Normal => {
                    let message = format!(
                        "{} failed, continuing: {}",
                        stage,
                        result.error.as_deref().unwrap_or("unknown error")
                    );
                    warn!("{}", message);
                    self.warnings.push(message);
                }
            }
        }

        self.ensure_running()?;
        self.transition(RunState::PostValidate);
        let gate = ValidationGate::new(&self.ctx);
        let post = gate.run(Phase::Post, &post_checks(&self.ctx)).await;
        self.warnings.extend(post.warnings);
        if let Some(fatal) = post.fatal {
            error!("Refusing to harden SSH: {}", fatal);
            return Err(SetupError::postcondition(fatal));
        }

        self.transition(RunState::Reporting);
        let report = self.execute(Stage::Report).await;
        self.ensure_running()?;
        if !report.ok {
            let message = format!(
                "report failed, continuing: {}",
                report.error.as_deref().unwrap_or("unknown error")
            );
            warn!("{}", message);
            self.warnings.push(message);
        }

        self.transition(RunState::Hardening);
        if !self.succeeded(Stage::AdminUsers) || !self.succeeded(Stage::Firewall) {
            return Err(SetupError::postcondition(
                "SSH hardening requires admin users and firewall to succeed in the same run",
            ));
        }
        let hardening = self.execute(Stage::SshHardening).await;
        self.ensure_running()?;
        if !hardening.ok {
            return Err(hardening.to_error());
        }
        if hardening.status == StepStatus::AppliedUnverified {
            self.hardening_unverified = true;
            error!("CRITICAL: {}", hardening.output);
            for line in hardening_instructions(&self.ctx) {
                error!("CRITICAL: {}", line);
            }
        }

        if !self.ctx.dry_run() && hardening.status != StepStatus::AlreadyConfigured {
            self.rewrite_report().await;
        }

        self.transition(RunState::Done);
        info!("Run {} finished", self.ctx.run_id);
        Ok(())
    }

    /// Apply requested port allocations against the host's current sockets
    async fn init(&mut self) -> Result<()> {
        for repair in self.ctx.registry.repairs() {
            self.warnings.push(format!(
                "{} port repaired from '{}' to {}: {}",
                repair.service, repair.previous, repair.port, repair.reason
            ));
        }
        if self.port_requests.is_empty() {
            return Ok(());
        }

        let bound = listening_ports(self.ctx.runner()).await;
        let probe = |port: u16| bound.contains(&port);
        for (service, port) in std::mem::take(&mut self.port_requests) {
            let allocation = self
                .ctx
                .registry
                .allocate(service, port, &probe)
                .map_err(|e| SetupError::validation(e.to_string()))?;
            info!("{} -> {}", service, allocation.assignment.port);
            self.warnings.extend(allocation.warnings);
        }
        Ok(())
    }

    async fn execute(&mut self, stage: Stage) -> StepResult {
        self.in_flight = Some(stage);
        if stage.is_mutating() && !self.ctx.dry_run() {
            self.mutated = true;
        }
        let seq = self.next_seq();
        self.events.push(RunEvent::StageStarted { seq, stage });

        let result = StepRunner::new(&self.ctx).execute(stage).await;

        let seq = self.next_seq();
        self.events.push(RunEvent::StageFinished {
            seq,
            stage,
            status: result.status,
        });
        if result.ok {
            self.in_flight = None;
            if stage == Stage::Report && !self.ctx.dry_run() {
                self.report_path = Some(ReportGenerator::new(&self.ctx).path());
            }
        }
        self.results.push(result.clone());
        result
    }

    /// The report written before hardening still shows the old SSH state
    async fn rewrite_report(&mut self) {
        let generator = ReportGenerator::new(&self.ctx);
        let written = match generator.collect().await {
            Ok(report) => generator.write(&report).await,
            Err(e) => Err(e),
        };
        match written {
            Ok(path) => self.report_path = Some(path),
            Err(e) => {
                let message = format!("final report not written: {}", e);
                warn!("{}", message);
                self.warnings.push(message);
            }
        }
    }

    /// Central failure path: capture, write the bundle, clean up
    async fn fail(&mut self, err: SetupError) -> SetupError {
        let stage = self.in_flight;
        error!("Run failed in {}: {}", self.state, err);

        let capture = DiagnosticCapture::new(&self.ctx);
        let bundle = capture.snapshot(&err, stage).await;
        let bundle_path = if self.ctx.dry_run() {
            None
        } else {
            match capture.write(&bundle).await {
                Ok(paths) => Some(paths.error_file),
                Err(e) => {
                    warn!("Could not write diagnostic bundle: {}", e);
                    None
                }
            }
        };

        if self.mutated && !self.ctx.dry_run() {
            let cleanup = Cleanup::new(&self.ctx).run(stage).await;
            for action in &cleanup.actions_taken {
                debug!("cleanup: {}", action);
            }
        }

        for line in &bundle.recovery {
            error!("  {}", line);
        }

        self.transition(RunState::Failed {
            stage,
            bundle: bundle_path,
        });
        err
    }
}
