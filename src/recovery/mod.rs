// file: src/recovery/mod.rs
// version: 2.1.0
// guid: 7cc8b015-4107-4a56-8bfa-eb0a2febe880

//! Operator recovery instructions and the best-effort cleanup run on failure
//!
//! Cleanup never touches the SSH daemon and always leaves every port sshd
//! listens on reachable through the firewall. A drop-in replaced by an
//! unfinished hardening attempt is put back on disk.

use crate::context::OrchestratorContext;
use crate::probe::ssh_listening_ports;
use crate::runner::{check, display_command, run_checked};
use crate::stages::{ssh_hardening, Stage};
use crate::SetupError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, error, info, warn};

/// Concrete commands an operator can run to get back into a host
pub fn recovery_instructions(err: &SetupError, ctx: &OrchestratorContext) -> Vec<String> {
    let port = ctx.ssh_port();
    let mut lines = Vec::new();

    match err {
        SetupError::Validation(_) => {
            lines.push("Nothing was changed on this host.".to_string());
            lines.push("Free disk space with `apt-get clean` and `journalctl --vacuum-size=100M`.".to_string());
            lines.push("Inspect port owners with `ss -tlnp` or pick another port via `container-host-setup ports set`.".to_string());
        }
        SetupError::Postcondition(_) => {
            lines.push("If SSH is unreachable, connect through the provider console.".to_string());
            lines.push("Check the SSH configuration with `sshd -t`.".to_string());
            lines.push("Start the daemon with `systemctl start ssh` (or `systemctl start sshd`).".to_string());
            lines.push("Confirm the listener with `ss -tlnp | grep sshd`.".to_string());
            lines.push(format!("Open the SSH port with `ufw allow {}/tcp`.", port));
        }
        SetupError::Step { stage, .. } => {
            if let Some(command) = err.failing_command() {
                lines.push(format!("Re-run the failing command by hand to see its output: `{}`.", command));
            }
            match stage.as_str() {
                "system-update" => {
                    lines.push("Repair interrupted package operations with `dpkg --configure -a` and `apt-get -f install`.".to_string());
                }
                "container-runtime" => {
                    lines.push(format!(
                        "Inspect the runtime with `journalctl -u {} -n 100 --no-pager`.",
                        ctx.runtime.unit()
                    ));
                }
                "firewall" => {
                    lines.push(format!("Keep SSH reachable with `ufw allow 22/tcp` and `ufw allow {}/tcp`.", port));
                }
                "ssh-hardening" => {
                    lines.push("Connect through the provider console.".to_string());
                    lines.push(format!("Remove `{}` and run `systemctl restart ssh`.", ctx.paths.ssh_dropin.display()));
                }
                _ => {}
            }
        }
        SetupError::Interrupted(_) => {
            lines.push("The run was interrupted; services of the in-flight stage were stopped.".to_string());
        }
        _ => {}
    }

    lines.push(format!(
        "Logs: {} and {}.",
        ctx.paths.log_file.display(),
        ctx.paths.diagnostics_dir.display()
    ));
    lines.push("Re-run `container-host-setup setup`; completed stages are skipped.".to_string());
    lines
}

/// Printed when sshd restarted but its new port could not be confirmed
pub fn hardening_instructions(ctx: &OrchestratorContext) -> Vec<String> {
    let port = ctx.ssh_port();
    vec![
        "Do NOT close this session.".to_string(),
        format!("From another terminal, try `ssh -p {} {}@<host>`.", port, ctx.admin.username),
        "Check the daemon with `systemctl status ssh` and `sshd -t`.".to_string(),
        format!("Confirm the listener with `ss -tlnp | grep {}`.", port),
        format!(
            "To revert, remove {} and run `systemctl restart ssh`.",
            ctx.paths.ssh_dropin.display()
        ),
    ]
}

/// Record of what cleanup did
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupReport {
    pub stage: Option<Stage>,
    pub actions_taken: Vec<String>,
    pub errors: Vec<String>,
}

/// Best-effort rollback of services started by the in-flight stage
pub struct Cleanup<'a> {
    ctx: &'a OrchestratorContext,
}

impl<'a> Cleanup<'a> {
    pub fn new(ctx: &'a OrchestratorContext) -> Self {
        Self { ctx }
    }

    /// Never fails; individual errors are collected in the report
    pub async fn run(&self, stage: Option<Stage>) -> CleanupReport {
        let mut report = CleanupReport {
            stage,
            ..CleanupReport::default()
        };
        info!("Running cleanup after failure in {}", stage.map(Stage::name).unwrap_or("setup"));

        if let Some(stage) = stage {
            for unit in stage.units(self.ctx) {
                self.attempt(&mut report, &["systemctl", "stop", unit]).await;
            }
        }

        if stage == Some(Stage::SshHardening) {
            match ssh_hardening::rollback_dropin(self.ctx).await {
                Ok(true) => report.actions_taken.push("restored SSH drop-in".to_string()),
                Ok(false) => debug!("no SSH drop-in backup to restore"),
                Err(e) => {
                    error!("Restoring the SSH drop-in failed: {}", e);
                    report.errors.push(e.to_string());
                }
            }
        }

        if check(self.ctx.runner(), &["which", "ufw"]).await {
            self.reset_firewall(&mut report).await;
        } else {
            debug!("ufw not installed, leaving firewall untouched");
        }

        if report.errors.is_empty() {
            info!("Cleanup finished: {} action(s)", report.actions_taken.len());
        } else {
            warn!("Cleanup finished with {} error(s)", report.errors.len());
        }
        report
    }

    /// Reset ufw to deny-incoming with every SSH port open
    async fn reset_firewall(&self, report: &mut CleanupReport) {
        let mut ports: BTreeSet<u16> = ssh_listening_ports(self.ctx.runner()).await;
        ports.insert(22);
        ports.insert(self.ctx.ssh_port());

        self.attempt(report, &["ufw", "--force", "reset"]).await;
        self.attempt(report, &["ufw", "default", "deny", "incoming"]).await;
        self.attempt(report, &["ufw", "default", "allow", "outgoing"]).await;
        for port in ports {
            let rule = format!("{}/tcp", port);
            self.attempt(report, &["ufw", "allow", &rule]).await;
        }
        self.attempt(report, &["ufw", "--force", "enable"]).await;
    }

    async fn attempt(&self, report: &mut CleanupReport, argv: &[&str]) {
        let line = display_command(argv);
        match run_checked(self.ctx.runner(), argv).await {
            Ok(_) => report.actions_taken.push(line),
            Err(e) => {
                error!("Cleanup step failed: {}", e);
                report.errors.push(e.to_string());
            }
        }
    }
}
