// file: src/stages/mod.rs
// version: 1.1.0
// guid: 96ab56c7-63f9-4502-bfd0-708f5f8225f7

//! Provisioning stage catalogue
//!
//! Every stage exposes a read-only idempotence check, an action and a
//! dry-run preview. The set is closed; dispatch is an exhaustive match.

pub mod admin_users;
pub mod container_runtime;
pub mod firewall;
pub mod intrusion;
pub mod report;
pub mod reverse_proxy;
pub mod ssh_hardening;
pub mod system_update;

use crate::context::OrchestratorContext;
use crate::runner::{run_checked, CommandRunner};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// How the orchestrator treats a stage failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Criticality {
    /// Warn and continue
    Normal,
    /// Abort the run and clean up
    MustNotFail,
}

impl fmt::Display for Criticality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Criticality::Normal => f.write_str("normal"),
            Criticality::MustNotFail => f.write_str("must-not-fail"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    SystemUpdate,
    ContainerRuntime,
    IntrusionPrevention,
    ReverseProxy,
    AdminUsers,
    Firewall,
    Report,
    SshHardening,
}

impl Stage {
    /// Install stages in execution order
    pub const INSTALL_ORDER: [Stage; 6] = [
        Stage::SystemUpdate,
        Stage::ContainerRuntime,
        Stage::IntrusionPrevention,
        Stage::ReverseProxy,
        Stage::AdminUsers,
        Stage::Firewall,
    ];

    pub const ALL: [Stage; 8] = [
        Stage::SystemUpdate,
        Stage::ContainerRuntime,
        Stage::IntrusionPrevention,
        Stage::ReverseProxy,
        Stage::AdminUsers,
        Stage::Firewall,
        Stage::Report,
        Stage::SshHardening,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::SystemUpdate => "system-update",
            Stage::ContainerRuntime => "container-runtime",
            Stage::IntrusionPrevention => "intrusion-prevention",
            Stage::ReverseProxy => "reverse-proxy",
            Stage::AdminUsers => "admin-users",
            Stage::Firewall => "firewall",
            Stage::Report => "report",
            Stage::SshHardening => "ssh-hardening",
        }
    }

    pub fn criticality(self) -> Criticality {
        match self {
            Stage::SystemUpdate
            | Stage::ContainerRuntime
            | Stage::AdminUsers
            | Stage::Firewall
            | Stage::SshHardening => Criticality::MustNotFail,
            Stage::IntrusionPrevention | Stage::ReverseProxy | Stage::Report => Criticality::Normal,
        }
    }

    /// Whether the stage changes system configuration (the report only
    /// writes its own file)
    pub fn is_mutating(self) -> bool {
        !matches!(self, Stage::Report)
    }

    /// Whether the stage takes part in this run at all
    pub fn applies(self, ctx: &OrchestratorContext) -> bool {
        match self {
            Stage::ReverseProxy => ctx.proxy.is_some(),
            _ => true,
        }
    }

    /// Units started by this stage, stopped again during cleanup
    pub fn units(self, ctx: &OrchestratorContext) -> Vec<&'static str> {
        match self {
            Stage::ContainerRuntime => vec![ctx.runtime.unit()],
            Stage::IntrusionPrevention => vec![ctx.intrusion.unit()],
            Stage::ReverseProxy => vec!["nginx"],
            Stage::SystemUpdate
            | Stage::AdminUsers
            | Stage::Firewall
            | Stage::Report
            | Stage::SshHardening => Vec::new(),
        }
    }

    /// Read-only check: true when the host already matches intent
    pub async fn is_satisfied(self, ctx: &OrchestratorContext) -> Result<bool> {
        match self {
            Stage::SystemUpdate => system_update::is_satisfied(ctx).await,
            Stage::ContainerRuntime => container_runtime::is_satisfied(ctx).await,
            Stage::IntrusionPrevention => intrusion::is_satisfied(ctx).await,
            Stage::ReverseProxy => reverse_proxy::is_satisfied(ctx).await,
            Stage::AdminUsers => admin_users::is_satisfied(ctx).await,
            Stage::Firewall => firewall::is_satisfied(ctx).await,
            Stage::Report => report::is_satisfied(ctx).await,
            Stage::SshHardening => ssh_hardening::is_satisfied(ctx).await,
        }
    }

    pub async fn apply(self, ctx: &OrchestratorContext) -> Result<StageOutput> {
        match self {
            Stage::SystemUpdate => system_update::apply(ctx).await,
            Stage::ContainerRuntime => container_runtime::apply(ctx).await,
            Stage::IntrusionPrevention => intrusion::apply(ctx).await,
            Stage::ReverseProxy => reverse_proxy::apply(ctx).await,
            Stage::AdminUsers => admin_users::apply(ctx).await,
            Stage::Firewall => firewall::apply(ctx).await,
            Stage::Report => report::apply(ctx).await,
            Stage::SshHardening => ssh_hardening::apply(ctx).await,
        }
    }

    /// Dry-run description; may read host state to name the
    /// units and rules the action would touch
    pub async fn preview(self, ctx: &OrchestratorContext) -> StagePreview {
        match self {
            Stage::SystemUpdate => system_update::preview(ctx),
            Stage::ContainerRuntime => container_runtime::preview(ctx),
            Stage::IntrusionPrevention => intrusion::preview(ctx),
            Stage::ReverseProxy => reverse_proxy::preview(ctx),
            Stage::AdminUsers => admin_users::preview(ctx),
            Stage::Firewall => firewall::preview(ctx).await,
            Stage::Report => report::preview(ctx),
            Stage::SshHardening => ssh_hardening::preview(ctx).await,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What an applied stage produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutput {
    pub summary: String,
    /// False when the action ran but its effect could not be confirmed
    pub verified: bool,
}

impl StageOutput {
    pub fn verified(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            verified: true,
        }
    }

    pub fn unverified(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            verified: false,
        }
    }
}

/// Dry-run description of a stage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePreview {
    pub files: Vec<PathBuf>,
    pub services: Vec<String>,
    pub commands: Vec<String>,
}

impl StagePreview {
    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.files.push(path.into());
        self
    }

    pub fn service(mut self, unit: impl Into<String>) -> Self {
        self.services.push(unit.into());
        self
    }

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.commands.push(command.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.services.is_empty() && self.commands.is_empty()
    }
}

impl fmt::Display for StagePreview {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for path in &self.files {
            writeln!(f, "  would write   {}", path.display())?;
        }
        for unit in &self.services {
            writeln!(f, "  would restart {}", unit)?;
        }
        for command in &self.commands {
            writeln!(f, "  would run     {}", command)?;
        }
        Ok(())
    }
}

/// `apt-get install -y` for the packages not yet installed
pub(crate) async fn install_missing(runner: &dyn CommandRunner, packages: &[&str]) -> Result<Vec<String>> {
    let mut missing = Vec::new();
    for pkg in packages {
        if !crate::probe::package_installed(runner, pkg).await {
            missing.push(*pkg);
        }
    }
    if !missing.is_empty() {
        let mut argv = vec!["apt-get", "install", "-y"];
        argv.extend(missing.iter().copied());
        run_checked(runner, &argv).await?;
    }
    Ok(missing.into_iter().map(str::to_string).collect())
}

pub(crate) async fn packages_installed(runner: &dyn CommandRunner, packages: &[&str]) -> bool {
    for pkg in packages {
        if !crate::probe::package_installed(runner, pkg).await {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_order_excludes_terminal_stages() {
        assert!(!Stage::INSTALL_ORDER.contains(&Stage::Report));
        assert!(!Stage::INSTALL_ORDER.contains(&Stage::SshHardening));
        assert_eq!(Stage::ALL.last(), Some(&Stage::SshHardening));
    }

    #[test]
    fn test_criticality_table() {
        let must: Vec<Stage> = Stage::ALL
            .into_iter()
            .filter(|s| s.criticality() == Criticality::MustNotFail)
            .collect();
        assert_eq!(
            must,
            vec![
                Stage::SystemUpdate,
                Stage::ContainerRuntime,
                Stage::AdminUsers,
                Stage::Firewall,
                Stage::SshHardening
            ]
        );
        assert_eq!(Criticality::MustNotFail.to_string(), "must-not-fail");
    }

    #[test]
    fn test_preview_display() {
        let preview = StagePreview::default()
            .file("/etc/x.conf")
            .service("k3s")
            .command("apt-get update");
        let text = preview.to_string();
        assert!(text.contains("would write   /etc/x.conf"));
        assert!(text.contains("would restart k3s"));
        assert!(text.contains("would run     apt-get update"));
    }
}
