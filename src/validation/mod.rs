// file: src/validation/mod.rs
// version: 1.1.0
// guid: 436b13a4-14ed-4323-9e31-3456e0f3c4c7

//! Pre- and post-install health gates
//!
//! Every check is read-only. The pre gate decides whether mutation may begin;
//! the post gate decides whether SSH hardening may run.

use crate::config::{parse_key_lines, AdminIdentity, ContainerRuntime};
use crate::context::OrchestratorContext;
use crate::ports::Service;
use crate::probe::{
    active_ssh_unit, disk_available, firewall_status, memory_total, port_owners,
    ssh_listening_ports, unit_active, user_exists, user_groups, SSH_UNITS,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, error, info, warn};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Pre,
    Post,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Pre => f.write_str("pre-install"),
            Phase::Post => f.write_str("post-install"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warn,
    Fatal,
}

/// What a check looks at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Check {
    DiskSpace { path: String, min_bytes: u64 },
    Memory { min_bytes: u64 },
    /// Free, or already held by the service's own daemon
    PortAvailable { service: Service, port: u16 },
    /// Active under any of the distribution's unit names
    SshActive,
    SshListening,
    ServiceActive { unit: String },
    AdminAccess { username: String },
    FirewallAllows { port: u16 },
    /// Every port sshd listens on right now is reachable
    SshPortsReachable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationCheck {
    pub phase: Phase,
    pub check: Check,
    pub failure_message: String,
    pub severity: Severity,
}

impl ValidationCheck {
    pub fn new(phase: Phase, check: Check, severity: Severity, failure_message: impl Into<String>) -> Self {
        Self {
            phase,
            check,
            failure_message: failure_message.into(),
            severity,
        }
    }

    /// SSH checks guard against lockout and can never be downgraded
    pub fn is_ssh_check(&self) -> bool {
        matches!(self.check, Check::SshActive | Check::SshListening)
    }
}

/// Outcome of one gate
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub passed: bool,
    pub warnings: Vec<String>,
    /// First fatal failure, in check order
    pub fatal: Option<String>,
}

/// Checks run before any stage
pub fn pre_checks(ctx: &OrchestratorContext) -> Vec<ValidationCheck> {
    let t = ctx.thresholds;
    let mut checks = vec![
        ValidationCheck::new(
            Phase::Pre,
            Check::DiskSpace {
                path: "/".to_string(),
                min_bytes: t.min_disk_bytes,
            },
            Severity::Fatal,
            format!("at least {:.1} GiB free disk space is required on /", t.min_disk_bytes as f64 / GIB),
        ),
        ValidationCheck::new(
            Phase::Pre,
            Check::Memory {
                min_bytes: t.min_memory_bytes,
            },
            Severity::Fatal,
            format!("at least {:.1} GiB of memory is required", t.min_memory_bytes as f64 / GIB),
        ),
    ];
    for assignment in ctx.registry.assignments() {
        if assignment.service == Service::KubeApi && ctx.runtime != ContainerRuntime::K3s {
            continue;
        }
        checks.push(ValidationCheck::new(
            Phase::Pre,
            Check::PortAvailable {
                service: assignment.service,
                port: assignment.port,
            },
            Severity::Fatal,
            format!(
                "port {} ({}) is held by another process",
                assignment.port, assignment.service
            ),
        ));
    }
    checks
}

/// Checks run after the install stages, before hardening
pub fn post_checks(ctx: &OrchestratorContext) -> Vec<ValidationCheck> {
    let downgraded = if ctx.dry_run() {
        Severity::Warn
    } else {
        Severity::Fatal
    };
    let mut checks = vec![
        ValidationCheck::new(
            Phase::Post,
            Check::SshActive,
            Severity::Fatal,
            format!("SSH daemon is not active under any of {}", SSH_UNITS.join("/")),
        ),
        ValidationCheck::new(
            Phase::Post,
            Check::SshListening,
            Severity::Fatal,
            "sshd is not listening on any port",
        ),
    ];

    // Units of optional stages only warn; their stage failure already did
    let mut units = vec![
        (ctx.runtime.unit(), downgraded),
        (ctx.intrusion.unit(), Severity::Warn),
    ];
    if ctx.proxy.is_some() {
        units.push(("nginx", Severity::Warn));
    }
    for (unit, severity) in units {
        checks.push(ValidationCheck::new(
            Phase::Post,
            Check::ServiceActive {
                unit: unit.to_string(),
            },
            severity,
            format!("{} is not active", unit),
        ));
    }
    for identity in ctx.identities() {
        checks.push(ValidationCheck::new(
            Phase::Post,
            Check::AdminAccess {
                username: identity.username.clone(),
            },
            downgraded,
            format!(
                "{} is missing, not in sudo, or has no authorized keys",
                identity.username
            ),
        ));
    }
    checks.push(ValidationCheck::new(
        Phase::Post,
        Check::FirewallAllows { port: ctx.ssh_port() },
        downgraded,
        format!("firewall does not allow SSH port {}", ctx.ssh_port()),
    ));
    checks.push(ValidationCheck::new(
        Phase::Post,
        Check::SshPortsReachable,
        downgraded,
        "firewall blocks a port sshd is listening on",
    ));
    checks
}

/// Runs validation checks against the context's host
pub struct ValidationGate<'a> {
    ctx: &'a OrchestratorContext,
}

impl<'a> ValidationGate<'a> {
    pub fn new(ctx: &'a OrchestratorContext) -> Self {
        Self { ctx }
    }

    /// Run every check of `phase`; checks of other phases are ignored
    pub async fn run(&self, phase: Phase, checks: &[ValidationCheck]) -> GateResult {
        info!("Running {} validation", phase);
        let mut result = GateResult::default();

        for check in checks.iter().filter(|c| c.phase == phase) {
            if self.evaluate(&check.check).await {
                debug!("check passed: {:?}", check.check);
                continue;
            }
            match check.severity {
                Severity::Warn => {
                    warn!("{}", check.failure_message);
                    result.warnings.push(check.failure_message.clone());
                }
                Severity::Fatal => {
                    error!("{}", check.failure_message);
                    if result.fatal.is_none() {
                        result.fatal = Some(check.failure_message.clone());
                    }
                }
            }
        }

        result.passed = result.fatal.is_none();
        result
    }

    async fn evaluate(&self, check: &Check) -> bool {
        let runner = self.ctx.runner();
        match check {
            Check::DiskSpace { path, min_bytes } => match disk_available(runner, path).await {
                Some(available) => available >= *min_bytes,
                None => {
                    warn!("Could not determine free space on {}", path);
                    false
                }
            },
            Check::Memory { min_bytes } => match memory_total(runner).await {
                Some(total) => total >= *min_bytes,
                None => {
                    warn!("Could not determine total memory");
                    false
                }
            },
            Check::PortAvailable { service, port } => match port_owners(runner).await.get(port) {
                None => true,
                Some(owner) => {
                    let own = service.daemon_names().contains(&owner.as_str());
                    if own {
                        debug!("port {} already held by {} ({})", port, owner, service);
                    }
                    own
                }
            },
            Check::SshActive => active_ssh_unit(runner).await.is_some(),
            Check::SshListening => !ssh_listening_ports(runner).await.is_empty(),
            Check::ServiceActive { unit } => unit_active(runner, unit).await,
            Check::AdminAccess { username } => {
                if !user_exists(runner, username).await {
                    return false;
                }
                if !user_groups(runner, username).await.iter().any(|g| g == "sudo") {
                    return false;
                }
                let keys_path = AdminIdentity::new(username.clone(), Vec::new()).authorized_keys_path();
                match runner.read_file(&keys_path).await {
                    Ok(Some(contents)) => !parse_key_lines(&contents).is_empty(),
                    _ => false,
                }
            }
            Check::FirewallAllows { port } => {
                let status = firewall_status(runner).await;
                status.active && status.allows_port(*port)
            }
            Check::SshPortsReachable => {
                let status = firewall_status(runner).await;
                if !status.active {
                    return true;
                }
                let blocked: Vec<u16> = ssh_listening_ports(runner)
                    .await
                    .into_iter()
                    .filter(|port| !status.allows_port(*port))
                    .collect();
                if !blocked.is_empty() {
                    error!("sshd listens on {:?} but ufw does not allow it", blocked);
                }
                blocked.is_empty()
            }
        }
    }
}
