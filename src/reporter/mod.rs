// file: src/reporter/mod.rs
// version: 2.1.0
// guid: 2e2ba742-efea-4695-a38e-48b5342fd666

//! Setup report: observed host state rendered as text tables or JSON
//!
//! Collection is read-only. Rendering is pure and deterministic, so the
//! report on disk only changes when the host does; the generation time lives
//! in a header line of the text report that is ignored when comparing. JSON
//! runs write `setup-report.json` in place of the text file.

use crate::config::ContainerRuntime;
use crate::context::OrchestratorContext;
use crate::ports::PortAssignment;
use crate::probe;
use crate::runner::run_checked;
use crate::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::path::PathBuf;
use tracing::{debug, info};

const HEADER_PREFIX: &str = "# Generated ";

/// Everything the report shows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupReport {
    /// Host name as reported by the system
    pub hostname: String,

    /// Assigned service ports
    pub ports: Vec<PortAssignment>,

    /// SHA-256 of the persisted ports file
    pub ports_fingerprint: Option<String>,

    /// Status of managed systemd units
    pub services: Vec<ServiceStatus>,

    /// Members of the sudo group
    pub sudo_members: Vec<String>,

    /// SSH daemon policy and sockets
    pub ssh: SshPolicy,

    /// Firewall state
    pub firewall: FirewallSummary,

    /// Commands the operator should run once access is confirmed
    pub follow_ups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub unit: String,
    pub active: bool,
}

/// SSH policy as found in the managed drop-in
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshPolicy {
    /// Whether the managed drop-in exists
    pub applied: bool,

    /// `Port` directive
    pub port: Option<u16>,

    /// `PermitRootLogin` directive
    pub permit_root_login: Option<String>,

    /// `PasswordAuthentication` directive
    pub password_authentication: Option<String>,

    /// `PubkeyAuthentication` directive
    pub pubkey_authentication: Option<String>,

    /// Ports sshd currently listens on
    pub listening: Vec<u16>,
}

impl SshPolicy {
    /// Parse sshd `Keyword value` lines
    pub fn parse(contents: &str) -> Self {
        let mut policy = SshPolicy {
            applied: true,
            ..SshPolicy::default()
        };
        for line in contents.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once(char::is_whitespace) else {
                continue;
            };
            let value = value.trim().to_string();
            match key.to_ascii_lowercase().as_str() {
                "port" => policy.port = value.parse().ok(),
                "permitrootlogin" => policy.permit_root_login = Some(value),
                "passwordauthentication" => policy.password_authentication = Some(value),
                "pubkeyauthentication" => policy.pubkey_authentication = Some(value),
                _ => {}
            }
        }
        policy
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallSummary {
    pub active: bool,
    pub rules: Vec<String>,
}

/// Collects and writes the setup report
pub struct ReportGenerator<'a> {
    ctx: &'a OrchestratorContext,
}

impl<'a> ReportGenerator<'a> {
    pub fn new(ctx: &'a OrchestratorContext) -> Self {
        Self { ctx }
    }

    pub fn path(&self) -> PathBuf {
        if self.ctx.options.json {
            self.ctx.paths.report_json_file()
        } else {
            self.ctx.paths.report_file()
        }
    }

    /// File body without the generation header
    fn render(&self, report: &SetupReport) -> Result<String> {
        if self.ctx.options.json {
            Ok(format!("{}\n", render_json(report)?))
        } else {
            Ok(render_text(report))
        }
    }

    fn managed_units(&self) -> Vec<&'static str> {
        let mut units = vec!["ssh", self.ctx.runtime.unit(), self.ctx.intrusion.unit()];
        if self.ctx.proxy.is_some() {
            units.push("nginx");
        }
        units
    }

    /// Observe the host; never mutates anything
    pub async fn collect(&self) -> Result<SetupReport> {
        let runner = self.ctx.runner();

        let mut services = Vec::new();
        for unit in self.managed_units() {
            let active = if unit == "ssh" {
                probe::active_ssh_unit(runner).await.is_some()
            } else {
                probe::unit_active(runner, unit).await
            };
            services.push(ServiceStatus {
                unit: unit.to_string(),
                active,
            });
        }

        let mut ssh = match runner.read_file(&self.ctx.paths.ssh_dropin).await? {
            Some(contents) => SshPolicy::parse(&contents),
            None => SshPolicy::default(),
        };
        ssh.listening = probe::ssh_listening_ports(runner).await.into_iter().collect();

        let status = probe::firewall_status(runner).await;
        let firewall = FirewallSummary {
            active: status.active,
            rules: status.rules,
        };

        let ports_fingerprint = match std::fs::read(&self.ctx.paths.ports_file) {
            Ok(bytes) => Some(hex::encode(Sha256::digest(&bytes))),
            Err(e) => {
                debug!("No ports file fingerprint: {}", e);
                None
            }
        };

        let mut report = SetupReport {
            hostname: probe::hostname(runner).await,
            ports: self.ctx.registry.assignments().cloned().collect(),
            ports_fingerprint,
            services,
            sudo_members: probe::group_members(runner, "sudo").await,
            ssh,
            firewall,
            follow_ups: Vec::new(),
        };
        report.follow_ups = follow_ups(&report, self.ctx);
        Ok(report)
    }

    /// Write the report (dir 0700, file 0600); returns its path
    pub async fn write(&self, report: &SetupReport) -> Result<PathBuf> {
        let runner = self.ctx.runner();
        let dir = self.ctx.paths.report_dir.to_string_lossy().to_string();
        run_checked(runner, &["install", "-d", "-m", "700", &dir]).await?;

        let body = self.render(report)?;
        let contents = if self.ctx.options.json {
            body
        } else {
            format!(
                "{}{} by container-host-setup {}\n{}",
                HEADER_PREFIX,
                chrono::Utc::now().to_rfc3339(),
                crate::VERSION,
                body
            )
        };
        let path = self.path();
        runner.write_file(&path, &contents, 0o600).await?;
        info!("Report written to {}", path.display());
        Ok(path)
    }

    /// Whether the report on disk already shows the current state
    pub async fn is_current(&self) -> Result<bool> {
        let Some(existing) = self.ctx.runner().read_file(&self.path()).await? else {
            return Ok(false);
        };
        let report = self.collect().await?;
        Ok(strip_header(&existing) == self.render(&report)?)
    }
}

fn strip_header(contents: &str) -> &str {
    match contents.split_once('\n') {
        Some((first, rest)) if first.starts_with(HEADER_PREFIX) => rest,
        _ => contents,
    }
}

fn follow_ups(report: &SetupReport, ctx: &OrchestratorContext) -> Vec<String> {
    let mut steps = Vec::new();
    let hardened_port = report.ssh.port.filter(|_| report.ssh.applied);
    if let Some(port) = hardened_port.filter(|p| *p != 22) {
        if report.firewall.rules.iter().any(|r| r == "22/tcp") {
            steps.push(format!(
                "confirm `ssh -p {} {}@{}` works, then run: ufw delete allow 22/tcp",
                port, ctx.admin.username, report.hostname
            ));
        }
    }
    if ctx.runtime == ContainerRuntime::K3s {
        steps.push("copy /etc/rancher/k3s/k3s.yaml to your workstation for kubectl access".to_string());
    }
    steps
}

fn on_off(value: bool, yes: &str, no: &str) -> String {
    let word = if value { yes } else { no };
    word.to_string()
}

/// Plain-text report body
pub fn render_text(report: &SetupReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Container host setup report");
    let _ = writeln!(out, "===========================");
    let _ = writeln!(out, "Host: {}", report.hostname);
    let _ = writeln!(out);

    let _ = writeln!(out, "Port assignments");
    let _ = writeln!(out, "  {:<10} {:<6} {}", "SERVICE", "PORT", "DESCRIPTION");
    for assignment in &report.ports {
        let _ = writeln!(
            out,
            "  {:<10} {:<6} {}",
            assignment.service.name(),
            assignment.port,
            assignment.description
        );
    }
    if let Some(fingerprint) = &report.ports_fingerprint {
        let _ = writeln!(out, "  ports file sha256: {}", fingerprint);
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "Services");
    let _ = writeln!(out, "  {:<10} {}", "UNIT", "STATUS");
    for service in &report.services {
        let _ = writeln!(
            out,
            "  {:<10} {}",
            service.unit,
            on_off(service.active, "active", "inactive")
        );
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "Access");
    let members = if report.sudo_members.is_empty() {
        "(none)".to_string()
    } else {
        report.sudo_members.join(", ")
    };
    let _ = writeln!(out, "  sudo members:   {}", members);
    let listening: Vec<String> = report.ssh.listening.iter().map(u16::to_string).collect();
    let _ = writeln!(
        out,
        "  ssh listening:  {}",
        if listening.is_empty() {
            "(none)".to_string()
        } else {
            listening.join(", ")
        }
    );
    let _ = writeln!(out);

    let _ = writeln!(out, "SSH policy");
    if report.ssh.applied {
        let show = |v: &Option<String>| v.clone().unwrap_or_else(|| "(unset)".to_string());
        let port = report
            .ssh
            .port
            .map(|p| p.to_string())
            .unwrap_or_else(|| "(unset)".to_string());
        let _ = writeln!(out, "  {:<24} {}", "Port", port);
        let _ = writeln!(out, "  {:<24} {}", "PermitRootLogin", show(&report.ssh.permit_root_login));
        let _ = writeln!(
            out,
            "  {:<24} {}",
            "PasswordAuthentication",
            show(&report.ssh.password_authentication)
        );
        let _ = writeln!(
            out,
            "  {:<24} {}",
            "PubkeyAuthentication",
            show(&report.ssh.pubkey_authentication)
        );
    } else {
        let _ = writeln!(out, "  hardening pending");
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "Firewall");
    let _ = writeln!(out, "  status:  {}", on_off(report.firewall.active, "active", "inactive"));
    let _ = writeln!(out, "  allowed: {}", report.firewall.rules.join(", "));

    if !report.follow_ups.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Follow-up");
        for step in &report.follow_ups {
            let _ = writeln!(out, "  - {}", step);
        }
    }
    out
}

pub fn render_json(report: &SetupReport) -> Result<String> {
    Ok(serde_json::to_string_pretty(report)?)
}
