// file: src/probe.rs
// version: 1.0.0
// guid: 50fa69ca-bee9-4b7b-8a55-9b3018c4ae71

//! Read-only observations of host state
//!
//! Shared by the stage idempotence checks, the validation gate and the
//! report. Nothing here mutates the host.

use crate::runner::{check, output_or_empty, CommandRunner};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::debug;

/// Units that may run the OpenSSH daemon, in probe order
pub const SSH_UNITS: [&str; 2] = ["ssh", "sshd"];

pub async fn package_installed(runner: &dyn CommandRunner, package: &str) -> bool {
    match runner.run(&["dpkg-query", "-W", "-f=${Status}", package]).await {
        Ok(out) => out.success() && out.stdout.contains("install ok installed"),
        Err(_) => false,
    }
}

pub async fn unit_active(runner: &dyn CommandRunner, unit: &str) -> bool {
    check(runner, &["systemctl", "is-active", "--quiet", unit]).await
}

pub async fn path_exists(runner: &dyn CommandRunner, path: &Path) -> bool {
    let path = path.to_string_lossy();
    check(runner, &["test", "-e", path.as_ref()]).await
}

/// The SSH unit currently running, if any
pub async fn active_ssh_unit(runner: &dyn CommandRunner) -> Option<&'static str> {
    for unit in SSH_UNITS {
        if unit_active(runner, unit).await {
            return Some(unit);
        }
    }
    None
}

/// Ports with a TCP listener
pub async fn listening_ports(runner: &dyn CommandRunner) -> BTreeSet<u16> {
    parse_listening_ports(&output_or_empty(runner, &["ss", "-Htln"]).await)
}

/// Listening port -> owning process name
pub async fn port_owners(runner: &dyn CommandRunner) -> BTreeMap<u16, String> {
    parse_port_owners(&output_or_empty(runner, &["ss", "-Htlnp"]).await)
}

/// Ports the SSH daemon currently listens on
pub async fn ssh_listening_ports(runner: &dyn CommandRunner) -> BTreeSet<u16> {
    port_owners(runner)
        .await
        .into_iter()
        .filter(|(_, process)| process == "sshd")
        .map(|(port, _)| port)
        .collect()
}

pub async fn user_exists(runner: &dyn CommandRunner, user: &str) -> bool {
    check(runner, &["id", "-u", user]).await
}

pub async fn user_groups(runner: &dyn CommandRunner, user: &str) -> Vec<String> {
    output_or_empty(runner, &["id", "-nG", user])
        .await
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Members listed in the group database entry
pub async fn group_members(runner: &dyn CommandRunner, group: &str) -> Vec<String> {
    parse_group_members(&output_or_empty(runner, &["getent", "group", group]).await)
}

pub async fn disk_available(runner: &dyn CommandRunner, path: &str) -> Option<u64> {
    parse_df_avail(&output_or_empty(runner, &["df", "-B1", "--output=avail", path]).await)
}

pub async fn memory_total(runner: &dyn CommandRunner) -> Option<u64> {
    parse_free_total(&output_or_empty(runner, &["free", "-b"]).await)
}

pub async fn firewall_status(runner: &dyn CommandRunner) -> FirewallStatus {
    FirewallStatus::parse(&output_or_empty(runner, &["ufw", "status"]).await)
}

pub async fn hostname(runner: &dyn CommandRunner) -> String {
    let name = output_or_empty(runner, &["hostname"]).await;
    let name = name.trim();
    if name.is_empty() {
        "unknown".to_string()
    } else {
        name.to_string()
    }
}

/// Parsed `ufw status`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirewallStatus {
    pub active: bool,
    /// Targets of ALLOW rules, e.g. `2222/tcp`
    pub rules: Vec<String>,
}

impl FirewallStatus {
    pub fn parse(output: &str) -> Self {
        let active = output
            .lines()
            .any(|l| l.trim().eq_ignore_ascii_case("status: active"));
        let mut rules: Vec<String> = Vec::new();
        for line in output.lines() {
            let mut fields = line.split_whitespace();
            let Some(target) = fields.next() else { continue };
            if line.contains("ALLOW") && !rules.iter().any(|r| r == target) {
                rules.push(target.to_string());
            }
        }
        Self { active, rules }
    }

    pub fn allows(&self, rule: &str) -> bool {
        self.rules.iter().any(|r| r == rule)
    }

    pub fn allows_port(&self, port: u16) -> bool {
        self.allows(&format!("{}/tcp", port)) || self.allows(&port.to_string())
    }
}

fn local_port(field: &str) -> Option<u16> {
    field.rsplit_once(':').and_then(|(_, port)| port.parse().ok())
}

pub fn parse_listening_ports(output: &str) -> BTreeSet<u16> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(3))
        .filter_map(local_port)
        .collect()
}

pub fn parse_port_owners(output: &str) -> BTreeMap<u16, String> {
    let Ok(re) = Regex::new(r#"users:\(\("([^"]+)""#) else {
        return BTreeMap::new();
    };
    let mut owners = BTreeMap::new();
    for line in output.lines() {
        let Some(port) = line.split_whitespace().nth(3).and_then(local_port) else {
            continue;
        };
        let process = re
            .captures(line)
            .map(|c| c[1].to_string())
            .unwrap_or_else(|| "unknown".to_string());
        owners.entry(port).or_insert(process);
    }
    debug!("Observed {} listening sockets", owners.len());
    owners
}

pub fn parse_group_members(output: &str) -> Vec<String> {
    output
        .trim()
        .rsplit(':')
        .next()
        .filter(|_| output.contains(':'))
        .map(|members| {
            members
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub fn parse_df_avail(output: &str) -> Option<u64> {
    output
        .lines()
        .filter_map(|l| l.trim().parse::<u64>().ok())
        .next()
}

pub fn parse_free_total(output: &str) -> Option<u64> {
    output
        .lines()
        .find(|l| l.starts_with("Mem:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::FakeHost;

    #[test]
    fn test_parse_real_ss_output() {
        let output = "LISTEN 0      128          0.0.0.0:22         0.0.0.0:*    users:((\"sshd\",pid=812,fd=3))\n\
                      LISTEN 0      4096            [::]:6443           [::]:*    users:((\"k3s-server\",pid=990,fd=12))\n";
        assert_eq!(parse_listening_ports(output), BTreeSet::from([22, 6443]));
        let owners = parse_port_owners(output);
        assert_eq!(owners.get(&22).map(String::as_str), Some("sshd"));
        assert_eq!(owners.get(&6443).map(String::as_str), Some("k3s-server"));
    }

    #[test]
    fn test_parse_ufw_status() {
        let output = "Status: active\n\nTo                         Action      From\n--                         ------      ----\n\
                      22/tcp                     ALLOW       Anywhere\n\
                      2222/tcp                   ALLOW       Anywhere\n\
                      2222/tcp (v6)              ALLOW       Anywhere (v6)\n";
        let status = FirewallStatus::parse(output);
        assert!(status.active);
        assert_eq!(status.rules, vec!["22/tcp", "2222/tcp"]);
        assert!(status.allows_port(2222));
        assert!(!status.allows_port(80));
        assert!(!FirewallStatus::parse("Status: inactive\n").active);
    }

    #[test]
    fn test_parse_group_members() {
        assert_eq!(parse_group_members("sudo:x:27:ops,rescue\n"), vec!["ops", "rescue"]);
        assert!(parse_group_members("sudo:x:27:\n").is_empty());
        assert!(parse_group_members("").is_empty());
    }

    #[test]
    fn test_parse_resources() {
        assert_eq!(parse_df_avail("     Avail\n53687091200\n"), Some(53_687_091_200));
        assert_eq!(
            parse_free_total("  total used\nMem:   4294967296  1  2\nSwap: 0 0 0\n"),
            Some(4_294_967_296)
        );
        assert_eq!(parse_df_avail("garbage"), None);
    }

    #[tokio::test]
    async fn test_probes_against_fake_host() {
        let host = FakeHost::fresh_ubuntu();
        assert!(package_installed(&host, "openssh-server").await);
        assert!(!package_installed(&host, "ufw").await);
        assert_eq!(active_ssh_unit(&host).await, Some("ssh"));
        assert_eq!(ssh_listening_ports(&host).await, BTreeSet::from([22]));
        assert_eq!(memory_total(&host).await, Some(4 * 1024 * 1024 * 1024));
        assert!(path_exists(&host, Path::new("/etc/ssh/sshd_config")).await);
        assert_eq!(hostname(&host).await, "fake-host");
    }
}
