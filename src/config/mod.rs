// file: src/config/mod.rs
// version: 2.1.0
// guid: 83173b3f-12ef-4f99-baed-df8cb743c982

//! Configuration module for container host provisioning
//!
//! Holds the typed settings that flow into [`crate::context::OrchestratorContext`]
//! plus the YAML profile layer that can supply them.

pub mod loader;
pub mod profile;

pub use loader::ConfigLoader;
pub use profile::{IdentityProfile, PortsProfile, SetupProfile};

use crate::{Result, SetupError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

const GIB: u64 = 1024 * 1024 * 1024;

/// Flags controlling how a run behaves
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Preview every stage without mutating the host
    pub dry_run: bool,
    /// Never prompt; missing mandatory values are an error
    pub assume_yes: bool,
    /// Only regenerate the report
    pub report_only: bool,
    /// Emit the run summary as JSON
    pub json: bool,
}

/// Supported container runtimes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    #[default]
    K3s,
    Docker,
}

impl ContainerRuntime {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerRuntime::K3s => "k3s",
            ContainerRuntime::Docker => "docker",
        }
    }

    /// systemd unit that runs the runtime
    pub fn unit(&self) -> &'static str {
        match self {
            ContainerRuntime::K3s => "k3s",
            ContainerRuntime::Docker => "docker",
        }
    }
}

impl std::str::FromStr for ContainerRuntime {
    type Err = SetupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "k3s" => Ok(ContainerRuntime::K3s),
            "docker" => Ok(ContainerRuntime::Docker),
            _ => Err(SetupError::config(format!("Unknown container runtime: {}", s))),
        }
    }
}

/// Supported intrusion prevention daemons
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntrusionPrevention {
    #[default]
    Fail2ban,
    Sshguard,
}

impl IntrusionPrevention {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntrusionPrevention::Fail2ban => "fail2ban",
            IntrusionPrevention::Sshguard => "sshguard",
        }
    }

    /// Package and unit share the same name for both daemons
    pub fn unit(&self) -> &'static str {
        self.as_str()
    }
}

impl std::str::FromStr for IntrusionPrevention {
    type Err = SetupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fail2ban" => Ok(IntrusionPrevention::Fail2ban),
            "sshguard" => Ok(IntrusionPrevention::Sshguard),
            _ => Err(SetupError::config(format!("Unknown intrusion prevention: {}", s))),
        }
    }
}

/// `PermitRootLogin` value written by the hardening stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RootLoginPolicy {
    #[default]
    No,
    ProhibitPassword,
}

impl RootLoginPolicy {
    pub fn as_sshd_value(&self) -> &'static str {
        match self {
            RootLoginPolicy::No => "no",
            RootLoginPolicy::ProhibitPassword => "prohibit-password",
        }
    }
}

impl fmt::Display for RootLoginPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sshd_value())
    }
}

impl std::str::FromStr for RootLoginPolicy {
    type Err = SetupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "no" | "false" => Ok(RootLoginPolicy::No),
            "prohibit-password" | "without-password" => Ok(RootLoginPolicy::ProhibitPassword),
            _ => Err(SetupError::config(format!(
                "Unsupported PermitRootLogin policy '{}' (expected no or prohibit-password)",
                s
            ))),
        }
    }
}

/// Reverse proxy with a TLS certificate for one domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    pub domain: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default = "default_upstream")]
    pub upstream: String,
}

fn default_upstream() -> String {
    "http://127.0.0.1:8080".to_string()
}

impl ProxySettings {
    pub fn new(domain: impl Into<String>, email: Option<String>) -> Self {
        Self {
            domain: domain.into(),
            email,
            upstream: default_upstream(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !compile(DOMAIN_PATTERN)?.is_match(&self.domain) {
            return Err(SetupError::config(format!("Invalid domain name: {}", self.domain)));
        }
        if let Some(email) = &self.email {
            if !email.contains('@') {
                return Err(SetupError::config(format!("Invalid certificate email: {}", email)));
            }
        }
        Ok(())
    }
}

/// A login identity provisioned with key-only access and sudo
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminIdentity {
    pub username: String,
    pub authorized_keys: Vec<String>,
    pub groups: Vec<String>,
}

impl AdminIdentity {
    pub fn new(username: impl Into<String>, authorized_keys: Vec<String>) -> Self {
        Self {
            username: username.into(),
            authorized_keys,
            groups: vec!["sudo".to_string()],
        }
    }

    pub fn home(&self) -> PathBuf {
        PathBuf::from("/home").join(&self.username)
    }

    pub fn authorized_keys_path(&self) -> PathBuf {
        self.home().join(".ssh/authorized_keys")
    }

    pub fn validate(&self) -> Result<()> {
        validate_username(&self.username)?;
        if self.authorized_keys.is_empty() {
            return Err(SetupError::config(format!(
                "User '{}' needs at least one SSH public key",
                self.username
            )));
        }
        for key in &self.authorized_keys {
            validate_public_key(key)?;
        }
        Ok(())
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| SetupError::config(format!("Invalid regex pattern: {}", e)))
}

const USERNAME_PATTERN: &str = r"^[a-z_][a-z0-9_-]{0,31}$";
const PUBLIC_KEY_PATTERN: &str = r"^(ssh-(rsa|ed25519|dss)|ecdsa-sha2-nistp(256|384|521)|sk-(ssh-ed25519|ecdsa-sha2-nistp256)@openssh\.com) [A-Za-z0-9+/]+={0,3}( .*)?$";
const DOMAIN_PATTERN: &str = r"^([a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?\.)+[a-zA-Z]{2,}$";

pub fn validate_username(username: &str) -> Result<()> {
    if username == "root" {
        return Err(SetupError::config("The admin user must not be root"));
    }
    if !compile(USERNAME_PATTERN)?.is_match(username) {
        return Err(SetupError::config(format!(
            "Invalid username '{}': use lowercase letters, digits, '_' or '-' (max 32)",
            username
        )));
    }
    Ok(())
}

pub fn validate_public_key(key: &str) -> Result<()> {
    if compile(PUBLIC_KEY_PATTERN)?.is_match(key.trim()) {
        Ok(())
    } else {
        let preview: String = key.chars().take(24).collect();
        Err(SetupError::config(format!(
            "Not an OpenSSH public key: '{}...'",
            preview
        )))
    }
}

/// Public key lines of an `authorized_keys` style text
pub fn parse_key_lines(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Where bundles go when the invoking directory is not writable
pub const FALLBACK_DIAGNOSTICS_DIR: &str = "/var/log/container-host-setup";

/// Bundles land in the directory the tool was started from
pub fn invoking_dir() -> PathBuf {
    match std::env::current_dir() {
        Ok(dir) if tempfile::tempfile_in(&dir).is_ok() => dir,
        _ => PathBuf::from(FALLBACK_DIAGNOSTICS_DIR),
    }
}

/// Filesystem locations touched by a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupPaths {
    pub ports_file: PathBuf,
    pub state_dir: PathBuf,
    pub report_dir: PathBuf,
    pub diagnostics_dir: PathBuf,
    pub log_file: PathBuf,
    pub ssh_dropin: PathBuf,
    pub k3s_config: PathBuf,
    pub k3s_binary: PathBuf,
    pub fail2ban_jail: PathBuf,
    pub sudoers_dir: PathBuf,
    pub nginx_sites_available: PathBuf,
    pub nginx_sites_enabled: PathBuf,
}

impl Default for SetupPaths {
    fn default() -> Self {
        let state_dir = PathBuf::from("/var/lib/container-host-setup");
        Self {
            ports_file: PathBuf::from(crate::ports::store::DEFAULT_PORTS_FILE),
            report_dir: state_dir.join("report"),
            state_dir,
            diagnostics_dir: invoking_dir(),
            log_file: PathBuf::from("/var/log/container-host-setup.log"),
            ssh_dropin: PathBuf::from("/etc/ssh/sshd_config.d/00-container-host-setup.conf"),
            k3s_config: PathBuf::from("/etc/rancher/k3s/config.yaml"),
            k3s_binary: PathBuf::from("/usr/local/bin/k3s"),
            fail2ban_jail: PathBuf::from("/etc/fail2ban/jail.d/container-host-setup.local"),
            sudoers_dir: PathBuf::from("/etc/sudoers.d"),
            nginx_sites_available: PathBuf::from("/etc/nginx/sites-available"),
            nginx_sites_enabled: PathBuf::from("/etc/nginx/sites-enabled"),
        }
    }
}

impl SetupPaths {
    pub fn report_file(&self) -> PathBuf {
        self.report_dir.join("setup-report.txt")
    }

    pub fn report_json_file(&self) -> PathBuf {
        self.report_dir.join("setup-report.json")
    }

    /// Drop-in contents from before an unfinished hardening attempt
    pub fn ssh_dropin_backup(&self) -> PathBuf {
        self.state_dir.join("ssh-dropin.previous")
    }

    pub fn update_stamp(&self) -> PathBuf {
        self.state_dir.join("system-update.stamp")
    }

    pub fn sudoers_file(&self, username: &str) -> PathBuf {
        self.sudoers_dir.join(format!("90-{}", username))
    }

    /// Point the ports file somewhere else (tests, `--ports-file`)
    pub fn with_ports_file(mut self, path: impl AsRef<Path>) -> Self {
        self.ports_file = path.as_ref().to_path_buf();
        self
    }
}

/// Minimum resources checked before any mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    pub min_disk_bytes: u64,
    pub min_memory_bytes: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_disk_bytes: 5 * GIB,
            min_memory_bytes: GIB,
        }
    }
}

/// Bounded polling used after restarting sshd
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl ops@laptop";

    #[test]
    fn test_bundles_default_to_invoking_dir() {
        let cwd = std::env::current_dir().unwrap();
        let expected = if tempfile::tempfile_in(&cwd).is_ok() {
            cwd
        } else {
            PathBuf::from(FALLBACK_DIAGNOSTICS_DIR)
        };
        assert_eq!(SetupPaths::default().diagnostics_dir, expected);
    }

    #[test]
    fn test_username_rules() {
        assert!(validate_username("ops").is_ok());
        assert!(validate_username("_svc-1").is_ok());
        assert!(validate_username("root").is_err());
        assert!(validate_username("Admin").is_err());
        assert!(validate_username("1abc").is_err());
        assert!(validate_username(&"a".repeat(33)).is_err());
    }

    #[test]
    fn test_public_key_format() {
        assert!(validate_public_key(KEY).is_ok());
        assert!(validate_public_key("ecdsa-sha2-nistp256 AAAAE2VjZHNh").is_ok());
        assert!(validate_public_key("hunter2").is_err());
        assert!(validate_public_key("ssh-ed25519").is_err());
    }

    #[test]
    fn test_identity_requires_key() {
        assert!(AdminIdentity::new("ops", vec![]).validate().is_err());
        let identity = AdminIdentity::new("ops", vec![KEY.to_string()]);
        assert!(identity.validate().is_ok());
        assert_eq!(
            identity.authorized_keys_path(),
            PathBuf::from("/home/ops/.ssh/authorized_keys")
        );
    }

    #[test]
    fn test_parse_key_lines_skips_comments() {
        let keys = parse_key_lines(&format!("# laptop\n{}\n\n", KEY));
        assert_eq!(keys, vec![KEY.to_string()]);
    }

    #[test]
    fn test_enum_parsing() {
        assert_eq!("Docker".parse::<ContainerRuntime>().unwrap(), ContainerRuntime::Docker);
        assert_eq!("sshguard".parse::<IntrusionPrevention>().unwrap(), IntrusionPrevention::Sshguard);
        assert_eq!(
            "prohibit-password".parse::<RootLoginPolicy>().unwrap(),
            RootLoginPolicy::ProhibitPassword
        );
        assert!("yes".parse::<RootLoginPolicy>().is_err());
    }

    #[test]
    fn test_proxy_validation() {
        assert!(ProxySettings::new("example.com", Some("ops@example.com".into())).validate().is_ok());
        assert!(ProxySettings::new("not a domain", None).validate().is_err());
        assert!(ProxySettings::new("example.com", Some("nope".into())).validate().is_err());
    }
}
