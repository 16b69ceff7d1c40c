// file: src/runner/fake.rs
// version: 1.0.0
// guid: 90da362e-b0a1-421a-aef9-48e9089afe9d

//! Deterministic in-memory host used by the test suites
//!
//! `FakeHost` interprets the subset of apt, systemctl, ufw, ss and account
//! tooling that the provisioning stages invoke, so whole runs can be
//! replayed without root or network access. Failures are injected with
//! [`FakeHost::fail_on`].

use super::{display_command, CommandOutput, CommandRunner};
use crate::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const GIB: u64 = 1024 * 1024 * 1024;

/// Observable state of the simulated machine
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostState {
    pub packages: BTreeSet<String>,
    pub active_units: BTreeSet<String>,
    pub enabled_units: BTreeSet<String>,
    /// user -> supplementary groups
    pub users: BTreeMap<String, BTreeSet<String>>,
    /// path -> (contents, mode)
    pub files: BTreeMap<PathBuf, (String, u32)>,
    /// port -> owning process name
    pub listening: BTreeMap<u16, String>,
    pub firewall_active: bool,
    pub firewall_rules: Vec<String>,
    pub disk_available_bytes: u64,
    pub memory_total_bytes: u64,
}

#[derive(Debug, Clone)]
struct FailureRule {
    pattern: String,
    exit_code: i32,
    stderr: String,
}

/// Simulated host implementing [`CommandRunner`]
#[derive(Debug, Default)]
pub struct FakeHost {
    state: Mutex<HostState>,
    history: Mutex<Vec<String>>,
    failures: Mutex<Vec<FailureRule>>,
    sleeps: Mutex<u32>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl FakeHost {
    /// A freshly installed Ubuntu server: sshd on 22, root login allowed,
    /// ufw inactive, 50 GiB free disk, 4 GiB RAM.
    pub fn fresh_ubuntu() -> Self {
        let mut state = HostState {
            disk_available_bytes: 50 * GIB,
            memory_total_bytes: 4 * GIB,
            ..HostState::default()
        };
        for pkg in ["openssh-server", "curl", "ca-certificates"] {
            state.packages.insert(pkg.to_string());
        }
        state.active_units.insert("ssh".to_string());
        state.enabled_units.insert("ssh".to_string());
        state.users.insert("root".to_string(), BTreeSet::from(["root".to_string()]));
        state.files.insert(
            PathBuf::from("/etc/ssh/sshd_config"),
            (
                "Include /etc/ssh/sshd_config.d/*.conf\n#Port 22\nPermitRootLogin yes\n".to_string(),
                0o644,
            ),
        );
        state.listening.insert(22, "sshd".to_string());
        Self::from_state(state)
    }

    pub fn from_state(state: HostState) -> Self {
        Self {
            state: Mutex::new(state),
            ..Self::default()
        }
    }

    /// Every command matching `pattern` (substring of the rendered command
    /// line) fails with the given exit code and leaves state untouched
    pub fn fail_on(&self, pattern: &str, exit_code: i32, stderr: &str) {
        guard(&self.failures).push(FailureRule {
            pattern: pattern.to_string(),
            exit_code,
            stderr: stderr.to_string(),
        });
    }

    pub fn clear_failures(&self) {
        guard(&self.failures).clear();
    }

    pub fn snapshot(&self) -> HostState {
        guard(&self.state).clone()
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut HostState) -> R) -> R {
        f(&mut guard(&self.state))
    }

    /// Rendered command lines in execution order
    pub fn history(&self) -> Vec<String> {
        guard(&self.history).clone()
    }

    pub fn clear_history(&self) {
        guard(&self.history).clear();
    }

    pub fn sleeps(&self) -> u32 {
        *guard(&self.sleeps)
    }

    pub fn set_disk_available(&self, bytes: u64) {
        self.with_state(|s| s.disk_available_bytes = bytes);
    }

    pub fn set_memory_total(&self, bytes: u64) {
        self.with_state(|s| s.memory_total_bytes = bytes);
    }

    /// Stop a unit and drop the sockets it owned
    pub fn stop_unit(&self, unit: &str) {
        self.with_state(|s| stop(s, unit));
    }

    pub fn occupy_port(&self, port: u16, process: &str) {
        self.with_state(|s| {
            s.listening.insert(port, process.to_string());
        });
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.with_state(|s| s.files.get(Path::new(path)).map(|(c, _)| c.clone()))
    }

    pub fn file_mode(&self, path: &str) -> Option<u32> {
        self.with_state(|s| s.files.get(Path::new(path)).map(|(_, m)| *m))
    }

    fn interpret(&self, argv: &[&str]) -> CommandOutput {
        let mut s = guard(&self.state);
        match argv {
            ["apt-get", "update"] | ["apt-get", "-y", "upgrade"] => CommandOutput::ok(""),
            ["apt-get", "install", rest @ ..] => {
                for pkg in rest.iter().filter(|a| !a.starts_with('-')) {
                    install_package(&mut s, pkg);
                }
                CommandOutput::ok("")
            }
            ["dpkg-query", "-W", _, pkg] => {
                if s.packages.contains(*pkg) {
                    CommandOutput::ok("install ok installed")
                } else {
                    CommandOutput::failed(1, format!("dpkg-query: no packages found matching {}", pkg))
                }
            }
            ["systemctl", "is-active", "--quiet", unit] => exit_if(s.active_units.contains(*unit), 3),
            ["systemctl", "is-enabled", "--quiet", unit] => exit_if(s.enabled_units.contains(*unit), 1),
            ["systemctl", "enable", "--now", unit] => {
                s.enabled_units.insert(unit.to_string());
                start(&mut s, unit);
                CommandOutput::ok("")
            }
            ["systemctl", "enable", unit] => {
                s.enabled_units.insert(unit.to_string());
                CommandOutput::ok("")
            }
            ["systemctl", "disable", "--now", unit] => {
                s.enabled_units.remove(*unit);
                stop(&mut s, unit);
                CommandOutput::ok("")
            }
            ["systemctl", "start" | "restart", unit] => {
                start(&mut s, unit);
                CommandOutput::ok("")
            }
            ["systemctl", "stop", unit] => {
                stop(&mut s, unit);
                CommandOutput::ok("")
            }
            ["systemctl", "reload", unit] => exit_if(s.active_units.contains(*unit), 1),
            ["systemctl", "daemon-reload"] => CommandOutput::ok(""),
            ["sh", "-c", script] if script.contains("get.k3s.io") => {
                s.packages.insert("k3s".to_string());
                s.files
                    .insert(PathBuf::from("/usr/local/bin/k3s"), (String::new(), 0o755));
                s.enabled_units.insert("k3s".to_string());
                start(&mut s, "k3s");
                CommandOutput::ok("[INFO]  systemd: Starting k3s")
            }
            ["id", "-u", user] => match s.users.keys().position(|u| u == user) {
                Some(idx) => CommandOutput::ok(format!("{}\n", 1000 + idx)),
                None => CommandOutput::failed(1, format!("id: '{}': no such user", user)),
            },
            ["id", "-nG", user] => match s.users.get(*user) {
                Some(groups) => {
                    let mut names = vec![user.to_string()];
                    names.extend(groups.iter().filter(|g| g.as_str() != *user).cloned());
                    CommandOutput::ok(format!("{}\n", names.join(" ")))
                }
                None => CommandOutput::failed(1, format!("id: '{}': no such user", user)),
            },
            ["useradd", .., user] => {
                if s.users.contains_key(*user) {
                    CommandOutput::failed(9, format!("useradd: user '{}' already exists", user))
                } else {
                    s.users
                        .insert(user.to_string(), BTreeSet::from([user.to_string()]));
                    CommandOutput::ok("")
                }
            }
            ["usermod", "-aG", group, user] => match s.users.get_mut(*user) {
                Some(groups) => {
                    groups.insert(group.to_string());
                    CommandOutput::ok("")
                }
                None => CommandOutput::failed(6, format!("usermod: user '{}' does not exist", user)),
            },
            ["getent", "group", group] => {
                let members: Vec<&str> = s
                    .users
                    .iter()
                    .filter(|(name, groups)| name.as_str() != *group && groups.contains(*group))
                    .map(|(name, _)| name.as_str())
                    .collect();
                CommandOutput::ok(format!("{}:x:27:{}\n", group, members.join(",")))
            }
            ["install", "-d", ..] | ["chown", ..] | ["chmod", ..] => CommandOutput::ok(""),
            ["visudo", "-cf", path] => exit_if(s.files.contains_key(Path::new(path)), 1),
            ["ufw", "status"] => CommandOutput::ok(ufw_status(&s)),
            ["ufw", "allow", rule] => {
                if s.firewall_rules.iter().any(|r| r == rule) {
                    CommandOutput::ok("Skipping adding existing rule\n")
                } else {
                    s.firewall_rules.push(rule.to_string());
                    CommandOutput::ok("Rule added\n")
                }
            }
            ["ufw", "delete", "allow", rule] => {
                s.firewall_rules.retain(|r| r != rule);
                CommandOutput::ok("Rule deleted\n")
            }
            ["ufw", "default", ..] => CommandOutput::ok(""),
            ["ufw", "--force", "enable"] => {
                s.firewall_active = true;
                CommandOutput::ok("Firewall is active and enabled on system startup\n")
            }
            ["ufw", "--force", "reset"] => {
                s.firewall_active = false;
                s.firewall_rules.clear();
                CommandOutput::ok("")
            }
            ["sshd", "-t", ..] | ["nginx", "-t"] => CommandOutput::ok(""),
            ["ss", "-Htln"] => CommandOutput::ok(listening_lines(&s, false)),
            ["ss", "-Htlnp"] => CommandOutput::ok(listening_lines(&s, true)),
            ["ss", "-tulpn"] => CommandOutput::ok(format!(
                "Netid State Recv-Q Send-Q Local Address:Port Peer Address:Port Process\n{}",
                listening_lines(&s, true)
            )),
            ["df", "-B1", "--output=avail", _] => {
                CommandOutput::ok(format!("      Avail\n{}\n", s.disk_available_bytes))
            }
            ["free", "-b"] => CommandOutput::ok(format!(
                "               total        used        free      shared  buff/cache   available\nMem:    {}   0   0   0   0   0\nSwap:             0           0           0\n",
                s.memory_total_bytes
            )),
            ["test", _, path] => {
                let path = Path::new(path);
                exit_if(
                    s.files.contains_key(path) || s.files.keys().any(|p| p.starts_with(path) && p != path),
                    1,
                )
            }
            ["certbot", rest @ ..] => {
                match rest.iter().position(|a| *a == "-d").and_then(|i| rest.get(i + 1)) {
                    Some(domain) => {
                        s.files.insert(
                            PathBuf::from(format!("/etc/letsencrypt/live/{}/fullchain.pem", domain)),
                            ("CERT".to_string(), 0o644),
                        );
                        CommandOutput::ok("Congratulations!")
                    }
                    None => CommandOutput::failed(1, "certbot: no domain"),
                }
            }
            ["ln", "-sf", source, target] => {
                let contents = s
                    .files
                    .get(Path::new(source))
                    .cloned()
                    .unwrap_or_else(|| (String::new(), 0o644));
                s.files.insert(PathBuf::from(target), contents);
                CommandOutput::ok("")
            }
            ["which", program] => {
                let present = match *program {
                    "ufw" => s.packages.contains("ufw"),
                    _ => true,
                };
                if present {
                    CommandOutput::ok(format!("/usr/bin/{}\n", program))
                } else {
                    CommandOutput::failed(1, "")
                }
            }
            ["hostname"] => CommandOutput::ok("fake-host\n"),
            ["ps", "aux"] => CommandOutput::ok(format!(
                "USER PID COMMAND\n{}",
                s.active_units
                    .iter()
                    .enumerate()
                    .map(|(i, u)| format!("root {} {}\n", 100 + i, u))
                    .collect::<String>()
            )),
            ["journalctl", ..] => CommandOutput::ok("-- No entries --\n"),
            ["tail", "-n", _, path] => match s.files.get(Path::new(path)) {
                Some((contents, _)) => CommandOutput::ok(contents.clone()),
                None => CommandOutput::failed(1, format!("tail: cannot open '{}'", path)),
            },
            _ => CommandOutput::ok(""),
        }
    }
}

fn exit_if(condition: bool, failure_code: i32) -> CommandOutput {
    if condition {
        CommandOutput::ok("")
    } else {
        CommandOutput::failed(failure_code, "")
    }
}

fn install_package(s: &mut HostState, pkg: &str) {
    if !s.packages.insert(pkg.to_string()) {
        return;
    }
    // Debian starts daemons on first install
    let unit = match pkg {
        "fail2ban" => "fail2ban",
        "sshguard" => "sshguard",
        "nginx" => "nginx",
        "docker.io" => "docker",
        _ => return,
    };
    s.enabled_units.insert(unit.to_string());
    start(s, unit);
}

fn start(s: &mut HostState, unit: &str) {
    s.active_units.insert(unit.to_string());
    match unit {
        "ssh" | "sshd" => {
            s.listening.retain(|_, process| process != "sshd");
            for port in configured_ports(s, "/etc/ssh", "Port ", 22) {
                s.listening.insert(port, "sshd".to_string());
            }
        }
        "k3s" => {
            s.listening.retain(|_, process| process != "k3s-server");
            for port in configured_ports(s, "/etc/rancher/k3s", "https-listen-port:", 6443) {
                s.listening.insert(port, "k3s-server".to_string());
            }
        }
        "nginx" => {
            s.listening.insert(80, "nginx".to_string());
        }
        _ => {}
    }
}

fn stop(s: &mut HostState, unit: &str) {
    s.active_units.remove(unit);
    let process = match unit {
        "ssh" | "sshd" => "sshd",
        "k3s" => "k3s-server",
        "nginx" => "nginx",
        _ => return,
    };
    s.listening.retain(|_, p| p != process);
}

/// Uncommented `<key> <port>` lines in every file under `dir`
fn configured_ports(s: &HostState, dir: &str, key: &str, default: u16) -> Vec<u16> {
    let mut ports: Vec<u16> = s
        .files
        .iter()
        .filter(|(path, _)| path.starts_with(dir))
        .flat_map(|(_, (contents, _))| contents.lines())
        .filter_map(|line| line.trim().strip_prefix(key))
        .filter_map(|value| value.trim().trim_matches('"').parse().ok())
        .collect();
    if ports.is_empty() {
        ports.push(default);
    }
    ports.sort_unstable();
    ports.dedup();
    ports
}

fn ufw_status(s: &HostState) -> String {
    if !s.firewall_active {
        return "Status: inactive\n".to_string();
    }
    let mut out = String::from("Status: active\n\nTo                         Action      From\n--                         ------      ----\n");
    for rule in &s.firewall_rules {
        out.push_str(&format!("{:<26} ALLOW       Anywhere\n", rule));
    }
    out
}

fn listening_lines(s: &HostState, with_process: bool) -> String {
    s.listening
        .iter()
        .map(|(port, process)| {
            if with_process {
                format!(
                    "LISTEN 0      128          0.0.0.0:{}      0.0.0.0:*    users:((\"{}\",pid={},fd=3))\n",
                    port,
                    process,
                    1000 + u32::from(*port)
                )
            } else {
                format!("LISTEN 0      128          0.0.0.0:{}      0.0.0.0:*\n", port)
            }
        })
        .collect()
}

#[async_trait::async_trait]
impl CommandRunner for FakeHost {
    async fn run(&self, argv: &[&str]) -> Result<CommandOutput> {
        let line = display_command(argv);
        guard(&self.history).push(line.clone());

        let failure = guard(&self.failures)
            .iter()
            .find(|rule| line.contains(&rule.pattern))
            .cloned();
        if let Some(rule) = failure {
            return Ok(CommandOutput::failed(rule.exit_code, rule.stderr));
        }
        Ok(self.interpret(argv))
    }

    async fn read_file(&self, path: &Path) -> Result<Option<String>> {
        Ok(self.with_state(|s| s.files.get(path).map(|(c, _)| c.clone())))
    }

    async fn write_file(&self, path: &Path, contents: &str, mode: u32) -> Result<()> {
        guard(&self.history).push(format!("write {}", path.display()));
        self.with_state(|s| {
            s.files
                .insert(path.to_path_buf(), (contents.to_string(), mode));
        });
        Ok(())
    }

    async fn remove_file(&self, path: &Path) -> Result<()> {
        guard(&self.history).push(format!("remove {}", path.display()));
        self.with_state(|s| {
            s.files.remove(path);
        });
        Ok(())
    }

    async fn sleep(&self, _duration: Duration) {
        *guard(&self.sleeps) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fresh_host_has_ssh_on_22() {
        let host = FakeHost::fresh_ubuntu();
        let out = host.run(&["ss", "-Htlnp"]).await.unwrap();
        assert!(out.stdout.contains("0.0.0.0:22 "));
        assert!(out.stdout.contains("\"sshd\""));
        assert!(host.run(&["systemctl", "is-active", "--quiet", "ssh"]).await.unwrap().success());
    }

    #[tokio::test]
    async fn test_ssh_restart_follows_dropin_port() {
        let host = FakeHost::fresh_ubuntu();
        host.write_file(
            Path::new("/etc/ssh/sshd_config.d/00-test.conf"),
            "Port 2222\n",
            0o644,
        )
        .await
        .unwrap();
        host.run(&["systemctl", "restart", "ssh"]).await.unwrap();
        let state = host.snapshot();
        assert_eq!(state.listening.get(&2222).map(String::as_str), Some("sshd"));
        assert!(!state.listening.contains_key(&22));
    }

    #[tokio::test]
    async fn test_failure_rule_short_circuits_state() {
        let host = FakeHost::fresh_ubuntu();
        host.fail_on("apt-get install", 100, "broken packages");
        let out = host.run(&["apt-get", "install", "-y", "ufw"]).await.unwrap();
        assert_eq!(out.exit_code, 100);
        assert!(!host.snapshot().packages.contains("ufw"));
        assert_eq!(host.history(), vec!["apt-get install -y ufw".to_string()]);
    }

    #[tokio::test]
    async fn test_useradd_is_not_repeatable() {
        let host = FakeHost::fresh_ubuntu();
        assert!(host.run(&["useradd", "--create-home", "alice"]).await.unwrap().success());
        assert_eq!(host.run(&["useradd", "--create-home", "alice"]).await.unwrap().exit_code, 9);
        host.run(&["usermod", "-aG", "sudo", "alice"]).await.unwrap();
        let groups = host.run(&["id", "-nG", "alice"]).await.unwrap();
        assert_eq!(groups.stdout.trim(), "alice sudo");
    }
}
