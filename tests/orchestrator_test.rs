// file: tests/orchestrator_test.rs
// version: 1.1.0
// guid: 4948668b-2b6f-4886-98c0-020d9abd7663

//! End-to-end runs of the state machine against the in-memory host

mod common;

use common::{started, Harness, GIB, KEY};
use container_host_setup::config::{AdminIdentity, RunOptions};
use container_host_setup::context::OrchestratorContext;
use container_host_setup::orchestrator::{Orchestrator, RunState};
use container_host_setup::ports::{PortRegistry, Service};
use container_host_setup::runner::{CommandOutput, CommandRunner, FakeHost};
use container_host_setup::stages::Stage;
use container_host_setup::steps::StepStatus;
use container_host_setup::SetupError;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

const DROPIN: &str = "/etc/ssh/sshd_config.d/00-container-host-setup.conf";
const REPORT: &str = "/var/lib/container-host-setup/report/setup-report.txt";

fn custom_ports() -> Vec<(Service, u32)> {
    vec![(Service::Ssh, 2222), (Service::KubeApi, 16443)]
}

#[tokio::test]
async fn test_custom_ports_end_to_end() {
    let h = Harness::new();
    let mut orchestrator = Orchestrator::new(h.context()).with_port_requests(custom_ports());

    let summary = orchestrator.run().await.unwrap();
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(orchestrator.state(), &RunState::Done);

    let state = h.host.snapshot();
    assert_eq!(state.listening.get(&2222).map(String::as_str), Some("sshd"));
    assert!(!state.listening.contains_key(&22));
    assert_eq!(state.listening.get(&16443).map(String::as_str), Some("k3s-server"));
    assert_eq!(state.firewall_rules, vec!["22/tcp", "2222/tcp", "16443/tcp"]);
    assert!(state.users["ops"].contains("sudo"));

    let dropin = h.host.file(DROPIN).unwrap();
    assert!(dropin.contains("Port 2222"));
    assert!(dropin.contains("PasswordAuthentication no"));

    let persisted = PortRegistry::load(h.ports_file()).unwrap().unwrap();
    assert_eq!(persisted.port(Service::Ssh), 2222);
    assert_eq!(persisted.port(Service::KubeApi), 16443);

    let report = h.host.file(REPORT).unwrap();
    assert!(report.contains("2222"));
    assert!(report.contains("ufw delete allow 22/tcp"));
    assert_eq!(h.host.file_mode(REPORT), Some(0o600));
}

#[tokio::test]
async fn test_second_run_changes_nothing() {
    let h = Harness::new();
    Orchestrator::new(h.context())
        .with_port_requests(custom_ports())
        .run()
        .await
        .unwrap();

    h.host.clear_history();
    let mut second = Orchestrator::new(h.context());
    let summary = second.run().await.unwrap();

    assert!(summary
        .results
        .iter()
        .all(|r| r.status == StepStatus::AlreadyConfigured));
    assert_eq!(summary.results.len(), 7);
    assert!(h.history_starting_with("write ").is_empty());
    assert!(h.history_starting_with("apt-get").is_empty());
    assert!(h.history_starting_with("ufw allow").is_empty());
    assert!(h.history_starting_with("systemctl restart").is_empty());
}

#[tokio::test]
async fn test_ssh_down_blocks_hardening() {
    let h = Harness::new();
    h.host.stop_unit("ssh");
    let mut orchestrator = Orchestrator::new(h.context()).with_port_requests(custom_ports());

    let err = orchestrator.run().await.unwrap_err();
    assert!(matches!(err, SetupError::Postcondition(_)));
    assert_ne!(err.exit_code(), 0);

    assert!(!started(orchestrator.events()).contains(&Stage::SshHardening));
    assert!(h.host.file(DROPIN).is_none());
    assert!(matches!(
        orchestrator.state(),
        RunState::Failed { stage: None, bundle: Some(_) }
    ));

    // Cleanup leaves both SSH ports reachable
    let state = h.host.snapshot();
    assert!(state.firewall_active);
    assert!(state.firewall_rules.contains(&"22/tcp".to_string()));
    assert!(state.firewall_rules.contains(&"2222/tcp".to_string()));
    assert!(!state.firewall_rules.contains(&"16443/tcp".to_string()));
}

#[tokio::test]
async fn test_ssh_down_blocks_hardening_in_unattended_dry_run() {
    let h = Harness::new();
    h.host.stop_unit("ssh");
    let ctx = h.context().with_options(RunOptions {
        dry_run: true,
        assume_yes: true,
        ..RunOptions::default()
    });
    let mut orchestrator = Orchestrator::new(ctx);

    let err = orchestrator.run().await.unwrap_err();
    assert!(matches!(err, SetupError::Postcondition(_)));
    assert!(!started(orchestrator.events()).contains(&Stage::SshHardening));
}

#[tokio::test]
async fn test_low_disk_aborts_before_any_stage() {
    let h = Harness::new();
    h.host.set_disk_available(2 * GIB);
    let mut orchestrator = Orchestrator::new(h.context()).with_port_requests(custom_ports());

    let err = orchestrator.run().await.unwrap_err();
    assert_eq!(err.exit_code(), 2);
    assert!(started(orchestrator.events()).is_empty());

    for prefix in ["apt-get", "systemctl", "ufw", "useradd", "sh -c"] {
        assert!(h.history_starting_with(prefix).is_empty(), "{} ran", prefix);
    }
    assert!(!h.ports_file().exists());
    assert!(orchestrator.bundle_path().is_some());
}

#[tokio::test]
async fn test_optional_stage_failure_continues() {
    let h = Harness::new();
    h.host
        .fail_on("apt-get install -y fail2ban", 100, "E: Unable to locate package");
    let mut orchestrator = Orchestrator::new(h.context());

    let summary = orchestrator.run().await.unwrap();
    let intrusion = summary
        .results
        .iter()
        .find(|r| r.stage == Stage::IntrusionPrevention)
        .unwrap();
    assert_eq!(intrusion.status, StepStatus::Failed);
    assert_eq!(intrusion.exit_code, Some(100));
    assert!(summary
        .warnings
        .iter()
        .any(|w| w.starts_with("intrusion-prevention failed")));
    assert_eq!(
        started(orchestrator.events()).last(),
        Some(&Stage::SshHardening)
    );
    assert_eq!(orchestrator.state(), &RunState::Done);
}

#[tokio::test]
async fn test_critical_stage_failure_cleans_up() {
    let h = Harness::new();
    h.host
        .fail_on("get.k3s.io", 7, "curl: (6) Could not resolve host: get.k3s.io");
    let mut orchestrator = Orchestrator::new(h.context()).with_port_requests(custom_ports());

    let err = orchestrator.run().await.unwrap_err();
    assert_eq!(err.exit_code(), 7);
    assert!(err.failing_command().unwrap().contains("get.k3s.io"));

    assert_eq!(
        started(orchestrator.events()),
        vec![Stage::SystemUpdate, Stage::ContainerRuntime]
    );
    let bundle = match orchestrator.state() {
        RunState::Failed {
            stage: Some(Stage::ContainerRuntime),
            bundle: Some(bundle),
        } => bundle.clone(),
        other => panic!("unexpected state {:?}", other),
    };
    let summary = h.host.file(&bundle.to_string_lossy()).unwrap();
    assert!(summary.contains("container-runtime"));
    assert!(summary.contains("exit code: 7"));
    assert_eq!(h.host.file_mode(&bundle.to_string_lossy()), Some(0o600));

    let history = h.host.history();
    assert!(history.contains(&"systemctl stop k3s".to_string()));
    assert!(history.contains(&"ufw --force reset".to_string()));
    assert!(!history.iter().any(|c| c.contains("restart ssh")));
    assert!(h.host.snapshot().active_units.contains("ssh"));
}

#[tokio::test]
async fn test_unverified_hardening_finishes_non_zero() {
    let h = Harness::new();
    h.host.fail_on("systemctl restart ssh", 1, "Job for ssh.service failed");
    let mut orchestrator = Orchestrator::new(h.context()).with_port_requests(custom_ports());

    let summary = orchestrator.run().await.unwrap();
    assert!(summary.hardening_unverified);
    assert_eq!(summary.exit_code(), 1);
    assert_eq!(orchestrator.state(), &RunState::Done);

    let report_writes = h
        .host
        .history()
        .iter()
        .filter(|c| c.as_str() == format!("write {}", REPORT))
        .count();
    assert_eq!(report_writes, 2);
    assert!(h.history_starting_with("ufw --force reset").is_empty());
}

#[tokio::test]
async fn test_unverified_hardening_keeps_live_sshd_port_open() {
    let h = Harness::new();
    h.host.with_state(|s| {
        s.listening.remove(&22);
        s.listening.insert(2200, "sshd".to_string());
    });
    h.host.fail_on("systemctl restart ssh", 1, "Job for ssh.service failed");
    let mut orchestrator = Orchestrator::new(h.context()).with_port_requests(custom_ports());

    let summary = orchestrator.run().await.unwrap();
    assert!(summary.hardening_unverified);

    let state = h.host.snapshot();
    assert!(state.firewall_active);
    assert_eq!(state.listening.get(&2200).map(String::as_str), Some("sshd"));
    assert!(state.firewall_rules.contains(&"2200/tcp".to_string()));
}

#[tokio::test]
async fn test_interrupt_exits_130() {
    let h = Harness::new();
    let mut orchestrator = Orchestrator::new(h.context());

    let err = orchestrator
        .run_until(async { "SIGINT".to_string() })
        .await
        .unwrap_err();
    assert!(matches!(err, SetupError::Interrupted(ref s) if s == "SIGINT"));
    assert_eq!(err.exit_code(), 130);
    assert!(started(orchestrator.events()).is_empty());
    assert!(h.history_starting_with("ufw").is_empty());
}

#[tokio::test]
async fn test_dry_run_previews_without_mutation() {
    let h = Harness::new();
    let before = h.host.snapshot();
    let ctx = h.context().with_options(RunOptions {
        dry_run: true,
        ..RunOptions::default()
    });
    let mut orchestrator = Orchestrator::new(ctx).with_port_requests(custom_ports());

    let summary = orchestrator.run().await.unwrap();
    assert!(summary.dry_run);
    assert!(summary
        .results
        .iter()
        .all(|r| r.status == StepStatus::Previewed));
    assert_eq!(h.host.snapshot(), before);
    assert!(!h.ports_file().exists());
    // Non-SSH post checks were only previewed, so they warn
    assert!(!summary.warnings.is_empty());
}

#[tokio::test]
async fn test_report_only_skips_provisioning() {
    let h = Harness::new();
    let ctx = h.context().with_options(RunOptions {
        report_only: true,
        ..RunOptions::default()
    });
    let mut orchestrator = Orchestrator::new(ctx);

    orchestrator.run().await.unwrap();
    assert_eq!(started(orchestrator.events()), vec![Stage::Report]);
    assert!(h.host.file(REPORT).unwrap().contains("hardening pending"));
    assert!(h.history_starting_with("apt-get").is_empty());
}

#[tokio::test]
async fn test_rerun_after_failure_converges() {
    let h = Harness::new();
    h.host
        .fail_on("get.k3s.io", 7, "curl: (6) Could not resolve host: get.k3s.io");
    let mut first = Orchestrator::new(h.context()).with_port_requests(custom_ports());
    assert!(first.run().await.is_err());

    h.host.clear_failures();
    let mut second = Orchestrator::new(h.context()).with_port_requests(custom_ports());
    let summary = second.run().await.unwrap();
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(second.state(), &RunState::Done);

    h.host.clear_history();
    let mut third = Orchestrator::new(h.context());
    let summary = third.run().await.unwrap();
    assert!(summary
        .results
        .iter()
        .all(|r| r.status == StepStatus::AlreadyConfigured));
    assert!(h.history_starting_with("ufw allow").is_empty());
    assert!(h.history_starting_with("useradd").is_empty());

    let state = h.host.snapshot();
    assert_eq!(state.firewall_rules, vec!["22/tcp", "2222/tcp", "16443/tcp"]);
    assert_eq!(state.listening.get(&2222).map(String::as_str), Some("sshd"));
}

/// Delivers a signal the moment the SSH drop-in hits the disk
struct SignalOnDropin {
    host: Arc<FakeHost>,
    signal: Mutex<Option<oneshot::Sender<String>>>,
}

#[async_trait::async_trait]
impl CommandRunner for SignalOnDropin {
    async fn run(&self, argv: &[&str]) -> container_host_setup::Result<CommandOutput> {
        self.host.run(argv).await
    }

    async fn read_file(&self, path: &Path) -> container_host_setup::Result<Option<String>> {
        self.host.read_file(path).await
    }

    async fn write_file(&self, path: &Path, contents: &str, mode: u32) -> container_host_setup::Result<()> {
        self.host.write_file(path, contents, mode).await?;
        if path == Path::new(DROPIN) {
            let sender = self.signal.lock().unwrap().take();
            if let Some(sender) = sender {
                let _ = sender.send("SIGTERM".to_string());
            }
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    async fn remove_file(&self, path: &Path) -> container_host_setup::Result<()> {
        self.host.remove_file(path).await
    }

    async fn sleep(&self, _duration: std::time::Duration) {}
}

#[tokio::test]
async fn test_interrupt_during_hardening_restores_dropin() {
    let h = Harness::new();
    let (tx, rx) = oneshot::channel();
    let runner = SignalOnDropin {
        host: h.host.clone(),
        signal: Mutex::new(Some(tx)),
    };
    let ctx = OrchestratorContext::new(
        AdminIdentity::new("ops", vec![KEY.to_string()]),
        PortRegistry::load_or_default(h.ports_file()).unwrap(),
        Arc::new(runner),
    );
    let mut orchestrator = Orchestrator::new(ctx).with_port_requests(custom_ports());

    let err = orchestrator
        .run_until(async move { rx.await.unwrap_or_default() })
        .await
        .unwrap_err();
    assert!(matches!(err, SetupError::Interrupted(ref s) if s == "SIGTERM"));
    assert_eq!(err.exit_code(), 130);
    assert!(matches!(
        orchestrator.state(),
        RunState::Failed { stage: Some(Stage::SshHardening), .. }
    ));

    // The daemon never saw the new drop-in
    assert!(h.host.file(DROPIN).is_none());
    assert!(h.history_starting_with("sshd -t").is_empty());
    assert!(h.history_starting_with("systemctl restart").is_empty());
    let state = h.host.snapshot();
    assert_eq!(state.listening.get(&22).map(String::as_str), Some("sshd"));
    assert!(state.firewall_rules.contains(&"22/tcp".to_string()));
    assert!(state.firewall_rules.contains(&"2222/tcp".to_string()));
}
