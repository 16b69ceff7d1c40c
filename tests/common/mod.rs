// file: tests/common/mod.rs
// version: 1.0.0
// guid: 18a1dcf2-865b-448d-b5cc-01c359075cae

//! Shared fixtures for the integration tests

#![allow(dead_code)]

use container_host_setup::config::AdminIdentity;
use container_host_setup::context::OrchestratorContext;
use container_host_setup::orchestrator::RunEvent;
use container_host_setup::ports::PortRegistry;
use container_host_setup::runner::FakeHost;
use container_host_setup::stages::Stage;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

pub const KEY: &str =
    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl ops@laptop";

pub const GIB: u64 = 1024 * 1024 * 1024;

/// A fake host plus a private directory for the ports file
pub struct Harness {
    pub host: Arc<FakeHost>,
    pub dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_host(FakeHost::fresh_ubuntu())
    }

    pub fn with_host(host: FakeHost) -> Self {
        Self {
            host: Arc::new(host),
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn ports_file(&self) -> PathBuf {
        self.dir.path().join("ports.conf")
    }

    /// Fresh context for admin `ops`, registry loaded from the ports file
    pub fn context(&self) -> OrchestratorContext {
        let registry = PortRegistry::load_or_default(self.ports_file()).unwrap();
        let admin = AdminIdentity::new("ops", vec![KEY.to_string()]);
        OrchestratorContext::new(admin, registry, self.host.clone())
    }

    pub fn history_starting_with(&self, prefix: &str) -> Vec<String> {
        self.host
            .history()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }
}

/// Stages in the order they were started
pub fn started(events: &[RunEvent]) -> Vec<Stage> {
    events
        .iter()
        .filter_map(|e| match e {
            RunEvent::StageStarted { stage, .. } => Some(*stage),
            _ => None,
        })
        .collect()
}
