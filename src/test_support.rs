// file: src/test_support.rs
// version: 1.0.0
// guid: 714d76e5-2f21-43f5-abc2-06372ca945e1

//! Shared fixtures for unit tests

use crate::config::AdminIdentity;
use crate::context::OrchestratorContext;
use crate::ports::PortRegistry;
use crate::runner::FakeHost;
use std::sync::Arc;
use tempfile::TempDir;

pub const KEY: &str =
    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl ops@laptop";

/// Context for admin `ops` on a fake host, ports file inside a temp dir
pub fn fake_context(host: Arc<FakeHost>) -> (OrchestratorContext, TempDir) {
    let dir = TempDir::new().unwrap();
    let registry = PortRegistry::with_defaults(dir.path().join("ports.conf"));
    let admin = AdminIdentity::new("ops", vec![KEY.to_string()]);
    (OrchestratorContext::new(admin, registry, host), dir)
}

/// Same as [`fake_context`] with SSH on 2222 and the API on 16443
pub fn custom_ports_context(host: Arc<FakeHost>) -> (OrchestratorContext, TempDir) {
    let (mut ctx, dir) = fake_context(host);
    let unbound = |_: u16| false;
    ctx.registry
        .allocate(crate::ports::Service::Ssh, 2222, &unbound)
        .unwrap();
    ctx.registry
        .allocate(crate::ports::Service::KubeApi, 16443, &unbound)
        .unwrap();
    (ctx, dir)
}
