// file: src/context.rs
// version: 1.1.0
// guid: 6c1e88c9-64d5-482e-aa02-9f40c7b0c1ba

//! Explicit run context threaded through every component

use crate::config::{
    AdminIdentity, ContainerRuntime, IntrusionPrevention, ProxySettings, RetryPolicy,
    RootLoginPolicy, RunOptions, SetupPaths, Thresholds,
};
use crate::ports::{PortRegistry, Service};
use crate::runner::CommandRunner;
use std::sync::Arc;
use uuid::Uuid;

/// Everything a run needs to know, plus the host capability
pub struct OrchestratorContext {
    pub run_id: Uuid,
    pub options: RunOptions,
    pub admin: AdminIdentity,
    pub recovery: Option<AdminIdentity>,
    pub registry: PortRegistry,
    pub runtime: ContainerRuntime,
    pub intrusion: IntrusionPrevention,
    pub proxy: Option<ProxySettings>,
    pub root_login: RootLoginPolicy,
    pub paths: SetupPaths,
    pub thresholds: Thresholds,
    pub retry: RetryPolicy,
    runner: Arc<dyn CommandRunner>,
}

impl OrchestratorContext {
    /// Context with default choices for everything except the admin and ports
    pub fn new(admin: AdminIdentity, registry: PortRegistry, runner: Arc<dyn CommandRunner>) -> Self {
        let paths = SetupPaths::default().with_ports_file(registry.path());
        Self {
            run_id: Uuid::new_v4(),
            options: RunOptions::default(),
            admin,
            recovery: None,
            registry,
            runtime: ContainerRuntime::default(),
            intrusion: IntrusionPrevention::default(),
            proxy: None,
            root_login: RootLoginPolicy::default(),
            paths,
            thresholds: Thresholds::default(),
            retry: RetryPolicy::default(),
            runner,
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_recovery(mut self, recovery: Option<AdminIdentity>) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn with_runtime(mut self, runtime: ContainerRuntime) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_intrusion(mut self, intrusion: IntrusionPrevention) -> Self {
        self.intrusion = intrusion;
        self
    }

    pub fn with_proxy(mut self, proxy: Option<ProxySettings>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn with_root_login(mut self, policy: RootLoginPolicy) -> Self {
        self.root_login = policy;
        self
    }

    pub fn with_paths(mut self, paths: SetupPaths) -> Self {
        self.paths = paths.with_ports_file(self.registry.path());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    pub(crate) fn shared_runner(&self) -> Arc<dyn CommandRunner> {
        Arc::clone(&self.runner)
    }

    pub(crate) fn set_runner(&mut self, runner: Arc<dyn CommandRunner>) {
        self.runner = runner;
    }

    pub fn dry_run(&self) -> bool {
        self.options.dry_run
    }

    pub fn ssh_port(&self) -> u16 {
        self.registry.port(Service::Ssh)
    }

    pub fn api_port(&self) -> u16 {
        self.registry.port(Service::KubeApi)
    }

    /// Admin first, then the optional recovery identity
    pub fn identities(&self) -> impl Iterator<Item = &AdminIdentity> {
        std::iter::once(&self.admin).chain(self.recovery.iter())
    }
}

impl std::fmt::Debug for OrchestratorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorContext")
            .field("run_id", &self.run_id)
            .field("options", &self.options)
            .field("admin", &self.admin.username)
            .field("ssh_port", &self.ssh_port())
            .field("api_port", &self.api_port())
            .field("runtime", &self.runtime)
            .field("intrusion", &self.intrusion)
            .finish_non_exhaustive()
    }
}
