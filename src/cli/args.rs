// file: src/cli/args.rs
// version: 2.0.0
// guid: 1c19e093-6ffa-4269-9203-c06c605d0a8a

//! Command line argument definitions

use crate::config::{ContainerRuntime, IntrusionPrevention, RootLoginPolicy};
use crate::ports::store::DEFAULT_PORTS_FILE;
use crate::ports::Service;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "container-host-setup")]
#[command(about = "Provision and harden a Debian/Ubuntu container host without locking yourself out")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Emit JSON log lines on stdout
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Run log (falls back to the working directory when not writable)
    #[arg(long, global = true, default_value = "/var/log/container-host-setup.log")]
    pub log_file: PathBuf,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Provision the host and harden SSH
    Setup(SetupArgs),

    /// Run the pre-install checks only
    Check(ProfileArgs),

    /// Inspect or change persisted port assignments
    Ports {
        #[command(subcommand)]
        action: PortsAction,

        #[arg(long, default_value = DEFAULT_PORTS_FILE)]
        ports_file: PathBuf,
    },
}

/// Settings shared by `setup` and `check`
#[derive(Args, Debug, Clone, Default)]
pub struct ProfileArgs {
    /// YAML profile; flags given here take precedence
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub admin_user: Option<String>,

    /// Public key for the admin user (repeatable)
    #[arg(long = "admin-key")]
    pub admin_keys: Vec<String>,

    #[arg(long)]
    pub admin_key_file: Option<PathBuf>,

    #[arg(long)]
    pub recovery_user: Option<String>,

    /// Public key for the recovery user (repeatable, defaults to the admin keys)
    #[arg(long = "recovery-key")]
    pub recovery_keys: Vec<String>,

    #[arg(long)]
    pub ssh_port: Option<u32>,

    #[arg(long)]
    pub api_port: Option<u32>,

    #[arg(long, value_enum)]
    pub runtime: Option<RuntimeArg>,

    #[arg(long, value_enum)]
    pub intrusion: Option<IntrusionArg>,

    /// Domain served by the nginx reverse proxy
    #[arg(long)]
    pub domain: Option<String>,

    /// Contact address for the certificate
    #[arg(long, requires = "domain")]
    pub email: Option<String>,

    #[arg(long, value_enum)]
    pub permit_root_login: Option<RootLoginArg>,

    #[arg(long, default_value = DEFAULT_PORTS_FILE)]
    pub ports_file: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct SetupArgs {
    #[command(flatten)]
    pub profile: ProfileArgs,

    /// Show what would change without touching the host
    #[arg(long)]
    pub dry_run: bool,

    /// Never prompt; requires an admin user and key
    #[arg(short, long)]
    pub yes: bool,

    /// Only regenerate the setup report
    #[arg(long)]
    pub report_only: bool,

    /// Print the run summary as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum PortsAction {
    /// Show current assignments
    List {
        #[arg(long)]
        json: bool,
    },
    /// Assign a port to a service
    Set {
        #[arg(value_enum)]
        service: ServiceArg,
        port: u32,
    },
    /// Return a service to its default port
    Reset {
        #[arg(value_enum)]
        service: ServiceArg,
    },
    /// Print a random free high port for a service
    Suggest {
        #[arg(value_enum)]
        service: ServiceArg,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeArg {
    K3s,
    Docker,
}

impl From<RuntimeArg> for ContainerRuntime {
    fn from(arg: RuntimeArg) -> Self {
        match arg {
            RuntimeArg::K3s => ContainerRuntime::K3s,
            RuntimeArg::Docker => ContainerRuntime::Docker,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntrusionArg {
    Fail2ban,
    Sshguard,
}

impl From<IntrusionArg> for IntrusionPrevention {
    fn from(arg: IntrusionArg) -> Self {
        match arg {
            IntrusionArg::Fail2ban => IntrusionPrevention::Fail2ban,
            IntrusionArg::Sshguard => IntrusionPrevention::Sshguard,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RootLoginArg {
    No,
    ProhibitPassword,
}

impl From<RootLoginArg> for RootLoginPolicy {
    fn from(arg: RootLoginArg) -> Self {
        match arg {
            RootLoginArg::No => RootLoginPolicy::No,
            RootLoginArg::ProhibitPassword => RootLoginPolicy::ProhibitPassword,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceArg {
    Ssh,
    KubeApi,
}

impl From<ServiceArg> for Service {
    fn from(arg: ServiceArg) -> Self {
        match arg {
            ServiceArg::Ssh => Service::Ssh,
            ServiceArg::KubeApi => Service::KubeApi,
        }
    }
}
