// file: src/cli/commands.rs
// version: 2.0.0
// guid: 77ab6352-e027-4a7f-8a5e-61a20f0463c3

//! Command implementations for the CLI

use super::args::{PortsAction, ProfileArgs, SetupArgs};
use super::prompt::{ask_stdin, confirm_stdin};
use crate::{
    config::{
        loader::ConfigLoader, parse_key_lines, AdminIdentity, IdentityProfile, PortsProfile,
        ProxySettings, RunOptions, SetupProfile,
    },
    context::OrchestratorContext,
    logging::with_run_span,
    orchestrator::{Orchestrator, RunSummary},
    ports::{PortRegistry, Service, SocketProbe},
    recovery::{hardening_instructions, recovery_instructions},
    runner::LocalRunner,
    steps::StepStatus,
    utils::system::SystemUtils,
    validation::{pre_checks, Phase, ValidationGate},
    Result, SetupError,
};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Layer the CLI flags over the optional `--config` profile
pub fn build_profile(args: &ProfileArgs) -> Result<SetupProfile> {
    let base = match &args.config {
        Some(path) => ConfigLoader::new().load_profile(path)?,
        None => SetupProfile::default(),
    };

    let recovery = if args.recovery_user.is_some() || !args.recovery_keys.is_empty() {
        Some(IdentityProfile {
            username: args.recovery_user.clone(),
            authorized_keys: args.recovery_keys.clone(),
            key_file: None,
        })
    } else {
        None
    };

    let flags = SetupProfile {
        admin: IdentityProfile {
            username: args.admin_user.clone(),
            authorized_keys: args.admin_keys.clone(),
            key_file: args.admin_key_file.clone(),
        },
        recovery,
        ports: PortsProfile {
            ssh: args.ssh_port,
            kube_api: args.api_port,
        },
        runtime: args.runtime.map(Into::into),
        intrusion: args.intrusion.map(Into::into),
        proxy: args
            .domain
            .clone()
            .map(|domain| ProxySettings::new(domain, args.email.clone())),
        permit_root_login: args.permit_root_login.map(Into::into),
    };

    let profile = base.overlay(flags);
    profile.validate()?;
    Ok(profile)
}

/// Requested allocations, in canonical service order
pub fn port_requests(profile: &SetupProfile) -> Vec<(Service, u32)> {
    [
        (Service::Ssh, profile.ports.ssh),
        (Service::KubeApi, profile.ports.kube_api),
    ]
    .into_iter()
    .filter_map(|(service, port)| port.map(|p| (service, p)))
    .collect()
}

fn has_keys(identity: &IdentityProfile) -> bool {
    !identity.authorized_keys.is_empty() || identity.key_file.is_some()
}

/// Fill in the admin identity and ports interactively
fn prompt_missing(profile: &mut SetupProfile, registry: &PortRegistry, report_only: bool) -> Result<()> {
    if profile.admin.username.is_none() {
        profile.admin.username = Some(ask_stdin("Admin user", None)?);
    }
    if report_only {
        return Ok(());
    }
    if !has_keys(&profile.admin) {
        let key = ask_stdin("Admin SSH public key", None)?;
        profile.admin.authorized_keys = parse_key_lines(&key);
    }
    if profile.ports.ssh.is_none() {
        let suggested = registry.suggest(Service::Ssh, &SocketProbe);
        println!(
            "Current SSH port is {}; {} is free if you want a new one.",
            registry.port(Service::Ssh),
            suggested
        );
        let current = registry.port(Service::Ssh).to_string();
        let answer = ask_stdin("SSH port", Some(&current))?;
        let port = answer
            .parse::<u32>()
            .map_err(|_| SetupError::config(format!("Invalid port: {}", answer)))?;
        profile.ports.ssh = Some(port);
    }
    profile.validate()
}

/// Wait for SIGINT or SIGTERM and name the signal
pub async fn shutdown_signal() -> String {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "SIGINT".to_string(),
            Err(e) => {
                warn!("Cannot listen for Ctrl+C: {}", e);
                std::future::pending::<String>().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                "SIGTERM".to_string()
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<String>().await
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<String>();

    tokio::select! {
        name = ctrl_c => name,
        name = terminate => name,
    }
}

fn require_live_prerequisites() -> Result<()> {
    if !SystemUtils::is_root() {
        return Err(SetupError::config(
            "Live runs must be started as root; use --dry-run to preview",
        ));
    }
    let missing = SystemUtils::check_prerequisites();
    if !missing.is_empty() {
        return Err(SetupError::config(format!(
            "Required tools not found: {}",
            missing.join(", ")
        )));
    }
    Ok(())
}

/// Provision the host and harden SSH; returns the process exit code
pub async fn setup_command(args: SetupArgs, log_file: Option<PathBuf>) -> Result<i32> {
    let mut profile = build_profile(&args.profile)?;
    let registry = PortRegistry::load_or_default(&args.profile.ports_file)?;

    let missing_admin = profile.admin.username.is_none()
        || (!args.report_only && !has_keys(&profile.admin));
    if missing_admin {
        if args.yes {
            return Err(SetupError::validation(
                "--yes requires --admin-user and --admin-key (or --admin-key-file)",
            ));
        }
        prompt_missing(&mut profile, &registry, args.report_only)?;
    }

    if !args.dry_run {
        require_live_prerequisites()?;
    }

    let admin = match profile.admin.resolve()? {
        Some(admin) => admin,
        None => return Err(SetupError::validation("An admin user is required")),
    };
    let recovery = profile.resolve_recovery(&admin)?;
    let options = RunOptions {
        dry_run: args.dry_run,
        assume_yes: args.yes,
        report_only: args.report_only,
        json: args.json,
    };

    let mut ctx = OrchestratorContext::new(admin, registry, Arc::new(LocalRunner::new()))
        .with_options(options)
        .with_recovery(recovery)
        .with_runtime(profile.runtime.unwrap_or_default())
        .with_intrusion(profile.intrusion.unwrap_or_default())
        .with_proxy(profile.proxy.clone())
        .with_root_login(profile.permit_root_login.unwrap_or_default());
    if let Some(path) = log_file {
        ctx.paths.log_file = path;
    }

    let requests = port_requests(&profile);
    if !args.dry_run && !args.yes && !args.report_only {
        print_plan(&ctx, &requests);
        if !confirm_stdin("Proceed with provisioning this host?")? {
            println!("Aborted; nothing was changed.");
            return Ok(1);
        }
    }

    let run_id = ctx.run_id.to_string();
    let mut orchestrator = Orchestrator::new(ctx).with_port_requests(requests);
    let outcome = with_run_span("setup", &run_id, || orchestrator.run_until(shutdown_signal())).await;

    match outcome {
        Ok(summary) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
            if summary.hardening_unverified {
                eprintln!("{}", "CRITICAL: SSH hardening could not be verified".red().bold());
                for line in hardening_instructions(orchestrator.context()) {
                    eprintln!("  {}", line.red());
                }
            }
            Ok(summary.exit_code())
        }
        Err(e) => {
            if let Some(bundle) = orchestrator.bundle_path() {
                eprintln!("Diagnostic bundle: {}", bundle.display().to_string().yellow());
            }
            eprintln!("{}", "Recovery:".bold());
            for line in recovery_instructions(&e, orchestrator.context()) {
                eprintln!("  {}", line);
            }
            Err(e)
        }
    }
}

fn print_plan(ctx: &OrchestratorContext, requests: &[(Service, u32)]) {
    println!("{}", "Planned configuration".bold());
    println!("  admin user:   {}", ctx.admin.username);
    if let Some(recovery) = &ctx.recovery {
        println!("  recovery:     {}", recovery.username);
    }
    for service in Service::ALL {
        let port = requests
            .iter()
            .find(|(s, _)| *s == service)
            .map(|(_, p)| *p)
            .unwrap_or_else(|| u32::from(ctx.registry.port(service)));
        println!("  {:<13} {}", format!("{}:", service), port);
    }
    println!("  runtime:      {}", ctx.runtime.as_str());
    println!("  intrusion:    {}", ctx.intrusion.as_str());
    if let Some(proxy) = &ctx.proxy {
        println!("  domain:       {}", proxy.domain);
    }
    println!("  root login:   {}", ctx.root_login);
    println!("Password authentication will be disabled once the new SSH port is confirmed.");
}

fn print_summary(summary: &RunSummary) {
    for result in &summary.results {
        let label = match result.status {
            StepStatus::Applied => result.status.label().green(),
            StepStatus::AlreadyConfigured => result.status.label().dimmed(),
            StepStatus::Previewed => result.status.label().cyan(),
            StepStatus::AppliedUnverified => result.status.label().yellow(),
            StepStatus::Failed => result.status.label().red(),
        };
        println!("{:<22} {}", result.stage.name(), label);
        if result.status == StepStatus::Previewed {
            print!("{}", result.output);
        }
    }
    for warning in &summary.warnings {
        println!("{} {}", "warning:".yellow(), warning);
    }
    if let Some(path) = &summary.report_path {
        println!("Report: {}", path.display());
    }
    if summary.dry_run {
        println!("{}", "Dry run: no changes were made.".cyan());
    }
}

/// Run the pre-install gate and report the outcome
pub async fn check_command(args: ProfileArgs) -> Result<()> {
    let profile = build_profile(&args)?;
    let mut registry = PortRegistry::load_or_default(&args.ports_file)?;
    for (service, port) in port_requests(&profile) {
        registry
            .allocate(service, port, &SocketProbe)
            .map_err(|e| SetupError::validation(e.to_string()))?;
    }

    let username = profile.admin.username.clone().unwrap_or_else(|| "admin".to_string());
    let ctx = OrchestratorContext::new(
        AdminIdentity::new(username, Vec::new()),
        registry,
        Arc::new(LocalRunner::new()),
    )
    .with_options(RunOptions {
        dry_run: true,
        ..RunOptions::default()
    })
    .with_runtime(profile.runtime.unwrap_or_default())
    .with_proxy(profile.proxy.clone());

    let checks = pre_checks(&ctx);
    let result = ValidationGate::new(&ctx).run(Phase::Pre, &checks).await;
    for warning in &result.warnings {
        println!("{} {}", "warning:".yellow(), warning);
    }
    match result.fatal {
        Some(fatal) => {
            println!("{} {}", "FAIL".red().bold(), fatal);
            Err(SetupError::validation(fatal))
        }
        None => {
            println!("{} {} pre-install checks passed", "OK".green().bold(), checks.len());
            Ok(())
        }
    }
}

/// `ports list|set|reset|suggest`
pub fn ports_command(action: PortsAction, ports_file: &Path) -> Result<()> {
    let mut registry = PortRegistry::load_or_default(ports_file)?;
    for repair in registry.repairs() {
        warn!(
            "{} was '{}', using {} ({})",
            repair.service, repair.previous, repair.port, repair.reason
        );
    }

    match action {
        PortsAction::List { json } => {
            let assignments: Vec<_> = registry.assignments().cloned().collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&assignments)?);
            } else {
                println!("{:<10} {:<6} {}", "SERVICE", "PORT", "DESCRIPTION");
                for a in &assignments {
                    let note = if a.is_privileged() { " (privileged)" } else { "" };
                    println!("{:<10} {:<6} {}{}", a.service.name(), a.port, a.description, note);
                }
            }
        }
        PortsAction::Set { service, port } => {
            let service = Service::from(service);
            let allocation = registry.allocate(service, port, &SocketProbe)?;
            for warning in &allocation.warnings {
                println!("{} {}", "warning:".yellow(), warning);
            }
            registry.persist()?;
            info!("{} set to {}", service, allocation.assignment.port);
            println!(
                "{} -> {} (run `container-host-setup setup` to apply)",
                service, allocation.assignment.port
            );
        }
        PortsAction::Reset { service } => {
            let service = Service::from(service);
            let allocation = registry.reset(service, &SocketProbe)?;
            registry.persist()?;
            println!("{} -> {}", service, allocation.assignment.port);
        }
        PortsAction::Suggest { service } => {
            println!("{}", registry.suggest(Service::from(service), &SocketProbe));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::args::RuntimeArg;
    use crate::config::ContainerRuntime;
    use crate::test_support::KEY;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn args() -> ProfileArgs {
        ProfileArgs {
            admin_user: Some("ops".into()),
            admin_keys: vec![KEY.into()],
            ..ProfileArgs::default()
        }
    }

    #[test]
    fn test_flags_override_profile_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "admin:\n  username: deploy\nports:\n  ssh: 2200\nruntime: docker").unwrap();

        let mut flags = args();
        flags.config = Some(file.path().to_path_buf());
        flags.ssh_port = Some(2222);
        flags.runtime = Some(RuntimeArg::K3s);

        let profile = build_profile(&flags).unwrap();
        assert_eq!(profile.admin.username.as_deref(), Some("ops"));
        assert_eq!(profile.ports.ssh, Some(2222));
        assert_eq!(profile.runtime, Some(ContainerRuntime::K3s));
        assert_eq!(port_requests(&profile), vec![(Service::Ssh, 2222)]);
    }

    #[test]
    fn test_shared_port_is_rejected() {
        let mut flags = args();
        flags.ssh_port = Some(6443);
        flags.api_port = Some(6443);
        assert!(build_profile(&flags).is_err());
    }

    #[tokio::test]
    async fn test_yes_without_admin_is_validation_error() {
        let dir = TempDir::new().unwrap();
        let setup = SetupArgs {
            profile: ProfileArgs {
                ports_file: dir.path().join("ports.conf"),
                ..ProfileArgs::default()
            },
            dry_run: true,
            yes: true,
            report_only: false,
            json: false,
        };
        let err = setup_command(setup, None).await.unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_ports_set_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ports.conf");
        ports_command(
            PortsAction::Set {
                service: crate::cli::args::ServiceArg::Ssh,
                port: 2222,
            },
            &path,
        )
        .unwrap();

        let registry = PortRegistry::load(&path).unwrap().unwrap();
        assert_eq!(registry.port(Service::Ssh), 2222);
        assert_eq!(registry.port(Service::KubeApi), 6443);
    }
}
