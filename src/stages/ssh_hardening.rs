// file: src/stages/ssh_hardening.rs
// version: 1.1.0
// guid: c649ae83-c05a-44b0-a652-3f76191dbc6b

//! Terminal stage: key-only SSH on the assigned port
//!
//! The drop-in is validated with `sshd -t` before the daemon is touched and
//! the previous drop-in is restored when validation fails. After the restart
//! the new port is polled with bounded retries; a restart that never shows
//! a listener is reported as unverified rather than failed so the operator
//! gets recovery instructions instead of an automatic cleanup.

use super::{StageOutput, StagePreview};
use crate::config::{parse_key_lines, RootLoginPolicy};
use crate::context::OrchestratorContext;
use crate::probe::{active_ssh_unit, ssh_listening_ports, unit_active};
use crate::runner::{display_command, run_checked, CommandRunner};
use crate::{Result, SetupError};
use std::path::Path;
use tracing::{debug, error, info, warn};

pub fn dropin_contents(port: u16, root_login: RootLoginPolicy) -> String {
    format!(
        "# Managed by container-host-setup\n\
         Port {}\n\
         PermitRootLogin {}\n\
         PasswordAuthentication no\n\
         KbdInteractiveAuthentication no\n\
         PubkeyAuthentication yes\n",
        port,
        root_login.as_sshd_value()
    )
}

pub async fn is_satisfied(ctx: &OrchestratorContext) -> Result<bool> {
    let runner = ctx.runner();
    let wanted = dropin_contents(ctx.ssh_port(), ctx.root_login);
    if runner.read_file(&ctx.paths.ssh_dropin).await?.as_deref() != Some(wanted.as_str()) {
        return Ok(false);
    }
    Ok(active_ssh_unit(runner).await.is_some()
        && ssh_listening_ports(runner).await.contains(&ctx.ssh_port()))
}

/// Put back whatever drop-in existed before this run
async fn restore(runner: &dyn CommandRunner, path: &Path, previous: Option<&str>) -> Result<()> {
    match previous {
        Some(contents) => runner.write_file(path, contents, 0o644).await,
        None => runner.remove_file(path).await,
    }
}

async fn wait_for_listener(ctx: &OrchestratorContext, port: u16) -> bool {
    let runner = ctx.runner();
    for attempt in 1..=ctx.retry.attempts {
        if ssh_listening_ports(runner).await.contains(&port) {
            debug!("sshd listening on {} after {} attempt(s)", port, attempt);
            return true;
        }
        runner.sleep(ctx.retry.interval).await;
    }
    ssh_listening_ports(runner).await.contains(&port)
}

pub async fn apply(ctx: &OrchestratorContext) -> Result<StageOutput> {
    let runner = ctx.runner();
    let port = ctx.ssh_port();

    // Password logins are about to go away; a key must already be in place
    let keys_path = ctx.admin.authorized_keys_path();
    let keys = runner.read_file(&keys_path).await?.unwrap_or_default();
    if parse_key_lines(&keys).is_empty() {
        return Err(SetupError::postcondition(format!(
            "refusing to disable password authentication: {} has no keys",
            keys_path.display()
        )));
    }

    let dropin = &ctx.paths.ssh_dropin;
    let backup = ctx.paths.ssh_dropin_backup();
    let wanted = dropin_contents(port, ctx.root_login);
    let previous = runner.read_file(dropin).await?;
    if previous.as_deref() != Some(wanted.as_str()) {
        // An empty backup stands for "no drop-in"
        runner
            .write_file(&backup, previous.as_deref().unwrap_or_default(), 0o600)
            .await?;
        runner.write_file(dropin, &wanted, 0o644).await?;
        if let Err(e) = run_checked(runner, &["sshd", "-t"]).await {
            error!("sshd rejected the new configuration, restoring previous drop-in");
            restore(runner, dropin, previous.as_deref()).await?;
            runner.remove_file(&backup).await?;
            return Err(e);
        }
    } else {
        runner.remove_file(&backup).await?;
    }

    if unit_active(runner, "ssh.socket").await {
        info!("Disabling ssh.socket activation so the Port directive applies");
        run_checked(runner, &["systemctl", "disable", "--now", "ssh.socket"]).await?;
        run_checked(runner, &["systemctl", "enable", "ssh"]).await?;
    }

    let unit = active_ssh_unit(runner).await.unwrap_or("ssh");
    let restart = ["systemctl", "restart", unit];
    let output = runner.run(&restart).await?;
    // Once the restart was attempted the drop-in is the operator's to revert
    runner.remove_file(&backup).await?;
    if !output.success() {
        warn!("{} exited with {}", display_command(&restart), output.exit_code);
        return Ok(StageOutput::unverified(format!(
            "`{}` failed ({}): {}",
            display_command(&restart),
            output.exit_code,
            output.error_text()
        )));
    }

    if wait_for_listener(ctx, port).await {
        info!("sshd is listening on port {}", port);
        Ok(StageOutput::verified(format!(
            "sshd on {} with PermitRootLogin {}",
            port, ctx.root_login
        )))
    } else {
        Ok(StageOutput::unverified(format!(
            "{} restarted but nothing listens on port {} after {} attempts",
            unit, port, ctx.retry.attempts
        )))
    }
}

/// Put back the drop-in an unfinished attempt replaced. The daemon is not
/// touched. Returns whether anything was restored.
pub async fn rollback_dropin(ctx: &OrchestratorContext) -> Result<bool> {
    let runner = ctx.runner();
    let backup = ctx.paths.ssh_dropin_backup();
    let Some(previous) = runner.read_file(&backup).await? else {
        return Ok(false);
    };
    let previous = Some(previous.as_str()).filter(|p| !p.is_empty());
    restore(runner, &ctx.paths.ssh_dropin, previous).await?;
    runner.remove_file(&backup).await?;
    info!("Restored the SSH drop-in from before this run");
    Ok(true)
}

/// Names the unit `apply` would restart and the socket it would disable
pub async fn preview(ctx: &OrchestratorContext) -> StagePreview {
    let runner = ctx.runner();
    let mut preview = StagePreview::default()
        .file(&ctx.paths.ssh_dropin)
        .command("sshd -t");
    if unit_active(runner, "ssh.socket").await {
        preview = preview
            .command("systemctl disable --now ssh.socket")
            .command("systemctl enable ssh");
    }
    let unit = active_ssh_unit(runner).await.unwrap_or("ssh");
    preview
        .service(unit)
        .command(format!("systemctl restart {}", unit))
}
