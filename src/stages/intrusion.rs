// file: src/stages/intrusion.rs
// version: 1.0.0
// guid: e2f2ae49-fa0a-4fad-83b8-ceba7c5e54e7

//! Fail2Ban or SSHGuard

use super::{install_missing, packages_installed, StageOutput, StagePreview};
use crate::config::IntrusionPrevention;
use crate::context::OrchestratorContext;
use crate::probe::unit_active;
use crate::runner::{ensure_file, run_checked};
use crate::Result;

/// Jail covering the stock SSH port and the assigned one
pub fn fail2ban_jail(ssh_port: u16) -> String {
    let ports = if ssh_port == 22 {
        "ssh".to_string()
    } else {
        format!("ssh,{}", ssh_port)
    };
    format!(
        "# Managed by container-host-setup\n\
         [sshd]\n\
         enabled = true\n\
         port = {}\n\
         backend = systemd\n\
         maxretry = 5\n\
         findtime = 10m\n\
         bantime = 1h\n",
        ports
    )
}

pub async fn is_satisfied(ctx: &OrchestratorContext) -> Result<bool> {
    let runner = ctx.runner();
    let unit = ctx.intrusion.unit();
    if !packages_installed(runner, &[unit]).await || !unit_active(runner, unit).await {
        return Ok(false);
    }
    match ctx.intrusion {
        IntrusionPrevention::Fail2ban => {
            let jail = runner.read_file(&ctx.paths.fail2ban_jail).await?;
            Ok(jail.as_deref() == Some(fail2ban_jail(ctx.ssh_port()).as_str()))
        }
        IntrusionPrevention::Sshguard => Ok(true),
    }
}

pub async fn apply(ctx: &OrchestratorContext) -> Result<StageOutput> {
    let runner = ctx.runner();
    let unit = ctx.intrusion.unit();
    install_missing(runner, &[unit]).await?;

    let jail_changed = match ctx.intrusion {
        IntrusionPrevention::Fail2ban => {
            ensure_file(
                runner,
                &ctx.paths.fail2ban_jail,
                &fail2ban_jail(ctx.ssh_port()),
                0o644,
            )
            .await?
        }
        IntrusionPrevention::Sshguard => false,
    };

    run_checked(runner, &["systemctl", "enable", "--now", unit]).await?;
    if jail_changed {
        run_checked(runner, &["systemctl", "restart", unit]).await?;
    }
    Ok(StageOutput::verified(format!("{} active", unit)))
}

pub fn preview(ctx: &OrchestratorContext) -> StagePreview {
    let unit = ctx.intrusion.unit();
    let preview = StagePreview::default()
        .service(unit)
        .command(format!("apt-get install -y {}", unit))
        .command(format!("systemctl enable --now {}", unit));
    match ctx.intrusion {
        IntrusionPrevention::Fail2ban => preview.file(&ctx.paths.fail2ban_jail),
        IntrusionPrevention::Sshguard => preview,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::FakeHost;
    use crate::test_support::{custom_ports_context, fake_context};
    use std::sync::Arc;

    #[test]
    fn test_jail_covers_both_ports() {
        assert!(fail2ban_jail(2222).contains("port = ssh,2222\n"));
        assert!(fail2ban_jail(22).contains("port = ssh\n"));
    }

    #[tokio::test]
    async fn test_fail2ban_jail_tracks_ssh_port() {
        let host = Arc::new(FakeHost::fresh_ubuntu());
        let (ctx, _dir) = custom_ports_context(host.clone());

        apply(&ctx).await.unwrap();
        assert!(host.snapshot().active_units.contains("fail2ban"));
        assert!(is_satisfied(&ctx).await.unwrap());

        let (ctx22, _dir22) = fake_context(host.clone());
        assert!(!is_satisfied(&ctx22).await.unwrap());
    }

    #[tokio::test]
    async fn test_sshguard_install() {
        let host = Arc::new(FakeHost::fresh_ubuntu());
        let (ctx, _dir) = fake_context(host.clone());
        let ctx = ctx.with_intrusion(IntrusionPrevention::Sshguard);

        apply(&ctx).await.unwrap();
        assert!(is_satisfied(&ctx).await.unwrap());
        assert!(host.file("/etc/fail2ban/jail.d/container-host-setup.local").is_none());
    }
}
