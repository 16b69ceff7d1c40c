// file: src/stages/firewall.rs
// version: 1.1.0
// guid: 2a953871-4ce5-4082-808f-3cc51ab50916

//! ufw rules: deny inbound by default, keep every access path open

use super::{StageOutput, StagePreview};
use crate::config::ContainerRuntime;
use crate::context::OrchestratorContext;
use crate::probe::{firewall_status, ssh_listening_ports};
use crate::runner::run_checked;
use crate::Result;
use tracing::info;

/// Allow rules this run needs, stock SSH port first
pub fn required_rules(ctx: &OrchestratorContext) -> Vec<String> {
    build_rules(ctx, &[])
}

/// [`required_rules`] plus every port sshd listens on right now, so enabling
/// ufw never closes a live SSH session
pub async fn host_rules(ctx: &OrchestratorContext) -> Vec<String> {
    let live: Vec<u16> = ssh_listening_ports(ctx.runner()).await.into_iter().collect();
    build_rules(ctx, &live)
}

fn build_rules(ctx: &OrchestratorContext, live_ssh: &[u16]) -> Vec<String> {
    let mut rules = vec!["22/tcp".to_string(), format!("{}/tcp", ctx.ssh_port())];
    rules.extend(live_ssh.iter().map(|port| format!("{}/tcp", port)));
    if ctx.runtime == ContainerRuntime::K3s {
        rules.push(format!("{}/tcp", ctx.api_port()));
    }
    if ctx.proxy.is_some() {
        rules.push("80/tcp".to_string());
        rules.push("443/tcp".to_string());
    }
    let mut seen = Vec::new();
    rules.retain(|r| {
        if seen.contains(r) {
            false
        } else {
            seen.push(r.clone());
            true
        }
    });
    rules
}

pub async fn is_satisfied(ctx: &OrchestratorContext) -> Result<bool> {
    let status = firewall_status(ctx.runner()).await;
    let rules = host_rules(ctx).await;
    Ok(status.active && rules.iter().all(|r| status.allows(r)))
}

pub async fn apply(ctx: &OrchestratorContext) -> Result<StageOutput> {
    let runner = ctx.runner();
    let status = firewall_status(runner).await;

    run_checked(runner, &["ufw", "default", "deny", "incoming"]).await?;
    run_checked(runner, &["ufw", "default", "allow", "outgoing"]).await?;

    let mut added = Vec::new();
    for rule in host_rules(ctx).await {
        if status.allows(&rule) {
            continue;
        }
        run_checked(runner, &["ufw", "allow", &rule]).await?;
        added.push(rule);
    }

    if !status.active {
        info!("Enabling ufw");
        run_checked(runner, &["ufw", "--force", "enable"]).await?;
    }

    Ok(StageOutput::verified(if added.is_empty() {
        "firewall active".to_string()
    } else {
        format!("firewall active; allowed {}", added.join(" "))
    }))
}

pub async fn preview(ctx: &OrchestratorContext) -> StagePreview {
    let mut preview = StagePreview::default()
        .command("ufw default deny incoming")
        .command("ufw default allow outgoing");
    for rule in host_rules(ctx).await {
        preview = preview.command(format!("ufw allow {}", rule));
    }
    preview.command("ufw --force enable")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxySettings;
    use crate::runner::FakeHost;
    use crate::test_support::{custom_ports_context, fake_context};
    use std::sync::Arc;

    #[test]
    fn test_rules_deduplicate_default_port() {
        let host = Arc::new(FakeHost::fresh_ubuntu());
        let (ctx, _dir) = fake_context(host);
        assert_eq!(required_rules(&ctx), vec!["22/tcp", "6443/tcp"]);

        let ctx = ctx
            .with_runtime(ContainerRuntime::Docker)
            .with_proxy(Some(ProxySettings::new("example.com", None)));
        assert_eq!(required_rules(&ctx), vec!["22/tcp", "80/tcp", "443/tcp"]);
    }

    #[tokio::test]
    async fn test_firewall_rules_added_once() {
        let host = Arc::new(FakeHost::fresh_ubuntu());
        let (ctx, _dir) = custom_ports_context(host.clone());

        apply(&ctx).await.unwrap();
        let state = host.snapshot();
        assert!(state.firewall_active);
        assert_eq!(state.firewall_rules, vec!["22/tcp", "2222/tcp", "16443/tcp"]);
        assert!(is_satisfied(&ctx).await.unwrap());

        host.clear_history();
        apply(&ctx).await.unwrap();
        assert!(!host.history().iter().any(|c| c.starts_with("ufw allow")));
        assert!(!host.history().iter().any(|c| c.contains("enable")));
    }

    #[tokio::test]
    async fn test_live_sshd_port_stays_open() {
        let host = Arc::new(FakeHost::fresh_ubuntu());
        host.with_state(|s| {
            s.listening.remove(&22);
            s.listening.insert(2200, "sshd".to_string());
        });
        let (ctx, _dir) = custom_ports_context(host.clone());

        assert!(preview(&ctx).await.commands.contains(&"ufw allow 2200/tcp".to_string()));
        apply(&ctx).await.unwrap();
        assert_eq!(
            host.snapshot().firewall_rules,
            vec!["22/tcp", "2222/tcp", "2200/tcp", "16443/tcp"]
        );
        assert!(is_satisfied(&ctx).await.unwrap());
    }
}
