// file: src/stages/container_runtime.rs
// version: 1.0.0
// guid: aaf3c68d-6545-4709-9f21-1bb6dd9e0b5b

//! k3s or Docker installation

use super::{install_missing, StageOutput, StagePreview};
use crate::config::ContainerRuntime;
use crate::context::OrchestratorContext;
use crate::probe::{package_installed, path_exists, unit_active};
use crate::runner::{ensure_file, run_checked};
use crate::Result;
use serde::Serialize;
use tracing::{debug, info};

const K3S_INSTALL_SCRIPT: &str = "curl -sfL https://get.k3s.io | sh -";
const DOCKER_PACKAGE: &str = "docker.io";

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct K3sConfig {
    https_listen_port: u16,
    write_kubeconfig_mode: String,
}

/// Contents of `/etc/rancher/k3s/config.yaml` for the assigned API port
pub fn k3s_config(api_port: u16) -> Result<String> {
    let config = K3sConfig {
        https_listen_port: api_port,
        write_kubeconfig_mode: "0600".to_string(),
    };
    Ok(serde_yaml::to_string(&config)?)
}

pub async fn is_satisfied(ctx: &OrchestratorContext) -> Result<bool> {
    let runner = ctx.runner();
    match ctx.runtime {
        ContainerRuntime::K3s => {
            let wanted = k3s_config(ctx.api_port())?;
            let current = runner.read_file(&ctx.paths.k3s_config).await?;
            if current.as_deref() != Some(wanted.as_str()) {
                debug!("k3s config differs from the assigned API port");
                return Ok(false);
            }
            Ok(path_exists(runner, &ctx.paths.k3s_binary).await && unit_active(runner, "k3s").await)
        }
        ContainerRuntime::Docker => Ok(package_installed(runner, DOCKER_PACKAGE).await
            && unit_active(runner, "docker").await),
    }
}

pub async fn apply(ctx: &OrchestratorContext) -> Result<StageOutput> {
    let runner = ctx.runner();
    match ctx.runtime {
        ContainerRuntime::K3s => {
            let config = k3s_config(ctx.api_port())?;
            let changed = ensure_file(runner, &ctx.paths.k3s_config, &config, 0o600).await?;

            if !path_exists(runner, &ctx.paths.k3s_binary).await {
                info!("Installing k3s with API on port {}", ctx.api_port());
                run_checked(runner, &["sh", "-c", K3S_INSTALL_SCRIPT]).await?;
                return Ok(StageOutput::verified(format!(
                    "k3s installed, API on {}",
                    ctx.api_port()
                )));
            }

            if changed || !unit_active(runner, "k3s").await {
                info!("Restarting k3s to apply API port {}", ctx.api_port());
                run_checked(runner, &["systemctl", "restart", "k3s"]).await?;
            }
            Ok(StageOutput::verified(format!("k3s running, API on {}", ctx.api_port())))
        }
        ContainerRuntime::Docker => {
            install_missing(runner, &[DOCKER_PACKAGE]).await?;
            run_checked(runner, &["systemctl", "enable", "--now", "docker"]).await?;
            Ok(StageOutput::verified("docker running"))
        }
    }
}

pub fn preview(ctx: &OrchestratorContext) -> StagePreview {
    match ctx.runtime {
        ContainerRuntime::K3s => StagePreview::default()
            .file(&ctx.paths.k3s_config)
            .service("k3s")
            .command(format!("sh -c '{}'", K3S_INSTALL_SCRIPT)),
        ContainerRuntime::Docker => StagePreview::default()
            .service("docker")
            .command(format!("apt-get install -y {}", DOCKER_PACKAGE))
            .command("systemctl enable --now docker"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::FakeHost;
    use crate::test_support::{custom_ports_context, fake_context};
    use std::sync::Arc;

    #[test]
    fn test_k3s_config_yaml() {
        let yaml = k3s_config(16443).unwrap();
        assert!(yaml.contains("https-listen-port: 16443"));
        assert!(yaml.contains("write-kubeconfig-mode"));
    }

    #[tokio::test]
    async fn test_k3s_installs_on_custom_port() {
        let host = Arc::new(FakeHost::fresh_ubuntu());
        let (ctx, _dir) = custom_ports_context(host.clone());

        apply(&ctx).await.unwrap();
        let state = host.snapshot();
        assert_eq!(state.listening.get(&16443).map(String::as_str), Some("k3s-server"));
        assert_eq!(host.file_mode("/etc/rancher/k3s/config.yaml"), Some(0o600));
        assert!(is_satisfied(&ctx).await.unwrap());

        host.clear_history();
        apply(&ctx).await.unwrap();
        assert!(!host.history().iter().any(|c| c.contains("get.k3s.io")));
        assert!(!host.history().iter().any(|c| c.contains("restart")));
    }

    #[tokio::test]
    async fn test_docker_runtime() {
        let host = Arc::new(FakeHost::fresh_ubuntu());
        let (ctx, _dir) = fake_context(host.clone());
        let ctx = ctx.with_runtime(ContainerRuntime::Docker);

        assert!(!is_satisfied(&ctx).await.unwrap());
        apply(&ctx).await.unwrap();
        assert!(host.snapshot().active_units.contains("docker"));
        assert!(is_satisfied(&ctx).await.unwrap());
    }
}
