// file: src/stages/system_update.rs
// version: 1.0.0
// guid: 337818f8-1fda-43e8-b0fa-d28cda1aaa6c

//! Package index refresh, upgrade and baseline packages

use super::{install_missing, packages_installed, StageOutput, StagePreview};
use crate::context::OrchestratorContext;
use crate::runner::run_checked;
use crate::Result;
use tracing::info;

/// Packages every later stage relies on
pub const BASELINE_PACKAGES: [&str; 4] = ["openssh-server", "ufw", "curl", "ca-certificates"];

pub async fn is_satisfied(ctx: &OrchestratorContext) -> Result<bool> {
    let runner = ctx.runner();
    let stamped = runner.read_file(&ctx.paths.update_stamp()).await?.is_some();
    Ok(stamped && packages_installed(runner, &BASELINE_PACKAGES).await)
}

pub async fn apply(ctx: &OrchestratorContext) -> Result<StageOutput> {
    let runner = ctx.runner();
    info!("Refreshing package index and upgrading installed packages");
    run_checked(runner, &["apt-get", "update"]).await?;
    run_checked(runner, &["apt-get", "-y", "upgrade"]).await?;
    let installed = install_missing(runner, &BASELINE_PACKAGES).await?;

    let stamp = format!("updated {}\n", chrono::Utc::now().to_rfc3339());
    runner
        .write_file(&ctx.paths.update_stamp(), &stamp, 0o644)
        .await?;

    Ok(StageOutput::verified(if installed.is_empty() {
        "packages upgraded".to_string()
    } else {
        format!("packages upgraded; installed {}", installed.join(" "))
    }))
}

pub fn preview(ctx: &OrchestratorContext) -> StagePreview {
    StagePreview::default()
        .file(ctx.paths.update_stamp())
        .command("apt-get update")
        .command("apt-get -y upgrade")
        .command(format!("apt-get install -y {}", BASELINE_PACKAGES.join(" ")))
}
