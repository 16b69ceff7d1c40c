// file: src/stages/admin_users.rs
// version: 1.0.0
// guid: d7692118-71f9-4fbe-b61b-553bef226833

//! Admin and recovery accounts with key-only access and sudo

use super::{StageOutput, StagePreview};
use crate::config::{parse_key_lines, AdminIdentity};
use crate::context::OrchestratorContext;
use crate::probe::{user_exists, user_groups};
use crate::runner::{display_command, run_checked, CommandRunner};
use crate::{Result, SetupError};
use std::path::Path;
use tracing::{debug, info, warn};

/// Passwordless sudo so key-only admins keep privilege escalation
pub fn sudoers_entry(username: &str) -> String {
    format!(
        "# Managed by container-host-setup\n{} ALL=(ALL:ALL) NOPASSWD: ALL\n",
        username
    )
}

/// Existing keys followed by any wanted key not yet present
pub fn merge_keys(existing: Option<&str>, wanted: &[String]) -> String {
    let mut keys = existing.map(parse_key_lines).unwrap_or_default();
    for key in wanted {
        let key = key.trim();
        if !keys.iter().any(|k| k == key) {
            keys.push(key.to_string());
        }
    }
    let mut out = keys.join("\n");
    out.push('\n');
    out
}

async fn identity_satisfied(ctx: &OrchestratorContext, identity: &AdminIdentity) -> Result<bool> {
    let runner = ctx.runner();
    if !user_exists(runner, &identity.username).await {
        return Ok(false);
    }
    let groups = user_groups(runner, &identity.username).await;
    if identity.groups.iter().any(|g| !groups.contains(g)) {
        return Ok(false);
    }

    let existing = runner.read_file(&identity.authorized_keys_path()).await?;
    let present = existing.as_deref().map(parse_key_lines).unwrap_or_default();
    if identity.authorized_keys.iter().any(|k| !present.contains(&k.trim().to_string())) {
        return Ok(false);
    }

    let sudoers = runner
        .read_file(&ctx.paths.sudoers_file(&identity.username))
        .await?;
    Ok(sudoers.as_deref() == Some(sudoers_entry(&identity.username).as_str()))
}

pub async fn is_satisfied(ctx: &OrchestratorContext) -> Result<bool> {
    for identity in ctx.identities() {
        if !identity_satisfied(ctx, identity).await? {
            return Ok(false);
        }
    }
    Ok(true)
}

async fn ensure_user(runner: &dyn CommandRunner, username: &str) -> Result<()> {
    if user_exists(runner, username).await {
        debug!("User {} already exists", username);
        return Ok(());
    }
    let argv = ["useradd", "--create-home", "--shell", "/bin/bash", username];
    let output = runner.run(&argv).await?;
    match output.exit_code {
        0 => {
            info!("Created user {}", username);
            Ok(())
        }
        // raced with another creator; the account is there, which is all we need
        9 => {
            warn!("useradd reports {} already exists", username);
            Ok(())
        }
        code => Err(SetupError::execution(
            display_command(&argv),
            Some(code),
            output.error_text(),
        )),
    }
}

async fn install_keys(runner: &dyn CommandRunner, identity: &AdminIdentity) -> Result<bool> {
    let user = identity.username.as_str();
    let owner = format!("{}:{}", user, user);
    let ssh_dir = identity.home().join(".ssh");
    let ssh_dir_str = ssh_dir.to_string_lossy().to_string();
    run_checked(
        runner,
        &["install", "-d", "-m", "700", "-o", user, "-g", user, &ssh_dir_str],
    )
    .await?;

    let path = identity.authorized_keys_path();
    let existing = runner.read_file(&path).await?;
    let merged = merge_keys(existing.as_deref(), &identity.authorized_keys);
    if existing.as_deref() == Some(merged.as_str()) {
        return Ok(false);
    }
    runner.write_file(&path, &merged, 0o600).await?;
    let path_str = path.to_string_lossy().to_string();
    run_checked(runner, &["chown", &owner, &path_str]).await?;
    Ok(true)
}

async fn install_sudoers(runner: &dyn CommandRunner, path: &Path, username: &str) -> Result<()> {
    let entry = sudoers_entry(username);
    if runner.read_file(path).await?.as_deref() == Some(entry.as_str()) {
        return Ok(());
    }
    runner.write_file(path, &entry, 0o440).await?;
    let path_str = path.to_string_lossy().to_string();
    if let Err(e) = run_checked(runner, &["visudo", "-cf", &path_str]).await {
        // an invalid drop-in breaks sudo for everyone
        runner.remove_file(path).await?;
        return Err(e);
    }
    Ok(())
}

async fn provision(ctx: &OrchestratorContext, identity: &AdminIdentity) -> Result<Vec<String>> {
    let runner = ctx.runner();
    let user = identity.username.as_str();
    let mut changes = Vec::new();

    ensure_user(runner, user).await?;

    let groups = user_groups(runner, user).await;
    for group in identity.groups.iter().filter(|g| !groups.contains(g)) {
        run_checked(runner, &["usermod", "-aG", group.as_str(), user]).await?;
        changes.push(format!("{} added to {}", user, group));
    }

    if install_keys(runner, identity).await? {
        changes.push(format!("{} keys installed", user));
    }
    install_sudoers(runner, &ctx.paths.sudoers_file(user), user).await?;
    Ok(changes)
}

pub async fn apply(ctx: &OrchestratorContext) -> Result<StageOutput> {
    let mut changes = Vec::new();
    for identity in ctx.identities() {
        changes.extend(provision(ctx, identity).await?);
    }
    let users: Vec<&str> = ctx.identities().map(|i| i.username.as_str()).collect();
    Ok(StageOutput::verified(if changes.is_empty() {
        format!("users {} ready", users.join(", "))
    } else {
        changes.join("; ")
    }))
}

pub fn preview(ctx: &OrchestratorContext) -> StagePreview {
    let mut preview = StagePreview::default();
    for identity in ctx.identities() {
        let user = &identity.username;
        preview = preview
            .file(identity.authorized_keys_path())
            .file(ctx.paths.sudoers_file(user))
            .command(format!("useradd --create-home --shell /bin/bash {}", user))
            .command(format!("usermod -aG {} {}", identity.groups.join(","), user));
    }
    preview
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::FakeHost;
    use crate::test_support::{fake_context, KEY};
    use std::sync::Arc;

    const OTHER_KEY: &str = "ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABAQC7 laptop@old";

    #[test]
    fn test_merge_keeps_existing_keys() {
        let merged = merge_keys(Some(format!("{}\n", OTHER_KEY).as_str()), &[KEY.to_string()]);
        assert_eq!(merged, format!("{}\n{}\n", OTHER_KEY, KEY));
        assert_eq!(merge_keys(Some(merged.as_str()), &[KEY.to_string()]), merged);
    }

    #[tokio::test]
    async fn test_admin_and_recovery_users() {
        let host = Arc::new(FakeHost::fresh_ubuntu());
        let (ctx, _dir) = fake_context(host.clone());
        let ctx = ctx.with_recovery(Some(AdminIdentity::new("rescue", vec![KEY.to_string()])));

        assert!(!is_satisfied(&ctx).await.unwrap());
        apply(&ctx).await.unwrap();

        let state = host.snapshot();
        assert!(state.users["ops"].contains("sudo"));
        assert!(state.users["rescue"].contains("sudo"));
        assert_eq!(host.file_mode("/home/ops/.ssh/authorized_keys"), Some(0o600));
        assert_eq!(host.file_mode("/etc/sudoers.d/90-ops"), Some(0o440));
        assert!(is_satisfied(&ctx).await.unwrap());

        host.clear_history();
        apply(&ctx).await.unwrap();
        assert!(!host.history().iter().any(|c| c.starts_with("useradd")));
        assert!(!host.history().iter().any(|c| c.starts_with("write")));
    }

    #[tokio::test]
    async fn test_existing_keys_are_preserved() {
        let host = Arc::new(FakeHost::fresh_ubuntu());
        host.run(&["useradd", "--create-home", "ops"]).await.unwrap();
        host.write_file(
            Path::new("/home/ops/.ssh/authorized_keys"),
            &format!("{}\n", OTHER_KEY),
            0o600,
        )
        .await
        .unwrap();
        let (ctx, _dir) = fake_context(host.clone());

        apply(&ctx).await.unwrap();
        let keys = host.file("/home/ops/.ssh/authorized_keys").unwrap();
        assert!(keys.contains(OTHER_KEY));
        assert!(keys.contains(KEY));
    }

    #[tokio::test]
    async fn test_invalid_sudoers_is_removed() {
        let host = Arc::new(FakeHost::fresh_ubuntu());
        host.fail_on("visudo", 1, "parse error");
        let (ctx, _dir) = fake_context(host.clone());

        assert!(apply(&ctx).await.is_err());
        assert!(host.file("/etc/sudoers.d/90-ops").is_none());
    }
}
