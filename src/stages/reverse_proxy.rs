// file: src/stages/reverse_proxy.rs
// version: 1.0.0
// guid: 7f04c2da-621a-49a7-83fa-6489cbc802f7

//! nginx site with a Let's Encrypt certificate

use super::{install_missing, packages_installed, StageOutput, StagePreview};
use crate::config::ProxySettings;
use crate::context::OrchestratorContext;
use crate::probe::{path_exists, unit_active};
use crate::runner::run_checked;
use crate::{Result, SetupError};
use std::path::PathBuf;
use tracing::{debug, info};

const PACKAGES: [&str; 3] = ["nginx", "certbot", "python3-certbot-nginx"];

fn settings(ctx: &OrchestratorContext) -> Result<&ProxySettings> {
    ctx.proxy
        .as_ref()
        .ok_or_else(|| SetupError::config("reverse proxy stage needs a domain"))
}

fn site_path(ctx: &OrchestratorContext, domain: &str) -> PathBuf {
    ctx.paths.nginx_sites_available.join(domain)
}

fn enabled_path(ctx: &OrchestratorContext, domain: &str) -> PathBuf {
    ctx.paths.nginx_sites_enabled.join(domain)
}

pub fn certificate_path(domain: &str) -> PathBuf {
    PathBuf::from("/etc/letsencrypt/live")
        .join(domain)
        .join("fullchain.pem")
}

/// Plain HTTP site; certbot adds the TLS server block itself
pub fn site_config(proxy: &ProxySettings) -> String {
    format!(
        "# Managed by container-host-setup\n\
         server {{\n\
         \x20   listen 80;\n\
         \x20   listen [::]:80;\n\
         \x20   server_name {domain};\n\
         \n\
         \x20   location / {{\n\
         \x20       proxy_pass {upstream};\n\
         \x20       proxy_set_header Host $host;\n\
         \x20       proxy_set_header X-Real-IP $remote_addr;\n\
         \x20       proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n\
         \x20       proxy_set_header X-Forwarded-Proto $scheme;\n\
         \x20   }}\n\
         }}\n",
        domain = proxy.domain,
        upstream = proxy.upstream
    )
}

pub async fn is_satisfied(ctx: &OrchestratorContext) -> Result<bool> {
    let runner = ctx.runner();
    let proxy = settings(ctx)?;
    Ok(packages_installed(runner, &PACKAGES).await
        && runner.read_file(&site_path(ctx, &proxy.domain)).await?.is_some()
        && path_exists(runner, &enabled_path(ctx, &proxy.domain)).await
        && path_exists(runner, &certificate_path(&proxy.domain)).await
        && unit_active(runner, "nginx").await)
}

pub async fn apply(ctx: &OrchestratorContext) -> Result<StageOutput> {
    let runner = ctx.runner();
    let proxy = settings(ctx)?;
    install_missing(runner, &PACKAGES).await?;

    let site = site_path(ctx, &proxy.domain);
    if runner.read_file(&site).await?.is_none() {
        runner.write_file(&site, &site_config(proxy), 0o644).await?;
    } else {
        // certbot rewrites the site after issuing; leave it alone
        debug!("Keeping existing nginx site {}", site.display());
    }

    let site_str = site.to_string_lossy().to_string();
    let enabled = enabled_path(ctx, &proxy.domain).to_string_lossy().to_string();
    run_checked(runner, &["ln", "-sf", &site_str, &enabled]).await?;
    run_checked(runner, &["nginx", "-t"]).await?;
    run_checked(runner, &["systemctl", "enable", "--now", "nginx"]).await?;
    run_checked(runner, &["systemctl", "reload", "nginx"]).await?;

    if !path_exists(runner, &certificate_path(&proxy.domain)).await {
        info!("Requesting certificate for {}", proxy.domain);
        let mut argv = vec![
            "certbot",
            "--nginx",
            "-d",
            proxy.domain.as_str(),
            "--agree-tos",
            "--non-interactive",
            "--redirect",
        ];
        match &proxy.email {
            Some(email) => argv.extend(["-m", email.as_str()]),
            None => argv.push("--register-unsafely-without-email"),
        }
        run_checked(runner, &argv).await?;
    }

    Ok(StageOutput::verified(format!("https://{} proxied to {}", proxy.domain, proxy.upstream)))
}

pub fn preview(ctx: &OrchestratorContext) -> StagePreview {
    let Some(proxy) = ctx.proxy.as_ref() else {
        return StagePreview::default();
    };
    StagePreview::default()
        .file(site_path(ctx, &proxy.domain))
        .file(enabled_path(ctx, &proxy.domain))
        .service("nginx")
        .command(format!("apt-get install -y {}", PACKAGES.join(" ")))
        .command("nginx -t")
        .command(format!("certbot --nginx -d {} --agree-tos --non-interactive --redirect", proxy.domain))
}
