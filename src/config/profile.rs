// file: src/config/profile.rs
// version: 1.0.0
// guid: d0bce516-b3b2-4cdd-8c50-dce11cbac122

//! YAML setup profile
//!
//! Every field is optional so a profile can be layered under CLI flags.

use super::{
    parse_key_lines, validate_public_key, validate_username, AdminIdentity, ContainerRuntime,
    IntrusionPrevention, ProxySettings, RootLoginPolicy,
};
use crate::ports::validate_range;
use crate::{Result, SetupError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityProfile {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub authorized_keys: Vec<String>,
    /// File of public keys, `~` and `$VAR` are expanded
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

impl IdentityProfile {
    fn overlay(self, other: IdentityProfile) -> IdentityProfile {
        IdentityProfile {
            username: other.username.or(self.username),
            authorized_keys: if other.authorized_keys.is_empty() {
                self.authorized_keys
            } else {
                other.authorized_keys
            },
            key_file: other.key_file.or(self.key_file),
        }
    }

    /// Inline keys followed by the keys read from `key_file`
    pub fn collect_keys(&self) -> Result<Vec<String>> {
        let mut keys = self.authorized_keys.clone();
        if let Some(file) = &self.key_file {
            let raw = file.to_string_lossy();
            let expanded = shellexpand::full(&raw)
                .map_err(|e| SetupError::config(format!("Cannot expand {}: {}", raw, e)))?;
            debug!("Reading public keys from {}", expanded);
            let contents = std::fs::read_to_string(expanded.as_ref()).map_err(|e| {
                SetupError::config(format!("Failed to read key file {}: {}", expanded, e))
            })?;
            for key in parse_key_lines(&contents) {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }

    /// Resolve into a validated identity; `None` when no username is set
    pub fn resolve(&self) -> Result<Option<AdminIdentity>> {
        match &self.username {
            Some(username) => {
                let identity = AdminIdentity::new(username.clone(), self.collect_keys()?);
                identity.validate()?;
                Ok(Some(identity))
            }
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortsProfile {
    #[serde(default)]
    pub ssh: Option<u32>,
    #[serde(default)]
    pub kube_api: Option<u32>,
}

/// Optional settings supplied by `--config` or assembled from CLI flags
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetupProfile {
    #[serde(default)]
    pub admin: IdentityProfile,
    #[serde(default)]
    pub recovery: Option<IdentityProfile>,
    #[serde(default)]
    pub ports: PortsProfile,
    #[serde(default)]
    pub runtime: Option<ContainerRuntime>,
    #[serde(default)]
    pub intrusion: Option<IntrusionPrevention>,
    #[serde(default)]
    pub proxy: Option<ProxySettings>,
    #[serde(default)]
    pub permit_root_login: Option<RootLoginPolicy>,
}

impl SetupProfile {
    /// Layer `other` on top of `self`; values set in `other` win
    pub fn overlay(self, other: SetupProfile) -> SetupProfile {
        let recovery = match (self.recovery, other.recovery) {
            (Some(base), Some(top)) => Some(base.overlay(top)),
            (base, top) => top.or(base),
        };
        SetupProfile {
            admin: self.admin.overlay(other.admin),
            recovery,
            ports: PortsProfile {
                ssh: other.ports.ssh.or(self.ports.ssh),
                kube_api: other.ports.kube_api.or(self.ports.kube_api),
            },
            runtime: other.runtime.or(self.runtime),
            intrusion: other.intrusion.or(self.intrusion),
            proxy: other.proxy.or(self.proxy),
            permit_root_login: other.permit_root_login.or(self.permit_root_login),
        }
    }

    /// Check whatever is present; absent values are not an error here
    pub fn validate(&self) -> Result<()> {
        if let Some(username) = &self.admin.username {
            validate_username(username)?;
        }
        for key in &self.admin.authorized_keys {
            validate_public_key(key)?;
        }
        if let Some(recovery) = &self.recovery {
            if let Some(username) = &recovery.username {
                validate_username(username)?;
                if Some(username) == self.admin.username.as_ref() {
                    return Err(SetupError::config(
                        "The recovery user must differ from the admin user",
                    ));
                }
            }
            for key in &recovery.authorized_keys {
                validate_public_key(key)?;
            }
        }
        for port in [self.ports.ssh, self.ports.kube_api].into_iter().flatten() {
            validate_range(port)?;
        }
        if let (Some(ssh), Some(api)) = (self.ports.ssh, self.ports.kube_api) {
            if ssh == api {
                return Err(SetupError::config(format!(
                    "SSH and Kubernetes API cannot share port {}",
                    ssh
                )));
            }
        }
        if let Some(proxy) = &self.proxy {
            proxy.validate()?;
        }
        Ok(())
    }

    /// Recovery identity, falling back to the admin keys when none are given
    pub fn resolve_recovery(&self, admin: &AdminIdentity) -> Result<Option<AdminIdentity>> {
        let Some(recovery) = &self.recovery else {
            return Ok(None);
        };
        let Some(username) = &recovery.username else {
            return Ok(None);
        };
        let mut keys = recovery.collect_keys()?;
        if keys.is_empty() {
            keys = admin.authorized_keys.clone();
        }
        let identity = AdminIdentity::new(username.clone(), keys);
        identity.validate()?;
        Ok(Some(identity))
    }
}
