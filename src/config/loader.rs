// file: src/config/loader.rs
// version: 2.0.0
// guid: d1119163-921d-4f72-98e2-f07d829e301a

//! Configuration file loading and environment variable substitution

use super::SetupProfile;
use crate::{Result, SetupError};
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Configuration loader with environment variable substitution
pub struct ConfigLoader {
    env_vars: HashMap<String, String>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self {
            env_vars: std::env::vars().collect(),
        }
    }

    /// Load a setup profile from a YAML file
    pub fn load_profile<P: AsRef<Path>>(&self, path: P) -> Result<SetupProfile> {
        let content = fs::read_to_string(&path).map_err(|e| {
            SetupError::config(format!(
                "Failed to read setup profile {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        let expanded = self.expand_env_vars(&content)?;
        let profile: SetupProfile = serde_yaml::from_str(&expanded)?;

        profile.validate()?;

        Ok(profile)
    }

    /// Expand `${VAR}` placeholders in configuration content
    fn expand_env_vars(&self, content: &str) -> Result<String> {
        let re = Regex::new(r"\$\{([^}]+)\}")
            .map_err(|e| SetupError::config(format!("Invalid regex pattern: {}", e)))?;

        let mut missing_vars = Vec::new();
        let result = re.replace_all(content, |caps: &regex::Captures| {
            match self.env_vars.get(&caps[1]) {
                Some(value) => value.clone(),
                None => {
                    missing_vars.push(caps[1].to_string());
                    String::new()
                }
            }
        });

        if !missing_vars.is_empty() {
            return Err(SetupError::config(format!(
                "Missing environment variables: {}",
                missing_vars.join(", ")
            )));
        }

        Ok(result.into_owned())
    }

    /// Set environment variable for substitution
    pub fn set_env_var(&mut self, key: String, value: String) {
        self.env_vars.insert(key, value);
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContainerRuntime;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_env_var_expansion() {
        let mut loader = ConfigLoader::new();
        loader.set_env_var("TEST_VAR".to_string(), "test_value".to_string());

        let content = "key: ${TEST_VAR}";
        let result = loader.expand_env_vars(content).unwrap();
        assert_eq!(result, "key: test_value");
    }

    #[test]
    fn test_missing_env_var() {
        let loader = ConfigLoader::new();
        let content = "key: ${CHS_SURELY_MISSING_VAR}";

        let result = loader.expand_env_vars(content);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Missing environment variables"));
    }

    #[test]
    fn test_load_profile() -> Result<()> {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
admin:
  username: ${{CHS_TEST_ADMIN}}
  authorized_keys:
    - ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl ops@laptop
ports:
  ssh: 2222
runtime: k3s
"#
        )
        .unwrap();

        let mut loader = ConfigLoader::new();
        loader.set_env_var("CHS_TEST_ADMIN".to_string(), "ops".to_string());
        let profile = loader.load_profile(file.path())?;

        assert_eq!(profile.admin.username.as_deref(), Some("ops"));
        assert_eq!(profile.ports.ssh, Some(2222));
        assert_eq!(profile.runtime, Some(ContainerRuntime::K3s));

        Ok(())
    }

    #[test]
    fn test_invalid_profile_is_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "admin:\n  username: root\n").unwrap();
        let loader = ConfigLoader::new();
        assert!(loader.load_profile(file.path()).is_err());
    }
}
