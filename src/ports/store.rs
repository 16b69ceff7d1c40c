// file: src/ports/store.rs
// version: 1.0.0
// guid: ecbfe499-f813-416b-b564-9dcac01f89be

//! `KEY=VALUE` persistence for the port registry

use super::{PortRegistry, Service};
use crate::{Result, SetupError};
use std::fs;
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::Path;
use tracing::{debug, info, warn};

/// Default location of the persisted registry
pub const DEFAULT_PORTS_FILE: &str = "/etc/container-host-setup/ports.conf";

const HEADER: &str = "# container-host-setup port assignments\n\
# Managed file: change values with `container-host-setup ports set <service> <port>`\n";

/// Render assignments in canonical service order
pub fn render(registry: &PortRegistry) -> String {
    let mut out = String::from(HEADER);
    for service in Service::ALL {
        out.push_str(&format!("{}={}\n", service.config_key(), registry.port(service)));
    }
    out
}

/// Split a ports file into raw `(KEY, VALUE)` pairs.
///
/// Comments and blank lines are skipped, surrounding quotes are stripped and
/// malformed lines are logged and ignored. Values are not validated here.
pub fn parse(contents: &str) -> Vec<(String, String)> {
    contents
        .lines()
        .enumerate()
        .filter_map(|(idx, line)| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);
            match line.split_once('=') {
                Some((key, value)) => Some((
                    key.trim().to_string(),
                    value.trim().trim_matches(|c| c == '"' || c == '\'').to_string(),
                )),
                None => {
                    warn!("Ignoring malformed line {} in ports file: {}", idx + 1, line);
                    None
                }
            }
        })
        .collect()
}

impl PortRegistry {
    /// Load and repair a persisted registry; `None` when no file exists
    pub fn load(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        let metadata = match fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No ports file at {}", path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let mode = metadata.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            warn!(
                "Ports file {} has mode {:o}; tightening to 600",
                path.display(),
                mode
            );
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }

        let contents = fs::read_to_string(path)?;
        let registry = Self::from_entries(path, &parse(&contents));
        info!(
            "Loaded port assignments from {} ({} repaired)",
            path.display(),
            registry.repairs().len()
        );
        Ok(Some(registry))
    }

    /// Load the registry at `path`, or start from defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        Ok(Self::load(path)?.unwrap_or_else(|| Self::with_defaults(path)))
    }

    pub fn render(&self) -> String {
        render(self)
    }

    /// Atomically write the registry with owner-only permissions
    pub fn persist(&self) -> Result<()> {
        let path = self.path();
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        if !dir.exists() {
            fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)?;
        }

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.as_file().set_permissions(fs::Permissions::from_mode(0o600))?;
        tmp.write_all(self.render().as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path)
            .map_err(|e| SetupError::Io(e.error))?;
        info!("Persisted port assignments to {}", path.display());
        Ok(())
    }
}
