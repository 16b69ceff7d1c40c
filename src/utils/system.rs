// file: src/utils/system.rs
// version: 2.0.0
// guid: 742de636-1bb4-4b30-ac11-2cdeedf4ef69

//! Local system checks made before a live run

use tracing::{debug, warn};

/// Tools every live run shells out to
pub const REQUIRED_COMMANDS: [&str; 5] = ["apt-get", "dpkg-query", "systemctl", "ss", "sshd"];

/// System utility functions
pub struct SystemUtils;

impl SystemUtils {
    /// Check if a command exists in PATH
    pub fn command_exists(command: &str) -> bool {
        match which::which(command) {
            Ok(path) => {
                debug!("found {} at {}", command, path.display());
                true
            }
            Err(_) => false,
        }
    }

    /// Check if running with an effective uid of 0
    pub fn is_root() -> bool {
        #[cfg(unix)]
        {
            unsafe { libc::geteuid() == 0 }
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    /// Names of required tools missing from PATH
    pub fn check_prerequisites() -> Vec<String> {
        let missing: Vec<String> = REQUIRED_COMMANDS
            .iter()
            .filter(|cmd| !Self::command_exists(cmd))
            .map(|cmd| cmd.to_string())
            .collect();
        if !Self::command_exists("ufw") {
            warn!("ufw not found; it will be installed by the system update stage");
        }
        missing
    }
}
