// file: src/error.rs
// version: 3.0.0
// guid: d41faaa8-25bd-4e04-b6d1-e3033c0d31da

use crate::ports::PortError;
use crate::stages::Criticality;
use thiserror::Error;

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, SetupError>;

/// Error types for container host provisioning
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Port assignment error: {0}")]
    Port(#[from] PortError),

    /// Pre-conditions unmet; raised before any mutation happens
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A provisioning stage failed
    #[error("Stage '{stage}' failed ({criticality}): {message}")]
    Step {
        stage: String,
        criticality: Criticality,
        command: Option<String>,
        exit_code: Option<i32>,
        message: String,
    },

    /// The host does not match intent after the install stages
    #[error("Postcondition failed: {0}")]
    Postcondition(String),

    #[error("Interrupted by {0}")]
    Interrupted(String),

    #[error("Command '{command}' failed with exit code {exit_code:?}: {stderr}")]
    Execution {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl SetupError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new postcondition error
    pub fn postcondition(msg: impl Into<String>) -> Self {
        Self::Postcondition(msg.into())
    }

    /// Create a new execution error from a finished process
    pub fn execution(command: impl Into<String>, exit_code: Option<i32>, stderr: impl Into<String>) -> Self {
        Self::Execution {
            command: command.into(),
            exit_code,
            stderr: stderr.into(),
        }
    }

    /// The command that triggered this error, when one is known
    pub fn failing_command(&self) -> Option<&str> {
        match self {
            Self::Step { command, .. } => command.as_deref(),
            Self::Execution { command, .. } => Some(command),
            _ => None,
        }
    }

    /// Process exit code for this error.
    ///
    /// The failing command's own code is propagated when available.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Interrupted(_) => 130,
            Self::Validation(_) => 2,
            Self::Step {
                exit_code: Some(code),
                ..
            }
            | Self::Execution {
                exit_code: Some(code),
                ..
            } if *code > 0 && *code < 256 => *code,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_exit_code() {
        assert_eq!(SetupError::Interrupted("SIGINT".into()).exit_code(), 130);
    }

    #[test]
    fn test_step_failure_propagates_command_exit_code() {
        let err = SetupError::Step {
            stage: "firewall".into(),
            criticality: Criticality::MustNotFail,
            command: Some("ufw --force enable".into()),
            exit_code: Some(100),
            message: "boom".into(),
        };
        assert_eq!(err.exit_code(), 100);
        assert_eq!(err.failing_command(), Some("ufw --force enable"));
    }

    #[test]
    fn test_unknown_exit_code_falls_back_to_one() {
        let err = SetupError::execution("k3s", None, "killed");
        assert_eq!(err.exit_code(), 1);
        assert_eq!(SetupError::postcondition("ssh down").exit_code(), 1);
        assert_eq!(SetupError::validation("disk").exit_code(), 2);
    }
}
