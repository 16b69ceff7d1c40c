// file: src/lib.rs
// version: 3.0.0
// guid: f9047f71-4712-4525-8425-f895b8d67a2c

//! # container-host-setup
//!
//! Provisions a Debian/Ubuntu host for containers (runtime, intrusion
//! prevention, optional TLS reverse proxy, admin users, firewall) and then
//! moves SSH to a key-only configuration on a new port. SSH hardening is the
//! terminal stage and only runs once the host has been verified reachable.
//!
//! Every host interaction goes through [`runner::CommandRunner`], so whole
//! runs can be replayed against [`runner::FakeHost`].

pub mod cli;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod ports;
pub mod probe;
pub mod recovery;
pub mod reporter;
pub mod runner;
pub mod stages;
pub mod steps;
pub mod utils;
pub mod validation;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{Result, SetupError};

/// Version information for the utility
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
