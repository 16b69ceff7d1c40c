// file: src/cli/mod.rs
// version: 2.0.0
// guid: 9c37e14d-29d0-42c6-a749-182a3cf656d3

//! Command line interface for container-host-setup

pub mod args;
pub mod commands;
pub mod prompt;

pub use args::Cli;
pub use commands::*;
