// file: src/logging/logger.rs
// version: 2.0.0
// guid: be697a8e-fe7f-4589-bf77-5a87b753a889

//! Logger initialization and configuration

use crate::Result;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging options taken from the global CLI flags
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub verbose: bool,
    pub quiet: bool,
    /// JSON lines on stdout instead of the compact format
    pub json: bool,
    /// Run log; falls back to the working directory when not writable
    pub file: Option<PathBuf>,
}

/// Filter directive for the verbosity flags
pub fn level_directive(verbose: bool, quiet: bool) -> &'static str {
    if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        "info"
    }
}

/// Open the run log for appending, trying the working directory second
pub fn open_log_file(path: &Path) -> Option<(File, PathBuf)> {
    let open = |p: &Path| OpenOptions::new().create(true).append(true).open(p);
    if let Ok(file) = open(path) {
        return Some((file, path.to_path_buf()));
    }
    let fallback = PathBuf::from(path.file_name()?);
    open(&fallback).ok().map(|file| (file, fallback))
}

/// Initialize the logging system.
///
/// Returns the run log actually in use, if any.
pub fn init_logger(options: &LogOptions) -> Result<Option<PathBuf>> {
    let filter = EnvFilter::new(level_directive(options.verbose, options.quiet));

    let log_file = options.file.as_deref().and_then(open_log_file);
    let log_path = log_file.as_ref().map(|(_, p)| p.clone());
    let file_layer = log_file.map(|(file, _)| {
        fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(Mutex::new(file))
    });

    let (compact_layer, json_layer) = if options.json {
        (None, Some(fmt::layer().json().with_target(false)))
    } else {
        (
            Some(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false)
                    .compact(),
            ),
            None,
        )
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(compact_layer)
        .with(json_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| crate::SetupError::config(format!("Failed to initialize logger: {}", e)))?;

    Ok(log_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_level_directive() {
        assert_eq!(level_directive(false, false), "info");
        assert_eq!(level_directive(true, false), "debug");
        assert_eq!(level_directive(true, true), "error");
    }

    #[test]
    fn test_open_log_file_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.log");
        std::fs::write(&path, "first\n").unwrap();

        let (mut file, used) = open_log_file(&path).unwrap();
        std::io::Write::write_all(&mut file, b"second\n").unwrap();
        assert_eq!(used, path);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }
}
