// file: src/orchestrator/interrupt.rs
// version: 1.0.0
// guid: 03c00250-6c99-48dc-a116-c1fd8177c923

//! Interrupt latch and the runner wrapper that honours it
//!
//! A signal never drops a running command. The latch is tripped, the command
//! in flight finishes, and every later command is refused until the
//! orchestrator releases the latch for its own cleanup.

use crate::runner::{display_command, CommandOutput, CommandRunner};
use crate::{Result, SetupError};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Default)]
struct LatchState {
    signal: Option<String>,
    released: bool,
}

/// Shared record of the first signal received during a run
#[derive(Debug, Clone, Default)]
pub struct InterruptLatch {
    state: Arc<Mutex<LatchState>>,
}

impl InterruptLatch {
    fn with_state<R>(&self, f: impl FnOnce(&mut LatchState) -> R) -> R {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    /// Record a signal; later signals are ignored
    pub fn trip(&self, signal: impl Into<String>) {
        let signal = signal.into();
        self.with_state(|s| {
            if s.signal.is_none() {
                s.signal = Some(signal);
            }
        });
    }

    pub fn signal(&self) -> Option<String> {
        self.with_state(|s| s.signal.clone())
    }

    /// Signal that currently blocks new commands
    pub fn blocking(&self) -> Option<String> {
        self.with_state(|s| if s.released { None } else { s.signal.clone() })
    }

    /// Allow commands again once the interrupted work has stopped
    pub fn release(&self) {
        self.with_state(|s| s.released = true);
    }
}

/// Refuses to start processes once the latch is tripped
pub struct GatedRunner {
    inner: Arc<dyn CommandRunner>,
    latch: InterruptLatch,
}

impl GatedRunner {
    pub fn new(inner: Arc<dyn CommandRunner>, latch: InterruptLatch) -> Self {
        Self { inner, latch }
    }
}

#[async_trait::async_trait]
impl CommandRunner for GatedRunner {
    async fn run(&self, argv: &[&str]) -> Result<CommandOutput> {
        if let Some(signal) = self.latch.blocking() {
            warn!("{} received, not starting: {}", signal, display_command(argv));
            return Err(SetupError::Interrupted(signal));
        }
        self.inner.run(argv).await
    }

    async fn read_file(&self, path: &Path) -> Result<Option<String>> {
        self.inner.read_file(path).await
    }

    // Writes stay open so a stage can put back what it replaced
    async fn write_file(&self, path: &Path, contents: &str, mode: u32) -> Result<()> {
        self.inner.write_file(path, contents, mode).await
    }

    async fn remove_file(&self, path: &Path) -> Result<()> {
        self.inner.remove_file(path).await
    }

    async fn sleep(&self, duration: Duration) {
        if self.latch.blocking().is_none() {
            self.inner.sleep(duration).await;
        }
    }
}
