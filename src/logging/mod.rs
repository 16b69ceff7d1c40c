// file: src/logging/mod.rs
// version: 2.0.0
// guid: 84d32acb-7ec0-4355-92fa-13fb25afb266

//! Logging for container-host-setup

pub mod logger;

pub use logger::{init_logger, LogOptions};

use tracing::Instrument;

/// Run `f` inside an `operation` span carrying the run id
pub async fn with_run_span<F, Fut, R>(operation: &str, run_id: &str, f: F) -> R
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = R>,
{
    let span = tracing::info_span!("operation", name = operation, run = run_id);
    async move { f().await }.instrument(span).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_run_span_returns_value() {
        let result = with_run_span("setup", "1234", || async { 2 + 2 }).await;
        assert_eq!(result, 4);
    }
}
