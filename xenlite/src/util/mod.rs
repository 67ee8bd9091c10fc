use std::path::Path;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};
use xenlite_shared::errors::{XenliteError, XenliteResult};

/// Log file name inside the log directory (rotated daily).
pub const LOG_FILE: &str = "xenlite.log";

/// Initialize tracing with file logging.
///
/// Logs are written to {log_dir}/xenlite.log with daily rotation. The filter
/// defaults to "info" unless RUST_LOG says otherwise. Returns the WorkerGuard
/// that keeps the background writer alive.
pub fn init_logging(log_dir: &Path) -> XenliteResult<WorkerGuard> {
    std::fs::create_dir_all(log_dir).map_err(|e| XenliteError::io(log_dir, e))?;

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    register_to_tracing(non_blocking, env_filter);

    Ok(guard)
}

/// Install the global subscriber. A subscriber installed earlier wins.
pub fn register_to_tracing(non_blocking: NonBlocking, env_filter: EnvFilter) {
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(false),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_creates_dir() {
        let temp = tempfile::TempDir::new().unwrap();
        let logs = temp.path().join("logs");
        let guard = init_logging(&logs).unwrap();
        tracing::info!("logging initialized");
        drop(guard);
        assert!(logs.is_dir());
    }
}
