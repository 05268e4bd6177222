//! Logging and tracing configuration
//!
//! Stdout may carry the DAP stream (stdio transport), so logs only ever go
//! to stderr and, optionally, a file.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter when `RUST_LOG` is not set
const DEFAULT_FILTER: &str = "dap_bridge=info,warn";

/// Initialize tracing for the server
///
/// Logs are controlled by the `RUST_LOG` environment variable, falling back
/// to `level` and then to INFO for this crate. When `log_file` is given a
/// second, non-blocking file layer is attached; keep the returned guard
/// alive for as long as logs should be flushed.
pub fn init(level: Option<&str>, log_file: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or(DEFAULT_FILTER)));

    let Some(path) = log_file else {
        init_stderr(filter);
        return None;
    };

    let directory = path.parent().filter(|p| !p.as_os_str().is_empty());
    let Some(file_name) = path.file_name() else {
        eprintln!("Warning: Invalid log file path: {}", path.display());
        init_stderr(filter);
        return None;
    };

    let dir = directory.unwrap_or_else(|| Path::new("."));
    if let Err(e) = std::fs::create_dir_all(dir) {
        eprintln!("Warning: Could not create log directory: {}", e);
    }
    let appender = tracing_appender::rolling::never(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .compact();

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();

    Some(guard)
}

fn init_stderr(filter: EnvFilter) {
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .compact(),
        )
        .init();
}
