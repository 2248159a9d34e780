//! Logging setup shared by the role binaries.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Re-export the tracing macros for convenience.
pub use tracing::{debug, error, info, trace, warn};

/// Initialize the logging system. Call once at program startup, before any
/// task is spawned.
///
/// The default filter is `info`, or `debug` in verbose mode; `RUST_LOG`
/// overrides both. When `log_path` is set the log additionally goes to that
/// file, opened append-only, through a non-blocking writer; the returned
/// guard must stay alive for the life of the process or trailing log lines
/// are lost.
pub fn init(
    verbose: bool,
    log_path: Option<&Path>,
) -> io::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (file_layer, guard) = match log_path {
        None => (None, None),
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let (non_blocking, guard) = tracing_appender::non_blocking(file);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking)
                .boxed();
            (Some(layer), Some(guard))
        }
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}
